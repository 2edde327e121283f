//! DDP Client Integration Tests
//!
//! Runs the Meteor client against a scripted in-process WebSocket server.
//!
//! # Test Scenarios
//! - Handshake, subscription and display mirroring
//! - Password login with a SHA-256 digest, login and subscription failures
//! - Vote calls with positional parameters
//! - Reconnection replaying the resume token, or the password once it expires
//!
//! Run with: `cargo test -p bridge --test ddp_client_tests`

use bridge::network::{ClientOptions, Credentials, DdpClient, Readiness};
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, clicker_response_bytes, response_frame, with_timeout,
};
use common::{ResponseSink, SinkCommand, SinkHandle, create_sink_bridge};
use futures_util::{SinkExt, StreamExt};
use protocol::Response;
use serde_json::{Value, json};
use std::time::{Duration, SystemTime};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// How one connection to the fake server behaves
#[derive(Clone, Copy)]
struct Script {
    accept_login: bool,
    accept_resume: bool,
    accept_subscription: bool,
    close_after_ready: bool,
}

const HAPPY: Script = Script {
    accept_login: true,
    accept_resume: true,
    accept_subscription: true,
    close_after_ready: false,
};

/// Messages the fake server received, tagged with the connection index
type Seen = mpsc::UnboundedReceiver<(usize, Value)>;

async fn fake_meteor(scripts: Vec<Script>) -> (String, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/websocket", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for (index, script) in scripts.into_iter().enumerate() {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            serve_connection(stream, index, script, &seen_tx).await;
        }
    });

    (url, seen_rx)
}

async fn serve_connection(
    stream: TcpStream,
    index: usize,
    script: Script,
    seen: &mpsc::UnboundedSender<(usize, Value)>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let msg: Value = serde_json::from_str(&text).unwrap();
        let _ = seen.send((index, msg.clone()));

        let id = msg["id"].clone();
        let resuming = msg["params"][0].get("resume").is_some();
        let accepted = if resuming {
            script.accept_resume
        } else {
            script.accept_login
        };
        let replies = match (msg["msg"].as_str(), msg["method"].as_str()) {
            (Some("connect"), _) => vec![
                json!({"msg": "connected", "session": format!("s{}", index)}),
                json!({"msg": "ping", "id": "p1"}),
            ],
            (Some("method"), Some("login")) if accepted => vec![
                json!({"msg": "result", "id": id, "result": {"id": "u1", "token": "tok"}}),
            ],
            (Some("method"), Some("login")) => vec![json!({
                "msg": "result",
                "id": id,
                "error": {"error": 403, "reason": "Incorrect password"}
            })],
            (Some("sub"), _) if script.accept_subscription => vec![
                json!({
                    "msg": "added",
                    "collection": "display",
                    "id": "d1",
                    "fields": {"line": "Question 1"}
                }),
                json!({"msg": "ready", "subs": [id]}),
            ],
            (Some("sub"), _) => vec![json!({
                "msg": "nosub",
                "id": id,
                "error": {"error": 404, "reason": "Subscription not found"}
            })],
            (Some("method"), _) => vec![json!({"msg": "result", "id": id, "result": null})],
            _ => Vec::new(),
        };

        for reply in replies {
            if ws.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }

        if script.close_after_ready && msg["msg"] == "sub" {
            let _ = ws.close(None).await;
            return;
        }
    }
}

struct Client {
    handle: SinkHandle,
    ready: oneshot::Receiver<Readiness>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn start_client(url: String, credentials: Option<Credentials>) -> Client {
    let (handle, worker) = create_sink_bridge();
    let (ready_tx, ready) = oneshot::channel();
    let client = DdpClient::new(
        ClientOptions {
            url,
            credentials,
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
        },
        worker,
    );
    let task = tokio::spawn(client.run(ready_tx));
    Client {
        handle,
        ready,
        task,
    }
}

fn instructor() -> Option<Credentials> {
    Some(Credentials {
        username: "instructor".to_string(),
        password: "abc".to_string(),
    })
}

fn vote(answer: u8, seq: u8) -> Response {
    let frame = response_frame(Some(clicker_response_bytes(answer, [0x12, 0x34, 0x56], seq)), None);
    let info = frame.split_responses().remove(0);
    Response::from_info(&info, SystemTime::now()).unwrap()
}

/// Wait for the next received message matching `wanted`
async fn expect_seen(seen: &mut Seen, wanted: impl Fn(usize, &Value) -> bool) -> Value {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            let (index, msg) = seen.recv().await.expect("fake server stopped");
            if wanted(index, &msg) {
                return msg;
            }
        }
    })
    .await
    .expect("message not received")
}

async fn readiness(client: &mut Client) -> Readiness {
    with_timeout(DEFAULT_TEST_TIMEOUT, &mut client.ready)
        .await
        .expect("no readiness reported")
        .expect("client dropped readiness")
}

async fn shutdown(client: Client) {
    client
        .handle
        .send_command(SinkCommand::Shutdown)
        .await
        .unwrap();
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, client.task)
        .await
        .expect("client did not shut down")
        .expect("client task panicked");
    assert!(result.is_ok());
}

// ============================================================================
// Session Setup Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_and_display_mirror() {
    let (url, mut seen) = fake_meteor(vec![HAPPY]).await;
    let mut client = start_client(url, None);

    let connect = expect_seen(&mut seen, |_, m| m["msg"] == "connect").await;
    assert_eq!(connect["version"], "1");
    assert_eq!(connect["support"], json!(["1", "pre2", "pre1"]));

    let sub = expect_seen(&mut seen, |_, m| m["msg"] == "sub").await;
    assert_eq!(sub["name"], "display");

    assert_eq!(readiness(&mut client).await, Readiness::Ready);
    assert_eq!(client.handle.display_text().unwrap(), "Question 1");

    let pong = expect_seen(&mut seen, |_, m| m["msg"] == "pong").await;
    assert_eq!(pong["id"], "p1");

    shutdown(client).await;
}

#[tokio::test]
async fn test_password_login_sends_digest() {
    let (url, mut seen) = fake_meteor(vec![HAPPY]).await;
    let mut client = start_client(url, instructor());

    let login = expect_seen(&mut seen, |_, m| m["method"] == "login").await;
    assert_eq!(
        login["params"],
        json!([{
            "user": {"username": "instructor"},
            "password": {
                "digest": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "algorithm": "sha-256"
            }
        }])
    );

    assert_eq!(readiness(&mut client).await, Readiness::Ready);
    shutdown(client).await;
}

#[tokio::test]
async fn test_login_failure_is_reported() {
    let script = Script {
        accept_login: false,
        ..HAPPY
    };
    let (url, _seen) = fake_meteor(vec![script]).await;
    let mut client = start_client(url, instructor());

    assert_eq!(
        readiness(&mut client).await,
        Readiness::LoginFailed("Incorrect password [403]".to_string())
    );
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, client.task).await.unwrap();
    assert!(result.unwrap().is_err());
    assert!(client.handle.is_closed());
}

#[tokio::test]
async fn test_subscription_failure_is_reported() {
    let script = Script {
        accept_subscription: false,
        ..HAPPY
    };
    let (url, _seen) = fake_meteor(vec![script]).await;
    let mut client = start_client(url, None);

    assert_eq!(
        readiness(&mut client).await,
        Readiness::SubscriptionFailed("Subscription not found [404]".to_string())
    );
}

#[tokio::test]
async fn test_unreachable_server_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/websocket", listener.local_addr().unwrap());
    drop(listener);

    let mut client = start_client(url, None);
    assert!(matches!(
        readiness(&mut client).await,
        Readiness::ConnectFailed(_)
    ));
}

// ============================================================================
// Vote Tests
// ============================================================================

#[tokio::test]
async fn test_votes_become_method_calls() {
    let (url, mut seen) = fake_meteor(vec![HAPPY]).await;
    let mut client = start_client(url, None);
    assert_eq!(readiness(&mut client).await, Readiness::Ready);

    for (answer, seq) in [(0x82, 1), (0x84, 2)] {
        client
            .handle
            .send_command(SinkCommand::Vote {
                response: vote(answer, seq),
            })
            .await
            .unwrap();
    }

    let first = expect_seen(&mut seen, |_, m| m["method"] == "iclicker-vote").await;
    let second = expect_seen(&mut seen, |_, m| m["method"] == "iclicker-vote").await;

    assert_eq!(first["params"][0], "12345670");
    assert_eq!(first["params"][1], "B");
    assert!(first["params"][2].is_f64());
    assert_eq!(second["params"][1], "D");
    assert_ne!(first["id"], second["id"]);

    shutdown(client).await;
}

// ============================================================================
// Reconnection Tests
// ============================================================================

#[tokio::test]
async fn test_reconnect_resumes_login() {
    let dropping = Script {
        close_after_ready: true,
        ..HAPPY
    };
    let (url, mut seen) = fake_meteor(vec![dropping, HAPPY]).await;
    let mut client = start_client(url, instructor());
    assert_eq!(readiness(&mut client).await, Readiness::Ready);

    let login = expect_seen(&mut seen, |index, m| index == 1 && m["method"] == "login").await;
    assert_eq!(login["params"], json!([{"resume": "tok"}]));
    expect_seen(&mut seen, |index, m| index == 1 && m["msg"] == "sub").await;

    client
        .handle
        .send_command(SinkCommand::Vote {
            response: vote(0x81, 7),
        })
        .await
        .unwrap();
    let call = expect_seen(&mut seen, |_, m| m["method"] == "iclicker-vote").await;
    assert_eq!(call["params"][1], "A");

    shutdown(client).await;
}

#[tokio::test]
async fn test_rejected_resume_token_falls_back_to_password() {
    let dropping = Script {
        close_after_ready: true,
        ..HAPPY
    };
    let expired = Script {
        accept_resume: false,
        ..HAPPY
    };
    let (url, mut seen) = fake_meteor(vec![dropping, expired]).await;
    let mut client = start_client(url, instructor());
    assert_eq!(readiness(&mut client).await, Readiness::Ready);

    let resume = expect_seen(&mut seen, |index, m| index == 1 && m["method"] == "login").await;
    assert_eq!(resume["params"], json!([{"resume": "tok"}]));

    let login = expect_seen(&mut seen, |index, m| index == 1 && m["method"] == "login").await;
    assert_eq!(login["params"][0]["user"]["username"], "instructor");
    assert_eq!(login["params"][0]["password"]["algorithm"], "sha-256");
    expect_seen(&mut seen, |index, m| index == 1 && m["msg"] == "sub").await;

    shutdown(client).await;
}
