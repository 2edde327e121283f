//! Meteor connection driving the sink bridge
//!
//! Connects, optionally logs in, subscribes to the display publication and
//! then serves the [`SinkWorker`]: votes become `iclicker-vote` calls and
//! display documents are mirrored into the worker's display text. A dropped
//! connection is re-established with exponential backoff, replaying the
//! login (with the resume token) and the subscription.

use super::ddp::{
    self, ClientMessage, CollectionMirror, DISPLAY_COLLECTION, ServerMessage, VOTE_METHOD,
};
use anyhow::{Context, Result, anyhow};
use common::{SinkCommand, SinkWorker};
use futures_util::{SinkExt, StreamExt};
use protocol::Response;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Longest wait for the server's reply to connect, login or subscribe
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:3000/websocket`
    pub url: String,
    pub credentials: Option<Credentials>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Outcome of the first connection, reported once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Logged in (if asked to) and subscribed
    Ready,
    LoginFailed(String),
    SubscriptionFailed(String),
    ConnectFailed(String),
}

/// Why a session setup step did not complete
enum SetupError {
    Login(String),
    Subscription(String),
    Connection(anyhow::Error),
}

impl From<anyhow::Error> for SetupError {
    fn from(err: anyhow::Error) -> Self {
        SetupError::Connection(err)
    }
}

/// What ended a connected session
enum SessionEnd {
    Shutdown,
    Disconnected(anyhow::Error),
}

pub struct DdpClient {
    options: ClientOptions,
    worker: SinkWorker,
    mirror: CollectionMirror,
    resume_token: Option<String>,
    backlog: VecDeque<Response>,
}

impl DdpClient {
    pub fn new(options: ClientOptions, worker: SinkWorker) -> Self {
        Self {
            options,
            worker,
            mirror: CollectionMirror::new(),
            resume_token: None,
            backlog: VecDeque::new(),
        }
    }

    /// Run until shutdown is requested or the first connection fails
    ///
    /// `ready` receives the outcome of the first connection. Once that
    /// succeeded, later disconnects are retried indefinitely.
    pub async fn run(mut self, ready: oneshot::Sender<Readiness>) -> Result<()> {
        let mut session = match self.establish().await {
            Ok(session) => {
                let _ = ready.send(Readiness::Ready);
                session
            }
            Err(e) => {
                let (readiness, err) = match e {
                    SetupError::Login(reason) => (
                        Readiness::LoginFailed(reason.clone()),
                        anyhow!("Login failed: {}", reason),
                    ),
                    SetupError::Subscription(reason) => (
                        Readiness::SubscriptionFailed(reason.clone()),
                        anyhow!("Display subscription failed: {}", reason),
                    ),
                    SetupError::Connection(err) => {
                        (Readiness::ConnectFailed(format!("{:#}", err)), err)
                    }
                };
                let _ = ready.send(readiness);
                self.worker.close();
                return Err(err);
            }
        };

        loop {
            match self.serve(&mut session).await {
                SessionEnd::Shutdown => {
                    info!("[Meteor] Closing connection");
                    let _ = session.ws.close(None).await;
                    self.worker.close();
                    return Ok(());
                }
                SessionEnd::Disconnected(e) => {
                    warn!("[Meteor] Connection closed: {:#}", e);
                }
            }

            match self.reconnect().await {
                Some(next) => {
                    info!("[Meteor] Reconnected");
                    session = next;
                }
                None => {
                    self.worker.close();
                    return Ok(());
                }
            }
        }
    }

    /// Connect, log in and subscribe
    async fn establish(&mut self) -> std::result::Result<Session, SetupError> {
        let mut session = Session::connect(&self.options.url).await?;
        info!("[Meteor] Connected");

        if let Some(credentials) = self.options.credentials.clone() {
            info!("[Meteor] Logging in");
            let result = match self.resume_token.clone() {
                Some(token) => {
                    let params = ddp::resume_login_params(&token);
                    let resumed = session
                        .call("login", params, &mut self.mirror, &self.worker)
                        .await?;
                    match resumed {
                        Ok(result) => Ok(result),
                        Err(e) => {
                            self.resume_token = None;
                            info!(
                                "[Meteor] Logged out, resume token rejected ({})",
                                ddp::describe_error(&e)
                            );
                            self.password_login(&mut session, &credentials).await?
                        }
                    }
                }
                None => self.password_login(&mut session, &credentials).await?,
            };

            match result {
                Ok(result) => {
                    let user = result.get("id").and_then(Value::as_str).unwrap_or("?");
                    info!("[Meteor] Logged in as user {}", user);
                    self.resume_token = ddp::login_token(&result);
                }
                Err(e) => {
                    self.resume_token = None;
                    let reason = ddp::describe_error(&e);
                    error!("[Meteor] Login failed {}", reason);
                    return Err(SetupError::Login(reason));
                }
            }
        }

        self.mirror.clear();
        self.worker.set_display_text(String::new());
        session
            .subscribe(DISPLAY_COLLECTION, &mut self.mirror, &self.worker)
            .await?
            .map_err(|e| {
                let reason = ddp::describe_error(&e);
                error!("[Meteor] display subscription error {}", reason);
                SetupError::Subscription(reason)
            })?;
        debug!("Subscribed to {}", DISPLAY_COLLECTION);

        Ok(session)
    }

    async fn password_login(
        &mut self,
        session: &mut Session,
        credentials: &Credentials,
    ) -> Result<std::result::Result<Value, Value>> {
        let params = ddp::password_login_params(&credentials.username, &credentials.password);
        session
            .call("login", params, &mut self.mirror, &self.worker)
            .await
    }

    /// Re-establish the session with exponential backoff
    ///
    /// Returns `None` when shutdown is requested while waiting.
    async fn reconnect(&mut self) -> Option<Session> {
        let mut backoff = self.options.reconnect_initial;

        loop {
            info!(
                "[Meteor] Attempting reconnection to {} (backoff: {}ms)",
                self.options.url,
                backoff.as_millis()
            );

            match self.establish().await {
                Ok(session) => return Some(session),
                Err(SetupError::Connection(e)) => {
                    warn!("[Meteor] Failed {:#}. Retrying in {}ms", e, backoff.as_millis());
                }
                Err(SetupError::Login(_)) | Err(SetupError::Subscription(_)) => {
                    warn!("[Meteor] Retrying in {}ms", backoff.as_millis());
                }
            }

            if !self.wait_queuing_votes(backoff).await {
                return None;
            }
            backoff = (backoff * 2).min(self.options.reconnect_max);
        }
    }

    /// Sleep for `delay`, holding on to votes that arrive meanwhile
    ///
    /// Returns `false` if shutdown was requested.
    async fn wait_queuing_votes(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                cmd = self.worker.recv_command() => match cmd {
                    Ok(SinkCommand::Vote { response }) => self.backlog.push_back(response),
                    Ok(SinkCommand::Shutdown) | Err(_) => return false,
                },
            }
        }
    }

    /// Forward votes and mirror the display until the connection ends
    async fn serve(&mut self, session: &mut Session) -> SessionEnd {
        while let Some(response) = self.backlog.pop_front() {
            if let Err(e) = session.vote(&response).await {
                self.backlog.push_front(response);
                return SessionEnd::Disconnected(e);
            }
        }

        loop {
            tokio::select! {
                cmd = self.worker.recv_command() => match cmd {
                    Ok(SinkCommand::Vote { response }) => {
                        if let Err(e) = session.vote(&response).await {
                            self.backlog.push_back(response);
                            return SessionEnd::Disconnected(e);
                        }
                    }
                    Ok(SinkCommand::Shutdown) => return SessionEnd::Shutdown,
                    Err(_) => return SessionEnd::Shutdown,
                },
                event = session.next_event(&mut self.mirror, &self.worker) => match event {
                    Ok(Event::Result { id, error, result }) => session.log_result(&id, error, result),
                    Ok(Event::Ready(_)) => {}
                    Ok(Event::NoSub { id, error }) => {
                        warn!(
                            "[Meteor] Subscription {} ended: {}",
                            id,
                            error.as_ref().map(ddp::describe_error).unwrap_or_default()
                        );
                    }
                    Err(e) => return SessionEnd::Disconnected(e),
                },
            }
        }
    }
}

/// Messages a caller may be waiting for
enum Event {
    Result {
        id: String,
        error: Option<Value>,
        result: Option<Value>,
    },
    Ready(Vec<String>),
    NoSub {
        id: String,
        error: Option<Value>,
    },
}

/// One connected WebSocket
struct Session {
    ws: WsStream,
    next_id: u64,
    pending: HashMap<String, &'static str>,
}

impl Session {
    async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(url))
            .await
            .context("Timed out connecting")?
            .with_context(|| format!("Failed to connect to {}", url))?;

        let mut session = Self {
            ws,
            next_id: 0,
            pending: HashMap::new(),
        };
        session.send(&ClientMessage::connect(None)).await?;
        timeout(HANDSHAKE_TIMEOUT, session.await_connected())
            .await
            .context("Timed out waiting for DDP handshake")??;

        Ok(session)
    }

    async fn await_connected(&mut self) -> Result<()> {
        loop {
            match self.next_message().await? {
                ServerMessage::Connected { session } => {
                    debug!("DDP session {}", session);
                    return Ok(());
                }
                ServerMessage::Failed { version } => {
                    return Err(anyhow!("Server requires DDP version {}", version));
                }
                ServerMessage::Ping { id } => self.send(&ClientMessage::Pong { id }).await?,
                other => debug!("Ignoring {:?} before handshake", other),
            }
        }
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = msg.to_json();
        debug!("DDP send: {}", text);
        self.ws
            .send(Message::Text(text))
            .await
            .context("Failed to send DDP message")
    }

    /// Next DDP message the bridge understands
    async fn next_message(&mut self) -> Result<ServerMessage> {
        loop {
            let frame = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow!("Connection closed by server"))?
                .context("WebSocket error")?;

            match frame {
                Message::Text(text) => match ServerMessage::parse(&text) {
                    Ok(msg) => return Ok(msg),
                    Err(_) => debug!("Ignoring DDP message {}", text),
                },
                Message::Close(reason) => {
                    return Err(anyhow!("Connection closed {:?}", reason));
                }
                _ => {}
            }
        }
    }

    /// Next event worth reporting, answering pings and mirroring the display
    async fn next_event(
        &mut self,
        mirror: &mut CollectionMirror,
        worker: &SinkWorker,
    ) -> Result<Event> {
        loop {
            match self.next_message().await? {
                ServerMessage::Ping { id } => self.send(&ClientMessage::Pong { id }).await?,
                ServerMessage::Added {
                    collection,
                    id,
                    fields,
                } if collection == DISPLAY_COLLECTION => {
                    mirror.added(id, fields);
                    worker.set_display_text(mirror.display_line());
                }
                ServerMessage::Changed {
                    collection,
                    id,
                    fields,
                    cleared,
                } if collection == DISPLAY_COLLECTION => {
                    mirror.changed(&id, fields, &cleared);
                    worker.set_display_text(mirror.display_line());
                }
                ServerMessage::Removed { collection, id } if collection == DISPLAY_COLLECTION => {
                    mirror.removed(&id);
                    worker.set_display_text(mirror.display_line());
                }
                ServerMessage::Result { id, error, result } => {
                    return Ok(Event::Result { id, error, result });
                }
                ServerMessage::Ready { subs } => return Ok(Event::Ready(subs)),
                ServerMessage::Nosub { id, error } => return Ok(Event::NoSub { id, error }),
                ServerMessage::Error { reason } => {
                    warn!("[Meteor] Server error {}", reason.unwrap_or_default());
                }
                other => debug!("Ignoring {:?}", other),
            }
        }
    }

    /// Call a method and wait for its result
    async fn call(
        &mut self,
        method: &'static str,
        params: Vec<Value>,
        mirror: &mut CollectionMirror,
        worker: &SinkWorker,
    ) -> Result<std::result::Result<Value, Value>> {
        let id = self.next_id();
        self.send(&ClientMessage::Method {
            id: id.clone(),
            method: method.to_string(),
            params,
        })
        .await?;

        timeout(HANDSHAKE_TIMEOUT, self.await_result(&id, mirror, worker))
            .await
            .with_context(|| format!("Timed out waiting for {} result", method))?
    }

    async fn await_result(
        &mut self,
        id: &str,
        mirror: &mut CollectionMirror,
        worker: &SinkWorker,
    ) -> Result<std::result::Result<Value, Value>> {
        loop {
            match self.next_event(mirror, worker).await? {
                Event::Result {
                    id: reply,
                    error,
                    result,
                } if reply == id => {
                    return Ok(match error {
                        Some(error) => Err(error),
                        None => Ok(result.unwrap_or(Value::Null)),
                    });
                }
                Event::Result { id, error, result } => self.log_result(&id, error, result),
                _ => {}
            }
        }
    }

    /// Subscribe and wait for `ready` or `nosub`
    async fn subscribe(
        &mut self,
        name: &str,
        mirror: &mut CollectionMirror,
        worker: &SinkWorker,
    ) -> Result<std::result::Result<(), Value>> {
        let id = self.next_id();
        self.send(&ClientMessage::Sub {
            id: id.clone(),
            name: name.to_string(),
            params: Vec::new(),
        })
        .await?;

        timeout(HANDSHAKE_TIMEOUT, self.await_ready(&id, mirror, worker))
            .await
            .with_context(|| format!("Timed out subscribing to {}", name))?
    }

    async fn await_ready(
        &mut self,
        id: &str,
        mirror: &mut CollectionMirror,
        worker: &SinkWorker,
    ) -> Result<std::result::Result<(), Value>> {
        loop {
            match self.next_event(mirror, worker).await? {
                Event::Ready(subs) if subs.iter().any(|s| s == id) => return Ok(Ok(())),
                Event::NoSub { id: sub, error } if sub == id => {
                    return Ok(Err(
                        error.unwrap_or_else(|| Value::String("nosub".to_string()))
                    ));
                }
                Event::Result { id, error, result } => self.log_result(&id, error, result),
                _ => {}
            }
        }
    }

    /// Fire an `iclicker-vote` call; the result is logged when it arrives
    async fn vote(&mut self, response: &Response) -> Result<()> {
        let id = self.next_id();
        self.pending.insert(id.clone(), VOTE_METHOD);
        self.send(&ClientMessage::Method {
            id,
            method: VOTE_METHOD.to_string(),
            params: ddp::vote_params(response),
        })
        .await
    }

    fn log_result(&mut self, id: &str, error: Option<Value>, result: Option<Value>) {
        let method = self.pending.remove(id).unwrap_or("method");
        match error {
            Some(error) => warn!("[Meteor] {} error {}", method, ddp::describe_error(&error)),
            None => {
                let result = result.unwrap_or(Value::Null);
                debug!("[Meteor] {} result {}", method, result);
            }
        }
    }
}
