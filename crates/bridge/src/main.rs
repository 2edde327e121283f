//! iclicker-bridge
//!
//! Connects to a Meteor server, then runs an alpha poll on the attached
//! iClicker base station until interrupted, forwarding every vote.

use anyhow::{Context, Result};
use bridge::network::{ClientOptions, Credentials, DdpClient, Readiness};
use bridge::usb::RusbOpener;
use bridge::{BaseStation, BridgeConfig, PollingEngine};
use clap::Parser;
use common::{SinkCommand, SinkHandle, create_sink_bridge, setup_logging};
use protocol::Frequency;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_LOGIN_FAILED: u8 = 1;
const EXIT_SUBSCRIPTION_FAILED: u8 = 2;
const EXIT_STARTUP_FAILED: u8 = 3;

/// How long the Meteor connection gets to close after the poll ends
const NETWORK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "iclicker-bridge")]
#[command(
    author,
    version,
    about = "Start an iClicker base station Meteor bridge"
)]
#[command(long_about = "
Connects to a Meteor server over DDP, then polls the attached iClicker base
station and calls `iclicker-vote` for every response. The base station display
shows the server's `display` text, the poll time and the number of votes.

EXAMPLES:
    # Poll on the default frequency
    iclicker-bridge ws://127.0.0.1:3000/websocket

    # Use frequency AB and log in
    iclicker-bridge ws://127.0.0.1:3000/websocket --frequency ab \\
        --username instructor --password secret

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/iclicker-bridge/bridge.toml
    3. /etc/iclicker-bridge/bridge.toml
    4. Built-in defaults

EXIT STATUS:
    0  poll ended normally or was interrupted
    1  login failed
    2  display subscription failed
    3  startup failed (no base station, initialization or connection error)
")]
struct Args {
    /// Server URL to connect to (e.g., 'ws://127.0.0.1:3000/websocket')
    #[arg(value_name = "server URL", required_unless_present = "save_config")]
    url: Option<String>,

    /// Base station frequency, two letters a-d (e.g., 'aa' or 'ab')
    #[arg(long, value_name = "CODE")]
    frequency: Option<Frequency>,

    /// Log in to the server with this username
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Log in to the server with this password
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_STARTUP_FAILED)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(EXIT_OK);
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(bridge::config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("iclicker-bridge v{}", env!("CARGO_PKG_VERSION"));

    let url = args
        .url
        .clone()
        .context("A server URL is required")?;
    let frequency = args.frequency.unwrap_or(config.bridge.frequency);
    let credentials = match (args.username, args.password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        _ => None,
    };
    let (reconnect_initial, reconnect_max) = config.reconnect_backoff();

    let (sink, worker) = create_sink_bridge();
    let (ready_tx, ready_rx) = oneshot::channel();
    let client = DdpClient::new(
        ClientOptions {
            url,
            credentials,
            reconnect_initial,
            reconnect_max,
        },
        worker,
    );
    let mut network = tokio::spawn(async move { client.run(ready_tx).await });

    let readiness = tokio::select! {
        readiness = ready_rx => readiness.unwrap_or_else(|_| {
            Readiness::ConnectFailed("network task ended unexpectedly".to_string())
        }),
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            shutdown_network(&sink, network).await;
            return Ok(EXIT_OK);
        }
    };

    match readiness {
        Readiness::Ready => {}
        Readiness::LoginFailed(_) => return Ok(EXIT_LOGIN_FAILED),
        Readiness::SubscriptionFailed(_) => return Ok(EXIT_SUBSCRIPTION_FAILED),
        Readiness::ConnectFailed(reason) => {
            anyhow::bail!("Failed to connect to Meteor server: {}", reason)
        }
    }

    let opener = RusbOpener::new(config.timings().settle).context("Failed to initialize libusb")?;
    let base = BaseStation::new(Box::new(opener), config.selector(), config.timings());
    let engine = Arc::new(PollingEngine::new(base, sink.clone()));
    let poll_type = config.bridge.poll_type;

    let mut poll = tokio::task::spawn_blocking({
        let engine = engine.clone();
        move || -> common::Result<()> {
            engine.base().initialize(frequency)?;
            engine.start(poll_type)
        }
    });

    // A stop that lands during setup still ends the poll once setup finishes
    let mut network_running = true;
    let result = loop {
        tokio::select! {
            result = &mut poll => break result,
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping poll");
                stop_engine(&engine).await;
            }
            outcome = &mut network, if network_running => {
                network_running = false;
                match outcome {
                    Ok(Ok(())) => warn!("Meteor connection closed, stopping poll"),
                    Ok(Err(e)) => error!("Meteor connection failed: {:#}, stopping poll", e),
                    Err(e) => error!("Network task panicked: {}", e),
                }
                stop_engine(&engine).await;
            }
        }
    };

    if network_running {
        shutdown_network(&sink, network).await;
    }

    match result {
        Ok(Ok(())) => {
            info!("Poll finished with {} responses", engine.response_count());
            Ok(EXIT_OK)
        }
        Ok(Err(e)) => Err(e).context("iClicker base station failed"),
        Err(e) => Err(e).context("Polling thread panicked"),
    }
}

async fn stop_engine(engine: &Arc<PollingEngine<SinkHandle>>) {
    // stop() waits for the USB lock, keep it off the runtime threads
    let engine = engine.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || engine.stop()).await {
        error!("Failed to stop poll: {}", e);
    }
}

async fn shutdown_network(sink: &SinkHandle, network: tokio::task::JoinHandle<Result<()>>) {
    if let Err(e) = sink.send_command(SinkCommand::Shutdown).await {
        warn!("Meteor connection already closed: {}", e);
    }
    match tokio::time::timeout(NETWORK_SHUTDOWN_TIMEOUT, network).await {
        Ok(Ok(Err(e))) => warn!("Meteor connection ended with error: {:#}", e),
        Ok(Err(e)) => error!("Network task panicked: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("Timed out closing Meteor connection"),
    }
}
