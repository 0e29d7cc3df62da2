//! Station Link Agent
//!
//! Standalone binary that proxies a point-of-sale station (receipt printer,
//! card scanner) to the control server over the device channel.

mod devices;
mod web;

use anyhow::{Context, Result};
use clap::Parser;
use stationlink_core::transport::Transport;
use stationlink_core::types::events;
use stationlink_core::{
    spawn_scanner, CardReadEvent, ChannelConfig, CommandDispatcher, ConnectOutcome, ConnectionSupervisor,
    PrinterCapability, RetryConfig, ScannerCapability, Session, SessionProvider, SessionStore, WsTransport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::devices::{DeviceScanner, SimulatedPrinter, SpoolPrinter, StdinScanner};

/// Station Link Agent - POS device proxy for the control server
#[derive(Parser, Debug)]
#[command(name = "stationlink-agent")]
#[command(author = "Station Link Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connects station printer and card scanner to the control server", long_about = None)]
struct Args {
    /// Bind address for the local status surface (loopback only)
    #[arg(short, long, env = "STATION_BIND", default_value = "127.0.0.1:3001")]
    bind: String,

    /// Base HTTP(S) URL of the control server
    #[arg(long, env = "ELIXIR_SERVER_URL", default_value = "http://localhost:4001")]
    server_url: String,

    /// Device auth token
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Device id assigned by the server
    #[arg(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "DEVICE_NAME")]
    device_name: Option<String>,

    /// Raw scanner byte device (e.g. /dev/hidraw0)
    #[arg(long)]
    scanner_device: Option<PathBuf>,

    /// Read scanner input from stdin instead of a device
    #[arg(long, default_value = "false")]
    simulate_scanner: bool,

    /// Spool directory: write print jobs there instead of simulating
    #[arg(long)]
    print_spool: Option<PathBuf>,

    /// Simulated printer reports not ready
    #[arg(long, default_value = "false")]
    printer_offline: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Session from saved credentials, if both token and device id are set
    fn session(&self) -> Option<Session> {
        let token = self.auth_token.as_deref().filter(|t| !t.is_empty())?;
        let device_id = self.device_id.as_deref().filter(|d| !d.is_empty())?;
        Some(Session::new(
            token,
            device_id,
            self.device_name.clone(),
            self.server_url.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls CryptoProvider with ring backend (required for rustls 0.23+)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level)?;

    info!("Starting Station Link agent v{}", env!("CARGO_PKG_VERSION"));

    let bind_addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", args.bind))?;

    let sessions = Arc::new(SessionStore::new());
    match args.session() {
        Some(session) => {
            info!("Loaded credentials for device {} ({})", session.device_id, session.server_url);
            sessions.set(session);
        }
        None => warn!("No credentials configured; set AUTH_TOKEN and DEVICE_ID to connect"),
    }

    let printer = build_printer(&args).await?;
    let scanner = build_scanner(&args);
    info!("Printer: {:?}", printer.status());

    let (supervisor, inbound) = ConnectionSupervisor::new(
        WsTransport,
        sessions.clone(),
        RetryConfig::default(),
        ChannelConfig::default(),
    );

    let dispatcher = CommandDispatcher::new(printer.clone());
    tokio::spawn(dispatcher.run(inbound, Arc::new(supervisor.clone())));

    if let Some(scanner) = scanner.clone() {
        spawn_card_forwarding(scanner, supervisor.clone());
    }

    let state = web::AppState::new(supervisor.clone(), sessions.clone(), printer, scanner);
    let (web_addr, web_handle) = web::start(bind_addr, state)
        .await
        .context("Failed to start status surface")?;

    println!("============================================");
    println!("Status: http://{}/status", web_addr);
    println!("============================================");

    if sessions.has_credentials() {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            match supervisor.connect_with_retry().await {
                Ok(ConnectOutcome::Connected) => info!("Connected to control server"),
                Ok(ConnectOutcome::RetryingInBackground) => {
                    warn!("Control server unreachable, retrying in background")
                }
                Ok(ConnectOutcome::Cancelled) => {}
                Err(e) => error!("Auto-connect failed: {}", e),
            }
        });
    }

    // Wait for shutdown signal
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to setup SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = web_handle => {
            result.context("Status server task failed")?;
        }
    }

    supervisor.disconnect().await;
    info!("Shutdown complete");
    Ok(())
}

/// Setup logging with tracing
fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

async fn build_printer(args: &Args) -> Result<Arc<dyn PrinterCapability>> {
    match &args.print_spool {
        Some(dir) => {
            let printer = SpoolPrinter::new(dir);
            printer
                .prepare()
                .await
                .with_context(|| format!("Failed to create spool directory {}", dir.display()))?;
            info!("Spooling print jobs to {}", printer.dir().display());
            Ok(Arc::new(printer))
        }
        None => {
            warn!("No printer configured. Running in mock mode.");
            Ok(Arc::new(SimulatedPrinter::new(!args.printer_offline)))
        }
    }
}

fn build_scanner(args: &Args) -> Option<Arc<dyn ScannerCapability>> {
    if args.simulate_scanner {
        return Some(Arc::new(StdinScanner));
    }
    match &args.scanner_device {
        Some(path) => Some(Arc::new(DeviceScanner::new(path))),
        None => {
            info!("No card scanner configured");
            None
        }
    }
}

/// Forward card reads to the channel as `card_scanned`
fn spawn_card_forwarding<T: Transport>(
    scanner: Arc<dyn ScannerCapability>,
    supervisor: ConnectionSupervisor<T>,
) -> JoinHandle<()> {
    let (reader, mut cards) = spawn_scanner(scanner);

    tokio::spawn(async move {
        while let Some(card) = cards.recv().await {
            forward_card(&supervisor, card).await;
        }

        match reader.await {
            Ok(Ok(())) => info!("Card scanner stream ended"),
            Ok(Err(e)) => error!("Card scanner failed: {}", e),
            Err(e) => error!("Card scanner task failed: {}", e),
        }
    })
}

/// Send one card read; dropped with a warning while the channel is not joined
async fn forward_card<T: Transport>(supervisor: &ConnectionSupervisor<T>, card: CardReadEvent) -> bool {
    info!("Card scanned: {} ({:?})", card.card_id, card.format);

    if !supervisor.is_joined().await {
        warn!("Card scanned but not connected to server");
        return false;
    }

    let card_data = match serde_json::to_value(&card) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to encode card read: {}", e);
            return false;
        }
    };

    match supervisor
        .send(events::CARD_SCANNED, serde_json::json!({ "card_data": card_data }))
        .await
    {
        Ok(sent) => sent,
        Err(e) => {
            error!("Failed to send card scan: {}", e);
            false
        }
    }
}
