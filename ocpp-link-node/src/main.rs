//! OCPP Link Node - CLI for OCPP 1.6J charge point links
//!
//! Connects to one or more charge points, logs every event they produce and
//! optionally issues a remote start or stop.
//!
//! # Usage
//!
//! ```bash
//! # Watch two charge points
//! OCPP_WS_BASE_URL=wss://gateway.example.com/ocpp OCPP_AUTH_TOKEN=secret \
//!     ocpp-link-node CP1 CP2
//!
//! # Start a transaction on connector 1 of CP1
//! ocpp-link-node CP1 --ws-url ws://localhost:9000/ocpp --remote-start 1 --id-tag TAG123
//!
//! # Stop transaction 42
//! ocpp-link-node CP1 --ws-url ws://localhost:9000/ocpp --remote-stop 42
//! ```

use std::time::Duration;

use clap::Parser;
use ocpp_link::config::{ENV_AUTH_TOKEN, ENV_WS_BASE_URL};
use ocpp_link::{ConnectionEvent, ConnectionRegistry, OcppConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 1.6J charge point link node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charge point IDs to connect to
    #[arg(required = true)]
    charge_points: Vec<String>,

    /// WebSocket base URL; the charge point ID is appended as a path segment
    #[arg(long, env = ENV_WS_BASE_URL)]
    ws_url: String,

    /// Bearer token for the Authorization header
    #[arg(long, env = ENV_AUTH_TOKEN, hide_env_values = true)]
    token: Option<String>,

    /// Per-call response timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_interval: u64,

    /// Send RemoteStartTransaction for this connector on every charge point
    #[arg(long, requires = "id_tag")]
    remote_start: Option<i32>,

    /// ID tag for --remote-start
    #[arg(long)]
    id_tag: Option<String>,

    /// Send RemoteStopTransaction for this transaction on every charge point
    #[arg(long)]
    remote_stop: Option<i32>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Link Node - OCPP 1.6J Client               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  URL:      {:<50} ║", truncate(&args.ws_url, 50));
    println!("║  Points:   {:<50} ║", truncate(&args.charge_points.join(", "), 50));
    println!("║  Auth:     {:<50} ║", if args.token.is_some() { "bearer" } else { "none" });
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = OcppConfig::new(&args.ws_url)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval));

    if let Some(token) = &args.token {
        config = config.with_auth_token(token);
    }

    let registry = ConnectionRegistry::new(config);
    let events = tokio::spawn(log_events(registry.subscribe()));

    for charge_point_id in &args.charge_points {
        if let Err(e) = registry.connect(charge_point_id).await {
            error!("Failed to connect to {}: {}", charge_point_id, e);
            continue;
        }

        if let (Some(connector_id), Some(id_tag)) = (args.remote_start, &args.id_tag) {
            match registry
                .remote_start_transaction(charge_point_id, connector_id, id_tag)
                .await
            {
                Ok(resp) => info!("RemoteStartTransaction on {}: {:?}", charge_point_id, resp.status),
                Err(e) => error!("RemoteStartTransaction on {} failed: {}", charge_point_id, e),
            }
        }

        if let Some(transaction_id) = args.remote_stop {
            match registry
                .remote_stop_transaction(charge_point_id, transaction_id)
                .await
            {
                Ok(resp) => info!("RemoteStopTransaction on {}: {:?}", charge_point_id, resp.status),
                Err(e) => error!("RemoteStopTransaction on {} failed: {}", charge_point_id, e),
            }
        }
    }

    info!("Connected: {:?}; press Ctrl-C to stop", registry.connected_ids().await);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    registry.disconnect_all().await;
    events.abort();

    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Error { charge_point_id, message, fatal: true }) => {
                error!("[{}] giving up: {}", charge_point_id, message);
            }
            Ok(event) => match event.payload() {
                Some(payload) => info!("[{}] {}: {}", event.charge_point_id(), event.event_type(), payload),
                None => info!("[{}] {}", event.charge_point_id(), event.event_type()),
            },
            Err(RecvError::Lagged(n)) => warn!("Event log fell behind, skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
