//! Relay Server - public side of the tunnel.
//!
//! Accepts tunnel clients on the control port, exposes each one at a random
//! subdomain of the configured base domain, and bridges public HTTP traffic
//! over the tunnel channels.

mod allocator;
mod channel;
mod config;
mod forwarder;
mod registry;
mod router;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use relay_core::{DisconnectReason, Envelope};

use allocator::SubdomainAllocator;
use channel::ChannelState;
use config::{ServerConfig, ShutdownMode};
use forwarder::{ForwardError, PendingTable, RequestForwarder};
use registry::SessionRegistry;
use router::RouterState;
use shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    config.validate()?;
    if config.secret_keys.is_empty() {
        warn!("no secret keys configured, every handshake will be refused");
    }

    info!("starting relay-server v{}", env!("CARGO_PKG_VERSION"));
    info!("domain: {}", config.domain);
    info!("control port: {}", config.control_port);
    info!("public port: {}", config.http_port);

    let pendings = Arc::new(PendingTable::new());
    let registry = Arc::new(SessionRegistry::new(pendings.clone()));
    let forwarder = Arc::new(RequestForwarder::new(pendings.clone(), registry.clone()));
    let allocator = SubdomainAllocator::new(config.subdomain_length);
    let config = Arc::new(config);
    let signal = ShutdownSignal::new();

    let control_handle = {
        let state = ChannelState {
            config: config.clone(),
            registry: registry.clone(),
            forwarder: forwarder.clone(),
            allocator,
        };
        let addr = format!("0.0.0.0:{}", config.control_port);
        let signal = signal.clone();
        tokio::spawn(async move {
            if let Err(err) = channel::run_control_server(&addr, state, signal).await {
                tracing::error!("control server error: {}", err);
            }
        })
    };

    let public_handle = {
        let state = RouterState {
            config: config.clone(),
            registry: registry.clone(),
            forwarder: forwarder.clone(),
            shutdown: signal.clone(),
        };
        let addr = format!("0.0.0.0:{}", config.http_port);
        let signal = signal.clone();
        tokio::spawn(async move {
            if let Err(err) = router::run_public_server(&addr, state, signal).await {
                tracing::error!("public server error: {}", err);
            }
        })
    };

    info!("server ready");
    shutdown::wait_for_signal(&signal).await;

    // New public requests are refused from here on; tell every client so it
    // can drop into its reconnect loop.
    let sessions = registry.list();
    if !sessions.is_empty() {
        info!("notifying {} tunnel(s) of shutdown", sessions.len());
    }
    for session_info in &sessions {
        if let Some(session) = registry.lookup(&session_info.subdomain) {
            session.publish(Envelope::disconnect(DisconnectReason::Shutdown));
        }
    }

    match config.shutdown_mode {
        ShutdownMode::Graceful => {
            let in_flight = forwarder.pending_count();
            if in_flight > 0 {
                info!(in_flight, "draining in-flight requests");
            }
            if shutdown::drain_pendings(&pendings, config.shutdown_timeout()).await {
                info!("in-flight requests drained");
            } else {
                warn!("drain timed out, completing remaining requests with errors");
                pendings.fail_all(ForwardError::Shutdown);
            }
        }
        ShutdownMode::Immediate => {
            pendings.fail_all(ForwardError::Shutdown);
        }
    }

    registry.shutdown();

    // Let channel writers deliver the DISCONNECT and close frames.
    tokio::time::sleep(Duration::from_millis(200)).await;

    control_handle.abort();
    public_handle.abort();

    info!("shutdown complete");
    Ok(())
}
