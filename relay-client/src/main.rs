//! Relay Client - local side of the tunnel.
//!
//! Connects to the relay server, receives a public subdomain, and re-issues
//! forwarded requests against the configured local origin.

mod channel;
mod config;
mod origin;
mod reconnect;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use channel::{ChannelError, SessionEnd};
use config::ClientConfig;
use origin::OriginProxy;
use reconnect::ReconnectController;

#[tokio::main]
async fn main() -> ExitCode {
    let config = ClientConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    if let Err(err) = config.validate() {
        error!("invalid configuration: {:#}", err);
        return ExitCode::from(1);
    }

    info!("starting relay-client v{}", env!("CARGO_PKG_VERSION"));
    info!("server: {}", config.server_url);
    info!("local origin: {}", config.local_url);

    // A missing local service should be visible before the tunnel opens, but
    // it is not fatal; it may come up later.
    if let Err(err) = origin::preflight(&config.local_authority(), Duration::from_secs(5)).await {
        warn!("local origin not reachable yet: {}", err);
    }

    let proxy = Arc::new(OriginProxy::new(config.local_authority()));
    let mut controller = ReconnectController::new(config.reconnect_policy());

    loop {
        controller.on_connecting();
        match channel::run_channel(&config, proxy.clone()).await {
            Ok(SessionEnd::Interrupted) => {
                info!("tunnel closed");
                return ExitCode::SUCCESS;
            }
            Ok(end) => {
                // The session reached OPEN, so the next failure backs off
                // from the initial delay again.
                controller.on_connected();
                match end {
                    SessionEnd::Disconnected(reason) => {
                        info!(?reason, "server disconnected the tunnel");
                    }
                    SessionEnd::ConnectionLost => warn!("connection lost"),
                    SessionEnd::Interrupted => unreachable!(),
                }
                if !backoff(&mut controller).await {
                    return ExitCode::from(2);
                }
            }
            Err(ChannelError::AuthRejected) => {
                error!("authentication failed: the server rejected the secret key");
                return ExitCode::from(1);
            }
            Err(err) => {
                error!("{}", err);
                if !backoff(&mut controller).await {
                    return ExitCode::from(2);
                }
            }
        }
    }
}

/// Sleep out the next backoff delay. False when reconnection is disabled.
async fn backoff(controller: &mut ReconnectController) -> bool {
    match controller.on_failure() {
        Some(delay) => {
            info!(
                "reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                controller.attempt_count()
            );
            tokio::time::sleep(delay).await;
            true
        }
        None => {
            error!("connection lost and reconnection is disabled");
            false
        }
    }
}
