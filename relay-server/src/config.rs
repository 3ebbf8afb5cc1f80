//! Server configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// How in-flight requests are treated once a shutdown signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShutdownMode {
    /// Wait for the pending table to drain, bounded by the shutdown timeout.
    Graceful,
    /// Complete every pending request with SERVER_ERROR at once.
    Immediate,
}

/// Relay Server - expose tunnel clients on random subdomains of a wildcard host.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Base domain for public traffic (e.g. tun.example.com)
    #[arg(long, env = "RELAY_DOMAIN")]
    pub domain: String,

    /// Accepted handshake secret keys (repeatable, or comma-separated in the env var)
    #[arg(long = "secret-key", env = "RELAY_SECRET_KEYS", value_delimiter = ',')]
    pub secret_keys: Vec<String>,

    /// Port for tunnel client control connections (WebSocket)
    #[arg(long, env = "RELAY_CONTROL_PORT", default_value = "8080")]
    pub control_port: u16,

    /// Port for public HTTP traffic
    #[arg(long, env = "RELAY_HTTP_PORT", default_value = "8000")]
    pub http_port: u16,

    /// Seconds to wait for a tunnel response before answering 504
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT", default_value = "30")]
    pub request_timeout: u64,

    /// Maximum accepted request body size in bytes
    #[arg(long, env = "RELAY_MAX_BODY_SIZE", default_value = "10485760")]
    pub max_body_size: usize,

    /// Length of generated subdomains
    #[arg(long, env = "RELAY_SUBDOMAIN_LENGTH", default_value = "12")]
    pub subdomain_length: usize,

    /// Shutdown behavior for in-flight requests
    #[arg(long, env = "RELAY_SHUTDOWN_MODE", value_enum, default_value_t = ShutdownMode::Graceful)]
    pub shutdown_mode: ShutdownMode,

    /// Seconds to wait for in-flight requests to drain on graceful shutdown
    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT", default_value = "30")]
    pub graceful_shutdown_timeout: u64,

    /// Seconds between application-level PINGs on each tunnel channel
    #[arg(long, env = "RELAY_HEARTBEAT_INTERVAL", default_value = "30")]
    pub heartbeat_interval: u64,

    /// Missed PONGs before a channel is closed as dead
    #[arg(long, env = "RELAY_HEARTBEAT_MAX_MISSED", default_value = "2")]
    pub heartbeat_max_missed: u32,

    /// Enable debug logging
    #[arg(long, env = "RELAY_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    /// Public URL a tunnel is reachable at. TLS terminates at the front
    /// proxy, so the advertised scheme is always https.
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("https://{}.{}", subdomain, self.domain)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Reject configurations the rest of the server cannot operate under.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() || self.domain.contains('/') || self.domain.contains(':') {
            anyhow::bail!("domain must be a bare host name, got {:?}", self.domain);
        }
        if self.subdomain_length == 0 {
            anyhow::bail!("subdomain length must be positive");
        }
        Ok(())
    }
}
