//! Client configuration.

use clap::Parser;

use crate::reconnect::ReconnectPolicy;

/// Relay Client - expose a local HTTP origin through the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Relay server URL (ws://host:port, wss://host, or http(s):// equivalents)
    #[arg(short = 's', long, env = "RELAY_SERVER_URL")]
    pub server_url: String,

    /// Handshake secret key
    #[arg(short = 'k', long, env = "RELAY_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Local origin to forward requests to (e.g. http://127.0.0.1:3000)
    #[arg(short = 'l', long, env = "RELAY_LOCAL_URL")]
    pub local_url: String,

    /// Ask for a specific subdomain instead of a random one
    #[arg(short = 'd', long, env = "RELAY_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// Exit instead of reconnecting when the connection is lost
    #[arg(long, env = "RELAY_RECONNECT_DISABLED")]
    pub reconnect_disabled: bool,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "RELAY_RECONNECT_INITIAL_DELAY_MS", default_value = "1000")]
    pub reconnect_initial_delay_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds
    #[arg(long, env = "RELAY_RECONNECT_MAX_DELAY_MS", default_value = "60000")]
    pub reconnect_max_delay_ms: u64,

    /// Backoff multiplier applied per failed attempt
    #[arg(long, env = "RELAY_RECONNECT_MULTIPLIER", default_value = "2.0")]
    pub reconnect_multiplier: f64,

    /// Symmetric jitter fraction applied to each delay
    #[arg(long, env = "RELAY_RECONNECT_JITTER", default_value = "0.1")]
    pub reconnect_jitter: f64,

    /// Maximum concurrent requests against the local origin
    #[arg(long, env = "RELAY_MAX_CONCURRENCY", default_value = "64")]
    pub max_concurrency: usize,

    /// Enable debug logging
    #[arg(long, env = "RELAY_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    /// The control channel URL, always ending in `/ws`.
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else {
            base.to_string()
        };
        if base.ends_with("/ws") {
            base
        } else {
            format!("{}/ws", base)
        }
    }

    /// Authority for the Host header of the WebSocket handshake.
    pub fn server_authority(&self) -> String {
        let url = self.ws_url();
        let rest = url
            .strip_prefix("ws://")
            .or_else(|| url.strip_prefix("wss://"))
            .unwrap_or(&url);
        rest.split('/').next().unwrap_or(rest).to_string()
    }

    /// host:port of the local origin, with port 80 implied.
    pub fn local_authority(&self) -> String {
        let rest = self
            .local_url
            .trim_end_matches('/')
            .strip_prefix("http://")
            .unwrap_or(self.local_url.trim_end_matches('/'));
        let authority = rest.split('/').next().unwrap_or(rest);
        if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{}:80", authority)
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: !self.reconnect_disabled,
            initial_delay: std::time::Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: std::time::Duration::from_millis(self.reconnect_max_delay_ms),
            multiplier: self.reconnect_multiplier,
            jitter: self.reconnect_jitter,
        }
    }

    /// Configuration problems exit the process with code 1.
    pub fn validate(&self) -> anyhow::Result<()> {
        let scheme_ok = ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.server_url.starts_with(scheme));
        if !scheme_ok {
            anyhow::bail!(
                "server URL must start with ws://, wss://, http:// or https://, got {:?}",
                self.server_url
            );
        }
        if !self.local_url.starts_with("http://") {
            anyhow::bail!(
                "local URL must start with http://, got {:?}",
                self.local_url
            );
        }
        if self.local_authority().starts_with(':') || self.local_authority() == ":80" {
            anyhow::bail!("local URL has no host: {:?}", self.local_url);
        }
        if let Some(subdomain) = &self.subdomain {
            let valid = !subdomain.is_empty()
                && subdomain.len() <= 63
                && subdomain
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !valid {
                anyhow::bail!(
                    "subdomain must match [a-z0-9]{{1,63}}, got {:?}",
                    subdomain
                );
            }
        }
        if self.reconnect_multiplier < 1.0 {
            anyhow::bail!("reconnect multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            anyhow::bail!("reconnect jitter must be between 0 and 1");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("max concurrency must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_url: &str, local_url: &str) -> ClientConfig {
        ClientConfig {
            server_url: server_url.to_string(),
            secret_key: Some("k".to_string()),
            local_url: local_url.to_string(),
            subdomain: None,
            reconnect_disabled: false,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_concurrency: 64,
            debug: false,
        }
    }

    #[test]
    fn ws_url_normalization() {
        assert_eq!(
            config("ws://relay:8080", "http://127.0.0.1:3000").ws_url(),
            "ws://relay:8080/ws"
        );
        assert_eq!(
            config("wss://relay.example.com/", "http://127.0.0.1:3000").ws_url(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            config("https://relay.example.com", "http://127.0.0.1:3000").ws_url(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            config("http://relay:8080/ws", "http://127.0.0.1:3000").ws_url(),
            "ws://relay:8080/ws"
        );
    }

    #[test]
    fn authorities() {
        let c = config("wss://relay.example.com", "http://127.0.0.1:3000");
        assert_eq!(c.server_authority(), "relay.example.com");
        assert_eq!(c.local_authority(), "127.0.0.1:3000");

        let c = config("ws://relay:8080", "http://localhost");
        assert_eq!(c.server_authority(), "relay:8080");
        assert_eq!(c.local_authority(), "localhost:80");
    }

    #[test]
    fn validate_catches_bad_input() {
        assert!(config("ws://relay:8080", "http://127.0.0.1:3000")
            .validate()
            .is_ok());
        assert!(config("relay:8080", "http://127.0.0.1:3000")
            .validate()
            .is_err());
        assert!(config("ws://relay:8080", "127.0.0.1:3000")
            .validate()
            .is_err());

        let mut c = config("ws://relay:8080", "http://127.0.0.1:3000");
        c.subdomain = Some("Not-Valid".to_string());
        assert!(c.validate().is_err());
        c.subdomain = Some("abc123".to_string());
        assert!(c.validate().is_ok());

        let mut c = config("ws://relay:8080", "http://127.0.0.1:3000");
        c.reconnect_multiplier = 0.5;
        assert!(c.validate().is_err());
    }
}
