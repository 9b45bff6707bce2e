//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;

use huddle_shared::constants::{CHANNEL_BUFFER, DEFAULT_HTTP_PORT, MAX_MESSAGE_LEN};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8000`
    pub http_addr: SocketAddr,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Huddle"`
    pub instance_name: String,

    /// Longest accepted chat text or sticker id, in bytes.
    /// Env: `MAX_MESSAGE_LEN`
    /// Default: `4096`
    pub max_message_len: usize,

    /// Outbound frames queued per socket before frames are dropped.
    /// Env: `CHANNEL_BUFFER`
    /// Default: `256`
    pub channel_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Huddle".to_string(),
            max_message_len: MAX_MESSAGE_LEN,
            channel_buffer: CHANNEL_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME").filter(|n| !n.is_empty()) {
            config.instance_name = name;
        }

        if let Some(n) = lookup("MAX_MESSAGE_LEN").and_then(|v| v.parse::<usize>().ok()) {
            config.max_message_len = n;
        }

        if let Some(n) = lookup("CHANNEL_BUFFER")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            config.channel_buffer = n;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8000).into());
        assert_eq!(config.max_message_len, 4096);
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = ServerConfig::from_lookup(|key| match key {
            "HTTP_ADDR" => Some("127.0.0.1:9100".into()),
            "INSTANCE_NAME" => Some("Office".into()),
            "CHANNEL_BUFFER" => Some("0".into()),
            "MAX_MESSAGE_LEN" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9100).into());
        assert_eq!(config.instance_name, "Office");
        assert_eq!(config.channel_buffer, 256);
        assert_eq!(config.max_message_len, 4096);
    }
}
