//! Transport selection configuration

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    20000
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:20001/rpc".to_string()
}

/// Which concrete transport a session connects through
///
/// Serialized as a TOML table tagged by `kind`, e.g.
///
/// ```toml
/// [transport]
/// kind = "tcp"
/// host = "10.0.0.5"
/// port = 20000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process paired endpoints, for tests and single-process setups
    Loopback,

    /// TCP stream
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },

    /// WebSocket connection
    Websocket {
        #[serde(default = "default_ws_url")]
        url: String,
    },

    /// Length-prefixed frames over a reliable-UDP medium
    ReliableUdp {
        #[serde(default = "default_host")]
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Loopback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_defaults_fill_in() {
        let config: TransportConfig = toml::from_str("kind = \"tcp\"").unwrap();
        assert_eq!(
            config,
            TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 20000,
            }
        );
    }

    #[test]
    fn test_roundtrip() {
        let config = TransportConfig::Websocket {
            url: "ws://example.net:9000/rpc".to_string(),
        };

        let text = toml::to_string(&config).unwrap();
        let parsed: TransportConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
