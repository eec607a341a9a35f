//! Overlay configuration.

use serde::{Deserialize, Serialize};

/// How a node joins the overlay network.
///
/// # Examples
///
/// ```
/// use meshkv_overlay::OverlayConfig;
///
/// let config = OverlayConfig::default();
/// assert_eq!(config.port, 6379);
/// assert_eq!(config.channel, "metcd");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Host the overlay listens on.
    /// Default: "0.0.0.0"
    pub host: String,

    /// Port the overlay listens on.
    /// Default: 6379
    pub port: u16,

    /// Gossip channel the packet connection is registered on. Peers on other
    /// channels are not part of this cluster.
    /// Default: "metcd"
    pub channel: String,

    /// Optional shared secret authenticating overlay connections.
    pub password: Option<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6379,
            channel: "metcd".to_string(),
            password: None,
        }
    }
}

impl OverlayConfig {
    /// Returns the `host:port` this node advertises.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the overlay configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `host` is empty
    /// - `port` is 0
    /// - `channel` is empty
    /// - `password` is set but empty
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be > 0".to_string());
        }
        if self.channel.is_empty() {
            return Err("channel cannot be empty".to_string());
        }
        if matches!(&self.password, Some(p) if p.is_empty()) {
            return Err("password must not be empty when set".to_string());
        }
        Ok(())
    }
}
