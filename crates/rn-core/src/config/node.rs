//! Node configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Registry URI used when neither config nor environment names one
pub const DEFAULT_MASTER_URI: &str = "http://localhost:11311/";

/// Configuration for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// URI of the registry
    pub master_uri: String,

    /// Address the peer listener binds to
    pub bind_address: String,

    /// Port for the peer listener (0 picks an ephemeral port)
    pub tcpros_port: u16,

    /// Host name advertised to peers. Falls back to `ROS_IP`,
    /// `ROS_HOSTNAME`, then the machine hostname.
    pub advertised_host: Option<String>,

    /// Append `_<pid>_<millis>` to the node name
    pub anonymous: bool,

    /// Disable Nagle on accepted subscriber sockets unless overridden
    pub tcp_nodelay: bool,

    /// Queue bound for endpoints that don't specify one
    pub default_queue_size: usize,

    /// Throttle for endpoints that don't specify one (0 = unbounded rate)
    pub default_throttle_ms: i64,

    /// Retry policy while waiting for the registry
    pub master_backoff: BackoffConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master_uri: std::env::var("ROS_MASTER_URI")
                .unwrap_or_else(|_| DEFAULT_MASTER_URI.to_string()),
            bind_address: "0.0.0.0".to_string(),
            tcpros_port: 0,
            advertised_host: None,
            anonymous: false,
            tcp_nodelay: false,
            default_queue_size: 1,
            default_throttle_ms: 0,
            master_backoff: BackoffConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Address string for binding the peer listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.tcpros_port)
    }

    /// Host name other nodes should use to reach this one
    pub fn resolve_advertised_host(&self) -> String {
        if let Some(host) = self.advertised_host.as_ref().filter(|h| !h.is_empty()) {
            return host.clone();
        }
        for var in ["ROS_IP", "ROS_HOSTNAME"] {
            if let Ok(host) = std::env::var(var) {
                if !host.is_empty() {
                    return host;
                }
            }
        }
        gethostname::gethostname().to_string_lossy().into_owned()
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_host_wins() {
        let config = NodeConfig {
            advertised_host: Some("10.0.0.7".to_string()),
            ..NodeConfig::default()
        };
        assert_eq!(config.resolve_advertised_host(), "10.0.0.7");
    }

    #[test]
    fn test_backoff_defaults() {
        let backoff = BackoffConfig::default();
        assert!(backoff.initial < backoff.max);
        assert!((0.0..=1.0).contains(&backoff.jitter));
    }

    #[test]
    fn test_listen_address() {
        let config = NodeConfig {
            bind_address: "127.0.0.1".to_string(),
            tcpros_port: 0,
            ..NodeConfig::default()
        };
        assert_eq!(config.listen_address(), "127.0.0.1:0");
    }
}
