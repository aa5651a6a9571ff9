//! Transport configuration.

use std::time::Duration;

/// Listener configuration for one node.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address shared by both listeners.
    pub host: String,
    pub stream: StreamConfig,
    pub datagram: DatagramConfig,
    /// How long `serve` waits for in-flight calls after shutdown is signalled.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            stream: StreamConfig::default(),
            datagram: DatagramConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection-oriented transport settings, used by both the listener and
/// client connections.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub enabled: bool,
    /// 0 means OS-assigned.
    pub port: u16,
    /// Upper bound for one length-delimited frame.
    pub max_frame_length: usize,
    /// Bounded outbound queue per connection.
    pub outbound_channel_capacity: usize,
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            max_frame_length: 4 * 1024 * 1024,
            outbound_channel_capacity: 256,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Datagram transport settings.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub enabled: bool,
    /// 0 means OS-assigned.
    pub port: u16,
    /// Receive buffer size; larger datagrams are truncated by the OS.
    pub max_datagram_size: usize,
    /// Client wait for the reply when the call context has no deadline.
    pub default_timeout: Duration,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            max_datagram_size: 4096,
            default_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.stream.enabled && config.datagram.enabled);
        assert_eq!(config.stream.port, 0);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn frame_and_datagram_limits() {
        assert_eq!(StreamConfig::default().max_frame_length, 4_194_304);
        assert_eq!(DatagramConfig::default().max_datagram_size, 4096);
    }
}
