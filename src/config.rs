use std::time::Duration;

use crate::error::{MuError, Result};
use crate::protocol::{Address, ServerType};

/// Default write-idle interval before a worker connection sends a heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time an `ask` waits for its reply
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound for establishing one outbound connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of one Mu endpoint
#[derive(Debug, Clone)]
pub struct MuConfig {
    /// Address the listener binds to; port 0 lets the OS pick one
    pub bind_address: Address,
    pub server_type: ServerType,
    /// Address advertised to peers in heartbeats, when it differs from the bound one
    pub external_address: Option<Address>,
    pub heartbeat_interval: Duration,
    pub ask_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for MuConfig {
    fn default() -> Self {
        Self {
            bind_address: Address::new("127.0.0.1", 0),
            server_type: ServerType::Server,
            external_address: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl MuConfig {
    pub fn new(bind_address: Address, server_type: ServerType) -> Self {
        Self {
            bind_address,
            server_type,
            ..Self::default()
        }
    }

    /// Coordinator endpoint bound to `bind_address`
    pub fn server(bind_address: Address) -> Self {
        Self::new(bind_address, ServerType::Server)
    }

    /// Worker endpoint bound to `bind_address`
    pub fn worker(bind_address: Address) -> Self {
        Self::new(bind_address, ServerType::Worker)
    }

    pub fn with_external_address(mut self, address: Address) -> Self {
        self.external_address = Some(address);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject settings no endpoint can run with.
    ///
    /// A zero heartbeat interval would make every idle worker connection
    /// write heartbeats back to back.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(MuError::InvalidConfig("heartbeat_interval must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MuConfig::default();

        assert_eq!(config.bind_address, Address::new("127.0.0.1", 0));
        assert_eq!(config.server_type, ServerType::Server);
        assert_eq!(config.external_address, None);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.ask_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builders() {
        let config = MuConfig::worker("0.0.0.0:27777".parse().unwrap())
            .with_external_address(Address::new("203.0.113.9", 27777))
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_ask_timeout(Duration::from_secs(3))
            .with_connect_timeout(Duration::from_millis(500));

        assert_eq!(config.server_type, ServerType::Worker);
        assert_eq!(config.bind_address.port, 27777);
        assert_eq!(config.external_address, Some(Address::new("203.0.113.9", 27777)));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.ask_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_millis(500));

        // the original default is untouched
        assert_eq!(MuConfig::server(Address::new("127.0.0.1", 0)).ask_timeout, DEFAULT_ASK_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_interval_is_rejected() {
        let config = MuConfig::worker(Address::new("127.0.0.1", 0)).with_heartbeat_interval(Duration::ZERO);

        let result = config.validate();
        assert!(matches!(result, Err(MuError::InvalidConfig(ref m)) if m.contains("heartbeat_interval")));
        assert!(MuConfig::default().validate().is_ok());
    }
}
