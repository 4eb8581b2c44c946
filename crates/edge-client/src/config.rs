//! Edge client configuration

use edge_connection::ReconnectConfig;
use std::time::Duration;

/// Edge client configuration
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Relay server address ("host:port")
    pub server_addr: String,
    /// Shared secret presented during the handshake
    pub auth_token: String,
    /// Local service address relayed streams are bridged to
    pub local_addr: String,
    /// Timeout for TCP connects (relay and local service)
    pub connect_timeout: Duration,
    /// Timeout for the authentication exchange
    pub handshake_timeout: Duration,
    /// Interval between Ping probes
    pub heartbeat_interval: Duration,
    /// Silence threshold after which the session counts as lost
    pub heartbeat_timeout: Duration,
    /// Active time after which the reconnect attempt counter resets
    pub stability_threshold: Duration,
    /// How long teardown may take before remaining tasks are aborted
    pub shutdown_grace: Duration,
    /// Treat an authentication rejection as fatal instead of retrying
    pub auth_failure_fatal: bool,
    /// Outbound frame queue capacity (write-path backpressure)
    pub send_queue_capacity: usize,
    /// Reconnect backoff policy
    pub reconnect: ReconnectConfig,
}

impl EdgeConfig {
    /// Configuration with default timeouts and reconnect policy.
    pub fn new(server_addr: String, auth_token: String, local_addr: String) -> Self {
        Self {
            server_addr,
            auth_token,
            local_addr,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            stability_threshold: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            auth_failure_fatal: false,
            send_queue_capacity: 128,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn builder() -> EdgeConfigBuilder {
        EdgeConfigBuilder::default()
    }
}

/// Builder for [`EdgeConfig`]
pub struct EdgeConfigBuilder {
    config: EdgeConfig,
}

impl Default for EdgeConfigBuilder {
    fn default() -> Self {
        Self {
            config: EdgeConfig::new(String::new(), String::new(), String::new()),
        }
    }
}

impl EdgeConfigBuilder {
    pub fn server_addr(mut self, addr: String) -> Self {
        self.config.server_addr = addr;
        self
    }

    pub fn auth_token(mut self, token: String) -> Self {
        self.config.auth_token = token;
        self
    }

    pub fn local_addr(mut self, addr: String) -> Self {
        self.config.local_addr = addr;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn stability_threshold(mut self, threshold: Duration) -> Self {
        self.config.stability_threshold = threshold;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn auth_failure_fatal(mut self, fatal: bool) -> Self {
        self.config.auth_failure_fatal = fatal;
        self
    }

    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> Result<EdgeConfig, String> {
        if self.config.server_addr.is_empty() {
            return Err("server_addr is required".to_string());
        }
        if !self.config.server_addr.contains(':') {
            return Err("server_addr must be in host:port form".to_string());
        }
        if self.config.auth_token.is_empty() {
            return Err("auth_token is required".to_string());
        }
        if self.config.local_addr.is_empty() {
            return Err("local_addr is required".to_string());
        }
        if !self.config.local_addr.contains(':') {
            return Err("local_addr must be in host:port form".to_string());
        }
        if self.config.heartbeat_timeout <= self.config.heartbeat_interval {
            return Err("heartbeat_timeout must exceed heartbeat_interval".to_string());
        }
        if self.config.send_queue_capacity == 0 {
            return Err("send_queue_capacity must be nonzero".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EdgeConfig::builder()
            .server_addr("relay.example.com:4433".to_string())
            .auth_token("secret-token".to_string())
            .local_addr("127.0.0.1:8080".to_string())
            .build()
            .unwrap();

        assert_eq!(config.server_addr, "relay.example.com:4433");
        assert_eq!(config.auth_token, "secret-token");
        assert!(!config.auth_failure_fatal);
    }

    #[test]
    fn test_config_builder_missing_token() {
        let result = EdgeConfig::builder()
            .server_addr("relay.example.com:4433".to_string())
            .local_addr("127.0.0.1:8080".to_string())
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_rejects_bare_host() {
        let result = EdgeConfig::builder()
            .server_addr("relay.example.com".to_string())
            .auth_token("secret-token".to_string())
            .local_addr("127.0.0.1:8080".to_string())
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_validates_heartbeat() {
        let result = EdgeConfig::builder()
            .server_addr("relay.example.com:4433".to_string())
            .auth_token("secret-token".to_string())
            .local_addr("127.0.0.1:8080".to_string())
            .heartbeat_interval(Duration::from_secs(30))
            .heartbeat_timeout(Duration::from_secs(30))
            .build();

        assert!(result.is_err());
    }
}
