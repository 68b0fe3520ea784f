//! Configuration for sandboxed agent runs.

use std::time::Duration;

use crate::execution::ExecutionLimits;

/// Configuration for the sandbox runner.
///
/// Proxy addressing is injected here explicitly: `proxy_register_url` is the
/// host-side address used to register and unregister run credentials, and
/// `proxy_internal_url` is the address containers reach the proxy on. The
/// external inference endpoint itself is never part of this configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Docker image for agent execution.
    pub image: String,
    /// Maximum wall-clock execution time per run.
    pub timeout: Duration,
    /// Resource ceilings for each container.
    pub limits: ExecutionLimits,
    /// Docker network sandbox containers attach to. Should only route to
    /// the proxy's internal address.
    pub network: String,
    /// Host-side proxy base URL for credential register/unregister.
    /// `None` disables registration; the proxy then serves process defaults.
    pub proxy_register_url: Option<String>,
    /// Proxy base URL as seen from inside a container.
    pub proxy_internal_url: String,
    /// Interval between container state polls.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            timeout: Duration::from_secs(300),
            limits: ExecutionLimits::default(),
            network: "bridge".to_string(),
            proxy_register_url: Some("http://localhost:8001".to_string()),
            proxy_internal_url: "http://proxy:8001".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_proxy_register_url(mut self, url: Option<String>) -> Self {
        self.proxy_register_url = url;
        self
    }

    pub fn with_proxy_internal_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_internal_url = url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::new();
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.proxy_register_url.is_some());
    }

    #[test]
    fn test_builder() {
        let config = RunnerConfig::new()
            .with_image("python:3.12-slim")
            .with_timeout(Duration::from_secs(60))
            .with_network("agent-net")
            .with_proxy_register_url(None)
            .with_proxy_internal_url("http://10.0.0.2:9001");

        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.network, "agent-net");
        assert!(config.proxy_register_url.is_none());
        assert_eq!(config.proxy_internal_url, "http://10.0.0.2:9001");
    }
}
