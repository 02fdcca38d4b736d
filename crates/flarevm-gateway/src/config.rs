//! Gateway configuration types.
//!
//! This module defines the configuration for the HTTP/WebSocket gateway and
//! the service it embeds, read from environment variables at startup.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use flarevm_auth::AuthConfig;
use flarevm_control::{ControlConfig, MetricsConfig, NetworkConfig};

/// A configuration value that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    /// Environment variable name.
    pub var: &'static str,
    /// Offending value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Configuration for the gateway service.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "GatewayConfig::default_listen_addr")]
    pub listen_addr: String,

    /// `RocksDB` data directory.
    #[serde(default = "GatewayConfig::default_data_dir")]
    pub data_dir: String,

    /// Base URL of the hypervisor host agent; `None` runs in local mode.
    #[serde(default)]
    pub hypervisor_url: Option<String>,

    /// Shared secret for HS256 tokens.
    #[serde(default)]
    pub jwt_secret: String,

    /// Expected token issuer.
    #[serde(default = "GatewayConfig::default_jwt_issuer")]
    pub jwt_issuer: String,

    /// Expected token audience.
    #[serde(default = "GatewayConfig::default_jwt_audience")]
    pub jwt_audience: String,

    /// Network namespace VMs are attached to.
    #[serde(default = "GatewayConfig::default_network_namespace")]
    pub network_namespace: String,

    /// First address of the VM network pool.
    #[serde(default = "GatewayConfig::default_network_subnet")]
    pub network_subnet: Ipv4Addr,

    /// Number of VMs the network pool can hold.
    #[serde(default = "GatewayConfig::default_network_capacity")]
    pub network_capacity: u32,

    /// Seconds between metrics samples.
    #[serde(default = "GatewayConfig::default_metrics_interval")]
    pub metrics_interval_seconds: u64,

    /// Port of the in-guest console agent.
    #[serde(default = "GatewayConfig::default_console_port")]
    pub console_port: u16,

    /// Maximum number of VMs per user.
    #[serde(default = "GatewayConfig::default_max_vms_per_user")]
    pub max_vms_per_user: u32,

    /// Allowed CORS origins.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    #[serde(default = "GatewayConfig::default_max_body")]
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    #[serde(default = "GatewayConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl GatewayConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_data_dir() -> String {
        "/var/lib/flarevm".to_string()
    }

    fn default_jwt_issuer() -> String {
        "flarevm-auth".to_string()
    }

    fn default_jwt_audience() -> String {
        "flarevm".to_string()
    }

    fn default_network_namespace() -> String {
        NetworkConfig::default().namespace
    }

    fn default_network_subnet() -> Ipv4Addr {
        NetworkConfig::default().subnet
    }

    fn default_network_capacity() -> u32 {
        NetworkConfig::default().capacity
    }

    const fn default_metrics_interval() -> u64 {
        5
    }

    const fn default_console_port() -> u16 {
        7681
    }

    const fn default_max_vms_per_user() -> u32 {
        10
    }

    const fn default_max_body() -> usize {
        1024 * 1024 // 1 MB
    }

    const fn default_request_timeout() -> u64 {
        60
    }

    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or address variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`, starting from the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or address variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("LISTEN_ADDR") {
            config.listen_addr = value;
        }
        if let Some(value) = lookup("DATA_DIR") {
            config.data_dir = value;
        }
        config.hypervisor_url = lookup("HYPERVISOR_URL").filter(|url| !url.trim().is_empty());
        if let Some(value) = lookup("JWT_SECRET") {
            config.jwt_secret = value;
        }
        if let Some(value) = lookup("JWT_ISSUER") {
            config.jwt_issuer = value;
        }
        if let Some(value) = lookup("JWT_AUDIENCE") {
            config.jwt_audience = value;
        }
        if let Some(value) = lookup("NETWORK_NAMESPACE") {
            config.network_namespace = value;
        }
        if let Some(value) = lookup("CORS_ORIGINS") {
            config.cors_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        parse_var(&lookup, "NETWORK_SUBNET", &mut config.network_subnet)?;
        parse_var(&lookup, "NETWORK_CAPACITY", &mut config.network_capacity)?;
        parse_var(&lookup, "METRICS_INTERVAL_SECONDS", &mut config.metrics_interval_seconds)?;
        parse_var(&lookup, "CONSOLE_PORT", &mut config.console_port)?;
        parse_var(&lookup, "MAX_VMS_PER_USER", &mut config.max_vms_per_user)?;

        if config.metrics_interval_seconds == 0 {
            return Err(ConfigError {
                var: "METRICS_INTERVAL_SECONDS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Token validation settings.
    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
        }
    }

    /// Control plane settings.
    #[must_use]
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            max_vms_per_user: self.max_vms_per_user,
            network: NetworkConfig {
                namespace: self.network_namespace.clone(),
                subnet: self.network_subnet,
                capacity: self.network_capacity,
                ..NetworkConfig::default()
            },
            metrics: MetricsConfig {
                interval: Duration::from_secs(self.metrics_interval_seconds),
                ..MetricsConfig::default()
            },
            ..ControlConfig::default()
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    target: &mut T,
) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = lookup(var) {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError {
            var,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            data_dir: Self::default_data_dir(),
            hypervisor_url: None,
            jwt_secret: String::new(),
            jwt_issuer: Self::default_jwt_issuer(),
            jwt_audience: Self::default_jwt_audience(),
            network_namespace: Self::default_network_namespace(),
            network_subnet: Self::default_network_subnet(),
            network_capacity: Self::default_network_capacity(),
            metrics_interval_seconds: Self::default_metrics_interval(),
            console_port: Self::default_console_port(),
            max_vms_per_user: Self::default_max_vms_per_user(),
            cors_origins: vec!["*".to_string()],
            max_body_bytes: Self::default_max_body(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.network_namespace, "flarevm");
        assert!(config.hypervisor_url.is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn reads_environment() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("HYPERVISOR_URL", "http://10.0.0.1:8081"),
            ("NETWORK_SUBNET", "10.20.0.0"),
            ("NETWORK_CAPACITY", "64"),
            ("METRICS_INTERVAL_SECONDS", "15"),
            ("MAX_VMS_PER_USER", "2"),
            ("CORS_ORIGINS", "https://a.example, https://b.example"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.hypervisor_url.as_deref(), Some("http://10.0.0.1:8081"));
        assert_eq!(config.cors_origins.len(), 2);

        let control = config.control_config();
        assert_eq!(control.max_vms_per_user, 2);
        assert_eq!(control.network.subnet, Ipv4Addr::new(10, 20, 0, 0));
        assert_eq!(control.network.capacity, 64);
        assert_eq!(control.metrics.interval, Duration::from_secs(15));
    }

    #[test]
    fn empty_hypervisor_url_means_local_mode() {
        let config = GatewayConfig::from_lookup(lookup(&[("HYPERVISOR_URL", " ")])).unwrap();
        assert!(config.hypervisor_url.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        let err = GatewayConfig::from_lookup(lookup(&[("NETWORK_CAPACITY", "lots")])).unwrap_err();
        assert_eq!(err.var, "NETWORK_CAPACITY");

        assert!(GatewayConfig::from_lookup(lookup(&[("NETWORK_SUBNET", "10.0.0")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("METRICS_INTERVAL_SECONDS", "0")])).is_err());
    }

    #[test]
    fn auth_settings() {
        let config = GatewayConfig::from_lookup(lookup(&[("JWT_SECRET", "s3cret")])).unwrap();
        let auth = config.auth_config();
        assert_eq!(auth.secret, "s3cret");
        assert_eq!(auth.audience, "flarevm");
    }
}
