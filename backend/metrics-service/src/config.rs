use grpc_metrics::MetricsConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Environment variable prefix, e.g. `METRICS_SERVICE_GRPC_PORT`
pub const ENV_PREFIX: &str = "METRICS_SERVICE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Label server request metrics with the caller's address
    #[serde(default)]
    pub track_peers: bool,
    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_grpc_port() -> u16 {
    9090
}

fn default_http_port() -> u16 {
    8080
}

fn default_metrics_namespace() -> String {
    grpc_metrics::DEFAULT_NAMESPACE.to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.grpc_port == self.http_port {
            return Err(ConfigError::Invalid(format!(
                "gRPC and HTTP ports must differ (both {})",
                self.grpc_port
            )));
        }
        if self.metrics_namespace.is_empty() {
            return Err(ConfigError::Invalid(
                "metrics namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr(self.grpc_port)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr(self.http_port)
    }

    fn addr(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid listen address: {}", e)))
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig::default()
            .with_track_peers(self.track_peers)
            .with_namespace(self.metrics_namespace.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(Vec::new()).unwrap();

        assert_eq!(config.grpc_port, 9090);
        assert_eq!(config.http_port, 8080);
        assert!(!config.track_peers);
        assert_eq!(config.metrics_namespace, "grpc");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.grpc_addr().unwrap().to_string(), "0.0.0.0:9090");
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = Config::from_vars(vars(&[
            ("METRICS_SERVICE_GRPC_PORT", "50051"),
            ("METRICS_SERVICE_TRACK_PEERS", "true"),
            ("METRICS_SERVICE_LOG_FORMAT", "json"),
            ("GRPC_PORT", "1"),
        ]))
        .unwrap();

        assert_eq!(config.grpc_port, 50051);
        assert!(config.track_peers);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.metrics_config().track_peers);
    }

    #[test]
    fn test_same_ports_rejected() {
        let err = Config::from_vars(vars(&[
            ("METRICS_SERVICE_GRPC_PORT", "8080"),
            ("METRICS_SERVICE_HTTP_PORT", "8080"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_port_is_env_error() {
        let err = Config::from_vars(vars(&[("METRICS_SERVICE_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
    }
}
