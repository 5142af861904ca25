//! Error types for metrics registration and export

use thiserror::Error;

/// Result type for metrics operations
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Errors surfaced while building, registering or exporting metric families
///
/// Recording an observation never fails: every family is declared with a
/// fixed label-key set at construction, so the only failures are
/// startup-time configuration defects.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric family could not be declared or resolved
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// The collector was registered with a registry more than once
    #[error("Metrics collector already registered: {0}")]
    AlreadyRegistered(String),

    /// Text exposition failed
    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

impl MetricsError {
    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }
}
