//! Metrics Service
//!
//! Hosts an instrumented gRPC server and exposes the collected gRPC
//! metrics for Prometheus scraping on `GET /metrics`.

pub mod config;
pub mod grpc;
pub mod http;
pub mod logging;

pub use config::{Config, ConfigError, LogFormat};
