//! gRPC Metrics - Prometheus instrumentation for tonic servers and clients
//!
//! This library records operational metrics around the gRPC call lifecycle
//! without touching the handlers themselves. It tracks, per role
//! (server/client):
//! - Open connections by local/remote address
//! - In-flight requests by service/method/fail-fast flag
//! - Requests, errors and latency by service/method/code/call shape
//! - Messages sent and received on streams
//! - Dial attempts by target address (client only)
//!
//! Usage:
//! ```ignore
//! use grpc_metrics::{GrpcMetricsLayer, MetricsConfig, MetricsInterceptor};
//!
//! let interceptor = MetricsInterceptor::new(MetricsConfig::default())?;
//! interceptor.register(&registry)?;
//!
//! Server::builder()
//!     .layer(GrpcMetricsLayer::new(interceptor.clone()))
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```

mod collector;
mod error;
mod interceptor;
pub mod labels;
pub mod layer;
mod metrics;
pub mod stats;
pub mod stream;

pub use collector::{render, MethodInfo, ServiceInfo};
pub use error::{MetricsError, Result};
pub use interceptor::{
    Dialer, MetricsInterceptor, StreamClientInterceptor, StreamServerInterceptor,
    UnaryClientInterceptor, UnaryServerInterceptor,
};
pub use labels::{split, CallInfo, CallShape, GrpcCode, Role};
pub use layer::{GrpcMetricsBody, GrpcMetricsLayer, GrpcMetricsService};
pub use metrics::{default_duration_buckets, MetricsConfig, Monitor, DEFAULT_NAMESPACE};
pub use stats::{ConnectionGuard, InFlightGuard, RpcTagInfo, StatsHandler, TrackedConnection};
pub use stream::{Direction, MonitoredStream};
