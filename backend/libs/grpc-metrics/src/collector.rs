//! Prometheus collector adapter, registration and eager series creation

use crate::error::{MetricsError, Result};
use crate::interceptor::MetricsInterceptor;
use crate::labels::{CallInfo, CallShape, MessageLabels, RequestLabels, ALL_CODES};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{debug, error, info};

/// Method as declared by a service descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodInfo {
    pub fn shape(&self) -> CallShape {
        CallShape::classify(self.client_streaming, self.server_streaming)
    }
}

/// Service descriptor: fully-qualified service name and its methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// e.g. `grpc.health.v1.Health`
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        self.methods.push(MethodInfo {
            name: name.into(),
            client_streaming,
            server_streaming,
        });
        self
    }

    pub fn unary(self, name: impl Into<String>) -> Self {
        self.method(name, false, false)
    }

    /// Path of a method as it appears on the wire: `/{service}/{method}`
    pub fn full_method(&self, method: &str) -> String {
        format!("/{}/{}", self.name, method)
    }
}

impl Collector for MetricsInterceptor {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.monitoring.dialer.desc();
        descs.extend(self.monitoring.server.descs());
        descs.extend(self.monitoring.client.descs());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.monitoring.dialer.collect();
        families.extend(self.monitoring.server.families());
        families.extend(self.monitoring.client.families());
        families
    }
}

impl MetricsInterceptor {
    /// Register every family with `registry`.
    ///
    /// A second registration of the same families is a configuration
    /// error: it is logged once and returned, never retried.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry
            .register(Box::new(self.clone()))
            .map_err(|err| match err {
                prometheus::Error::AlreadyReg => {
                    error!("gRPC metrics collector is already registered");
                    MetricsError::AlreadyRegistered(
                        "gRPC metrics collector registered twice".to_string(),
                    )
                }
                other => {
                    error!(error = %other, "Failed to register gRPC metrics collector");
                    MetricsError::Prometheus(other)
                }
            })?;

        info!(track_peers = self.track_peers(), "gRPC metrics collector registered");
        Ok(())
    }

    /// Create every server request-level series (each status code) and
    /// message-level series (by method shape) at zero.
    ///
    /// Skipped when peer tracking is on, since peer values are unknown
    /// ahead of traffic.
    pub fn preregister(&self, services: &[ServiceInfo]) -> Result<()> {
        if self.track_peers() {
            debug!("Peer tracking enabled, skipping metrics pre-registration");
            return Ok(());
        }

        let server = self.server();
        for service in services {
            for method in &service.methods {
                let call = CallInfo::streaming(
                    service.full_method(&method.name),
                    method.client_streaming,
                    method.server_streaming,
                );

                for code in ALL_CODES {
                    server.touch_request(&RequestLabels::new(&call, code))?;
                }
                server.touch_messages(
                    &MessageLabels::new(&call),
                    method.client_streaming,
                    method.server_streaming,
                )?;
            }

            debug!(
                service = %service.name,
                methods = service.methods.len(),
                "Pre-registered gRPC metrics"
            );
        }

        Ok(())
    }
}

/// Render everything in `registry` in the text exposition format
pub fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| MetricsError::encode(e.to_string()))
}
