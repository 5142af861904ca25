//! Call-lifecycle interceptors
//!
//! [`MetricsInterceptor`] owns every metric family and hands out the four
//! interceptors (unary/stream × server/client), the transport statistics
//! hook and the dialer instrumentation. Each interceptor takes the call as
//! a continuation and returns the continuation's result untouched; the
//! outcome is only classified for labeling.

use crate::error::Result;
use crate::labels::{code_of, CallInfo, CallShape, GrpcCode, MessageLabels, Role};
use crate::metrics::{MetricsConfig, Monitor, Monitoring};
use crate::stats::StatsHandler;
use crate::stream::{Completion, Direction, MonitoredStream};
use http::Uri;
use prometheus::IntCounterVec;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::debug;

/// Owner of all gRPC metric families
///
/// Build one per process and hand clones to whatever constructs the
/// servers and clients; clones share the same families.
#[derive(Clone)]
pub struct MetricsInterceptor {
    pub(crate) monitoring: Arc<Monitoring>,
    track_peers: bool,
}

impl MetricsInterceptor {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let monitoring = Monitoring::new(&config)?;
        Ok(Self {
            monitoring: Arc::new(monitoring),
            track_peers: config.track_peers,
        })
    }

    pub fn track_peers(&self) -> bool {
        self.track_peers
    }

    /// Server role families
    pub fn server(&self) -> &Monitor {
        &self.monitoring.server
    }

    /// Client role families
    pub fn client(&self) -> &Monitor {
        &self.monitoring.client
    }

    /// Dial attempts by target address
    pub fn reconnects_total(&self) -> &IntCounterVec {
        &self.monitoring.dialer
    }

    pub fn unary_server(&self) -> UnaryServerInterceptor {
        UnaryServerInterceptor {
            monitoring: self.monitoring.clone(),
        }
    }

    pub fn unary_client(&self) -> UnaryClientInterceptor {
        UnaryClientInterceptor {
            monitoring: self.monitoring.clone(),
        }
    }

    pub fn stream_server(&self) -> StreamServerInterceptor {
        StreamServerInterceptor {
            monitoring: self.monitoring.clone(),
        }
    }

    pub fn stream_client(&self) -> StreamClientInterceptor {
        StreamClientInterceptor {
            monitoring: self.monitoring.clone(),
        }
    }

    pub fn stats_handler(&self) -> StatsHandler {
        StatsHandler::new(self.monitoring.clone())
    }

    /// Count a dial attempt to `address`, then run `connect`
    pub async fn dial<F, Fut, T, E>(&self, address: &str, connect: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.monitoring.dialer.with_label_values(&[address]).inc();
        debug!(address = %address, "Dialing gRPC endpoint");
        connect().await
    }

    /// Wrap a connector (e.g. for `Endpoint::connect_with_connector`) so
    /// every connection attempt is counted
    pub fn dialer<C>(&self, connector: C) -> Dialer<C> {
        Dialer {
            inner: connector,
            dialer: self.monitoring.dialer.clone(),
        }
    }
}

/// Server-side interceptor for unary calls
#[derive(Clone)]
pub struct UnaryServerInterceptor {
    monitoring: Arc<Monitoring>,
}

impl UnaryServerInterceptor {
    /// Run `handler` for the call described by `call` and record its
    /// outcome. The handler's response or error is returned unchanged.
    pub async fn intercept<F, Fut, T, E>(&self, call: &CallInfo, handler: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: GrpcCode,
    {
        let completion = Completion::start(
            self.monitoring.clone(),
            Role::Server,
            call,
            CallShape::Unary,
        );
        let result = handler().await;
        completion.finish(code_of(&result));
        result
    }
}

/// Client-side interceptor for unary calls; never attaches peer labels
#[derive(Clone)]
pub struct UnaryClientInterceptor {
    monitoring: Arc<Monitoring>,
}

impl UnaryClientInterceptor {
    pub async fn intercept<F, Fut, T, E>(&self, call: &CallInfo, invoker: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: GrpcCode,
    {
        let completion = Completion::start(
            self.monitoring.clone(),
            Role::Client,
            call,
            CallShape::Unary,
        );
        let result = invoker().await;
        completion.finish(code_of(&result));
        result
    }
}

/// Server-side interceptor for streaming calls
#[derive(Clone)]
pub struct StreamServerInterceptor {
    monitoring: Arc<Monitoring>,
}

impl StreamServerInterceptor {
    /// Hand `handler` a message-counting wrapper around `stream` and
    /// record the call outcome once the handler returns
    pub async fn intercept<S, F, Fut, T, E>(
        &self,
        call: &CallInfo,
        stream: S,
        handler: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(MonitoredStream<S>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: GrpcCode,
    {
        let completion = Completion::start(
            self.monitoring.clone(),
            Role::Server,
            call,
            call.shape(),
        );
        let monitored = self.wrap(call, stream, Direction::Inbound, None);
        let result = handler(monitored).await;
        completion.finish(code_of(&result));
        result
    }

    /// Count messages read from an incoming request stream
    /// (e.g. `tonic::Streaming<T>`)
    pub fn monitor_request<S>(&self, call: &CallInfo, stream: S) -> MonitoredStream<S> {
        self.wrap(call, stream, Direction::Inbound, None)
    }

    /// Count messages of an outgoing response stream and record the call
    /// outcome when the stream ends, fails, or is dropped by the transport
    pub fn monitor_response<S>(&self, call: &CallInfo, stream: S) -> MonitoredStream<S> {
        let completion = Completion::start(
            self.monitoring.clone(),
            Role::Server,
            call,
            call.shape(),
        );
        self.wrap(call, stream, Direction::Outbound, Some(completion))
    }

    fn wrap<S>(
        &self,
        call: &CallInfo,
        stream: S,
        direction: Direction,
        completion: Option<Completion>,
    ) -> MonitoredStream<S> {
        MonitoredStream::new(
            stream,
            self.monitoring.clone(),
            Role::Server,
            MessageLabels::new(call),
            direction,
            completion,
        )
    }
}

/// Client-side interceptor for streaming calls
#[derive(Clone)]
pub struct StreamClientInterceptor {
    monitoring: Arc<Monitoring>,
}

impl StreamClientInterceptor {
    /// Open a stream with `streamer` and wrap it.
    ///
    /// A failed open is recorded immediately and the error returned as is.
    /// Otherwise the call outcome is recorded when the returned stream
    /// ends, yields an error, or is dropped early (as `Cancelled`).
    pub async fn intercept<S, F, Fut, E>(
        &self,
        call: &CallInfo,
        streamer: F,
    ) -> std::result::Result<MonitoredStream<S>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<S, E>>,
        E: GrpcCode,
    {
        let completion = Completion::start(
            self.monitoring.clone(),
            Role::Client,
            call,
            call.shape(),
        );

        match streamer().await {
            Ok(stream) => Ok(MonitoredStream::new(
                stream,
                self.monitoring.clone(),
                Role::Client,
                MessageLabels::new(call),
                Direction::Inbound,
                Some(completion),
            )),
            Err(err) => {
                completion.finish(err.grpc_code());
                Err(err)
            }
        }
    }

    /// Count messages of an outgoing request stream handed to a tonic
    /// client-streaming call
    pub fn monitor_outbound<S>(&self, call: &CallInfo, stream: S) -> MonitoredStream<S> {
        MonitoredStream::new(
            stream,
            self.monitoring.clone(),
            Role::Client,
            MessageLabels::new(call),
            Direction::Outbound,
            None,
        )
    }
}

/// Connector wrapper counting every dial attempt by target authority
#[derive(Clone)]
pub struct Dialer<C> {
    inner: C,
    dialer: IntCounterVec,
}

impl<C> Service<Uri> for Dialer<C>
where
    C: Service<Uri>,
{
    type Response = C::Response;
    type Error = C::Error;
    type Future = C::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let address = uri
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_else(|| uri.to_string());
        self.dialer.with_label_values(&[address.as_str()]).inc();
        debug!(address = %address, "Dialing gRPC endpoint");
        self.inner.call(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::{Code, Status};

    #[tokio::test]
    async fn test_unary_server_forwards_response() {
        let interceptor = MetricsInterceptor::new(MetricsConfig::default()).unwrap();
        let call = CallInfo::unary("/demo.Echo/Say");

        let response = interceptor
            .unary_server()
            .intercept(&call, || async { Ok::<_, Status>("hello") })
            .await;

        assert_eq!(response.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unary_server_forwards_error_unchanged() {
        let interceptor = MetricsInterceptor::new(MetricsConfig::default()).unwrap();
        let call = CallInfo::unary("/demo.Echo/Say");

        let err = interceptor
            .unary_server()
            .intercept(&call, || async {
                Err::<(), _>(Status::permission_denied("nope"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.message(), "nope");
    }

    #[tokio::test]
    async fn test_dial_counts_attempts() {
        let interceptor = MetricsInterceptor::new(MetricsConfig::default()).unwrap();

        let first = interceptor
            .dial("10.0.0.2:9090", || async { Err::<(), _>("refused") })
            .await;
        let second = interceptor
            .dial("10.0.0.2:9090", || async { Ok::<_, &str>(42) })
            .await;

        assert_eq!(first, Err("refused"));
        assert_eq!(second, Ok(42));
        assert_eq!(
            interceptor
                .reconnects_total()
                .with_label_values(&["10.0.0.2:9090"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_dialer_connector_counts_authority() {
        use tower::ServiceExt;

        let interceptor = MetricsInterceptor::new(MetricsConfig::default()).unwrap();
        let connector = tower::service_fn(|_uri: Uri| async { Ok::<_, std::io::Error>(()) });
        let dialer = interceptor.dialer(connector);

        let uri: Uri = "http://backend.internal:50051".parse().unwrap();
        dialer.oneshot(uri).await.unwrap();

        assert_eq!(
            interceptor
                .reconnects_total()
                .with_label_values(&["backend.internal:50051"])
                .get(),
            1
        );
    }
}
