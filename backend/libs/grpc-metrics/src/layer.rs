//! Tower layer instrumenting a tonic server
//!
//! Wraps the routed gRPC service so every HTTP/2 request is tracked in the
//! in-flight gauge until its response body ends. The call outcome comes from
//! the `grpc-status` trailer, or from the response headers for trailers-only
//! responses. Streaming methods also get their length-prefixed messages
//! counted in both directions.
//!
//! Usage:
//! ```ignore
//! let layer = GrpcMetricsLayer::new(interceptor.clone()).with_services(&services);
//! Server::builder()
//!     .layer(layer)
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```

use crate::collector::ServiceInfo;
use crate::interceptor::MetricsInterceptor;
use crate::labels::{CallInfo, CallShape, MessageLabels, Role};
use crate::metrics::Monitoring;
use crate::stats::{InFlightGuard, RpcTagInfo};
use crate::stream::{Completion, Direction};
use futures::ready;
use http::{HeaderMap, Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::transport::server::TcpConnectInfo;
use tonic::Code;
use tower::{Layer, Service};

const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Compressed flag + big-endian u32 length
const MESSAGE_HEADER_LEN: usize = 5;

fn status_code(headers: &HeaderMap) -> Option<Code> {
    headers
        .get(GRPC_STATUS_HEADER)
        .map(|status| Code::from_bytes(status.as_bytes()))
}

/// Tower layer recording gRPC server metrics
#[derive(Clone)]
pub struct GrpcMetricsLayer {
    interceptor: MetricsInterceptor,
    shapes: Arc<HashMap<String, CallShape>>,
}

impl GrpcMetricsLayer {
    pub fn new(interceptor: MetricsInterceptor) -> Self {
        Self {
            interceptor,
            shapes: Arc::new(HashMap::new()),
        }
    }

    /// Declare the served methods so streaming calls get their real shape;
    /// undeclared paths are recorded as unary
    pub fn with_services(mut self, services: &[ServiceInfo]) -> Self {
        let shapes = services
            .iter()
            .flat_map(|service| {
                service
                    .methods
                    .iter()
                    .map(move |method| (service.full_method(&method.name), method.shape()))
            })
            .collect();
        self.shapes = Arc::new(shapes);
        self
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetricsService {
            inner,
            interceptor: self.interceptor.clone(),
            shapes: self.shapes.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
    interceptor: MetricsInterceptor,
    shapes: Arc<HashMap<String, CallShape>>,
}

impl<S, ResBody> Service<Request<BoxBody>> for GrpcMetricsService<S>
where
    S: Service<Request<BoxBody>, Response = Response<ResBody>>,
    ResBody: Body,
{
    type Response = Response<GrpcMetricsBody<ResBody>>;
    type Error = S::Error;
    type Future = GrpcMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<BoxBody>) -> Self::Future {
        let path = req.uri().path().to_string();
        let shape = self.shapes.get(&path).copied().unwrap_or(CallShape::Unary);

        let mut call = CallInfo::streaming(
            path,
            matches!(shape, CallShape::ClientStream | CallShape::BidiStream),
            matches!(shape, CallShape::ServerStream | CallShape::BidiStream),
        )
        .with_fail_fast(false);
        call.peer = req
            .extensions()
            .get::<TcpConnectInfo>()
            .and_then(TcpConnectInfo::remote_addr);

        let monitoring = self.interceptor.monitoring.clone();
        let in_flight = self
            .interceptor
            .stats_handler()
            .track_rpc(&RpcTagInfo::new(call.method.clone(), call.fail_fast), Role::Server);
        let completion = Completion::start(monitoring.clone(), Role::Server, &call, shape);

        let sent = call
            .server_streaming
            .then(|| MessageTally::new(monitoring.clone(), &call, Direction::Outbound));
        let req = if call.client_streaming {
            let received = MessageTally::new(monitoring, &call, Direction::Inbound);
            req.map(|body| tonic::body::boxed(GrpcMetricsBody::new(body, Some(received), None)))
        } else {
            req
        };

        GrpcMetricsFuture {
            inner: self.inner.call(req),
            pending: Some(PendingCall {
                completion,
                in_flight,
                sent,
            }),
        }
    }
}

/// Bookkeeping carried from the request until the response body takes it
struct PendingCall {
    completion: Completion,
    in_flight: InFlightGuard,
    sent: Option<MessageTally>,
}

impl PendingCall {
    fn attach<B: Body>(self, response: Response<B>) -> Response<GrpcMetricsBody<B>> {
        let finished = match status_code(response.headers()) {
            // Trailers-only response: the status is already final
            Some(code) => Some(code),
            None if response.body().is_end_stream() => Some(Code::Ok),
            None => None,
        };

        match finished {
            Some(code) => {
                self.completion.finish(code);
                response.map(|body| GrpcMetricsBody::new(body, None, None))
            }
            None => {
                let open = OpenCall {
                    completion: self.completion,
                    _in_flight: self.in_flight,
                };
                response.map(|body| GrpcMetricsBody::new(body, self.sent, Some(open)))
            }
        }
    }
}

#[pin_project]
pub struct GrpcMetricsFuture<F> {
    #[pin]
    inner: F,
    pending: Option<PendingCall>,
}

impl<F, B, E> Future for GrpcMetricsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
{
    type Output = Result<Response<GrpcMetricsBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let pending = this.pending.take();

        Poll::Ready(match result {
            Ok(response) => Ok(match pending {
                Some(pending) => pending.attach(response),
                None => response.map(|body| GrpcMetricsBody::new(body, None, None)),
            }),
            Err(err) => {
                if let Some(pending) = pending {
                    pending.completion.finish(Code::Unknown);
                }
                Err(err)
            }
        })
    }
}

/// A call whose outcome is decided by the end of its response body.
/// Dropping it unfinished records `Canceled` and ends the in-flight span.
struct OpenCall {
    completion: Completion,
    _in_flight: InFlightGuard,
}

/// Counts gRPC messages crossing a body in one direction
struct MessageTally {
    monitoring: Arc<Monitoring>,
    labels: MessageLabels,
    direction: Direction,
    framing: MessageFraming,
}

impl MessageTally {
    fn new(monitoring: Arc<Monitoring>, call: &CallInfo, direction: Direction) -> Self {
        Self {
            monitoring,
            labels: MessageLabels::new(call),
            direction,
            framing: MessageFraming::default(),
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        let monitor = self.monitoring.monitor(Role::Server);
        for _ in 0..self.framing.feed(chunk) {
            match self.direction {
                Direction::Inbound => monitor.inc_received(&self.labels),
                Direction::Outbound => monitor.inc_sent(&self.labels),
            }
        }
    }
}

/// Tracks gRPC length-prefixed message boundaries across data chunks
#[derive(Debug, Default)]
struct MessageFraming {
    header: [u8; MESSAGE_HEADER_LEN],
    header_read: usize,
    remaining: usize,
}

impl MessageFraming {
    /// Consume a chunk, returning how many messages it completed
    fn feed(&mut self, mut chunk: &[u8]) -> u64 {
        let mut completed = 0;
        while !chunk.is_empty() {
            if self.remaining > 0 {
                let n = self.remaining.min(chunk.len());
                self.remaining -= n;
                chunk = &chunk[n..];
                if self.remaining == 0 {
                    completed += 1;
                }
                continue;
            }

            let n = (MESSAGE_HEADER_LEN - self.header_read).min(chunk.len());
            self.header[self.header_read..self.header_read + n].copy_from_slice(&chunk[..n]);
            self.header_read += n;
            chunk = &chunk[n..];

            if self.header_read == MESSAGE_HEADER_LEN {
                self.header_read = 0;
                let len = u32::from_be_bytes([
                    self.header[1],
                    self.header[2],
                    self.header[3],
                    self.header[4],
                ]);
                if len == 0 {
                    completed += 1;
                } else {
                    self.remaining = len as usize;
                }
            }
        }
        completed
    }
}

/// Body decorator used on both sides of an instrumented call.
///
/// Counts messages in data frames for streaming methods. On a response body
/// it also owns the open call: the outcome is recorded from the
/// `grpc-status` trailer, as `OK` at end of stream without trailers, as
/// `Unknown` on a body error, or as `Canceled` when dropped first.
#[pin_project]
pub struct GrpcMetricsBody<B> {
    #[pin]
    inner: B,
    tally: Option<MessageTally>,
    call: Option<OpenCall>,
}

impl<B> GrpcMetricsBody<B> {
    fn new(inner: B, tally: Option<MessageTally>, call: Option<OpenCall>) -> Self {
        Self { inner, tally, call }
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B> Body for GrpcMetricsBody<B>
where
    B: Body,
    B::Data: AsRef<[u8]>,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        let outcome = match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(tally) = this.tally.as_mut() {
                        tally.observe(data.as_ref());
                    }
                    None
                } else {
                    frame
                        .trailers_ref()
                        .map(|trailers| status_code(trailers).unwrap_or(Code::Ok))
                }
            }
            Some(Err(_)) => Some(Code::Unknown),
            None => Some(Code::Ok),
        };

        if let Some(code) = outcome {
            if let Some(call) = this.call.take() {
                call.completion.finish(code);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
