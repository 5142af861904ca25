//! Message-counting stream decorators
//!
//! [`MonitoredStream`] wraps any `futures` stream and/or sink and counts
//! messages per direction while forwarding payloads, errors and readiness
//! unchanged. The message labels are computed once when the wrapper is
//! created and reused for every message.

use crate::labels::{CallInfo, CallShape, GrpcCode, MessageLabels, RequestLabels, Role};
use crate::metrics::Monitoring;
use futures::{ready, Sink, Stream};
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::Code;

/// Which counter an item yielded by the wrapped `Stream` increments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Items read from the peer: `received_messages_total`
    Inbound,
    /// Items the transport pulls to send to the peer: `sent_messages_total`.
    ///
    /// Counted when the item is handed to the transport, not when its write
    /// completes. The `Sink` path counts only after `start_send` succeeds.
    Outbound,
}

/// One-shot terminal bookkeeping for a call.
///
/// Records requests_total, errors_total and request_duration_seconds
/// exactly once: on [`finish`](Completion::finish), or as `Cancelled`
/// when dropped unfinished.
pub(crate) struct Completion {
    monitoring: Arc<Monitoring>,
    role: Role,
    labels: RequestLabels,
    start: Instant,
    finished: bool,
}

impl Completion {
    pub(crate) fn start(
        monitoring: Arc<Monitoring>,
        role: Role,
        call: &CallInfo,
        shape: CallShape,
    ) -> Self {
        let mut labels = RequestLabels::new(call, Code::Ok);
        labels.shape = shape;
        Self {
            monitoring,
            role,
            labels,
            start: Instant::now(),
            finished: false,
        }
    }

    pub(crate) fn finish(mut self, code: Code) {
        self.record(code);
    }

    fn record(&mut self, code: Code) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.labels.code = code;
        self.monitoring
            .monitor(self.role)
            .record_request(&self.labels, self.start.elapsed().as_secs_f64());
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.record(Code::Cancelled);
    }
}

/// Stream/sink decorator counting messages for one call
#[pin_project]
pub struct MonitoredStream<S> {
    #[pin]
    inner: S,
    monitoring: Arc<Monitoring>,
    role: Role,
    labels: MessageLabels,
    direction: Direction,
    completion: Option<Completion>,
}

impl<S> MonitoredStream<S> {
    pub(crate) fn new(
        inner: S,
        monitoring: Arc<Monitoring>,
        role: Role,
        labels: MessageLabels,
        direction: Direction,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            inner,
            monitoring,
            role,
            labels,
            direction,
            completion,
        }
    }

    /// Message labels fixed at creation
    pub fn labels(&self) -> &MessageLabels {
        &self.labels
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut S> {
        self.project().inner
    }
}

impl<S, T, E> Stream for MonitoredStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: GrpcCode,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));
        let monitor = this.monitoring.monitor(*this.role);

        match &item {
            Some(Ok(_)) => match this.direction {
                Direction::Inbound => monitor.inc_received(this.labels),
                Direction::Outbound => monitor.inc_sent(this.labels),
            },
            Some(Err(err)) => {
                if let Some(completion) = this.completion.take() {
                    completion.finish(err.grpc_code());
                }
            }
            None => {
                if let Some(completion) = this.completion.take() {
                    completion.finish(Code::Ok);
                }
            }
        }

        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S, Item> Sink<Item> for MonitoredStream<S>
where
    S: Sink<Item>,
{
    type Error = S::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
        let this = self.project();
        this.inner.start_send(item)?;
        this.monitoring.monitor(*this.role).inc_sent(this.labels);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}
