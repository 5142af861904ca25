//! Transport statistics hook
//!
//! Connection and RPC begin/end events observed directly from the
//! transport, independent of the interceptor chain. Begin events return a
//! tag carrying the labels resolved at that moment; the matching end event
//! consumes the tag, so the series decremented is always the series that
//! was incremented.

use crate::labels::{ConnLabels, Role, RpcLabels};
use crate::metrics::Monitoring;
use pin_project::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tonic::transport::server::Connected;
use tracing::trace;

/// Metadata available when an RPC is tagged
#[derive(Debug, Clone)]
pub struct RpcTagInfo {
    /// Fully-qualified method name, e.g. `/demo.Echo/Say`
    pub full_method: String,
    pub fail_fast: bool,
}

impl RpcTagInfo {
    pub fn new(full_method: impl Into<String>, fail_fast: bool) -> Self {
        Self {
            full_method: full_method.into(),
            fail_fast,
        }
    }
}

/// Correlation object for one connection, produced at begin
#[derive(Debug)]
pub struct ConnTag {
    role: Role,
    labels: ConnLabels,
}

impl ConnTag {
    pub fn labels(&self) -> &ConnLabels {
        &self.labels
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Correlation object for one RPC, produced at begin
#[derive(Debug)]
pub struct RpcTag {
    role: Role,
    labels: RpcLabels,
}

impl RpcTag {
    pub fn labels(&self) -> &RpcLabels {
        &self.labels
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Connection and in-flight RPC gauges driven by transport events
#[derive(Clone)]
pub struct StatsHandler {
    monitoring: Arc<Monitoring>,
}

impl StatsHandler {
    pub(crate) fn new(monitoring: Arc<Monitoring>) -> Self {
        Self { monitoring }
    }

    pub fn connection_begin(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        is_client: bool,
    ) -> ConnTag {
        let tag = ConnTag {
            role: Role::from_is_client(is_client),
            labels: ConnLabels::new(local_addr, remote_addr),
        };
        trace!(
            role = tag.role.as_str(),
            remote_addr = %tag.labels.remote_addr,
            "Connection opened"
        );
        self.monitoring.monitor(tag.role).inc_connections(&tag.labels);
        tag
    }

    pub fn connection_end(&self, tag: ConnTag) {
        trace!(
            role = tag.role.as_str(),
            remote_addr = %tag.labels.remote_addr,
            "Connection closed"
        );
        self.monitoring.monitor(tag.role).dec_connections(&tag.labels);
    }

    pub fn rpc_begin(&self, info: &RpcTagInfo, is_client: bool) -> RpcTag {
        let tag = RpcTag {
            role: Role::from_is_client(is_client),
            labels: RpcLabels::new(&info.full_method, info.fail_fast),
        };
        self.monitoring.monitor(tag.role).inc_in_flight(&tag.labels);
        tag
    }

    pub fn rpc_end(&self, tag: RpcTag) {
        self.monitoring.monitor(tag.role).dec_in_flight(&tag.labels);
    }

    /// Begin a connection and end it when the returned guard drops
    pub fn track_connection(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        role: Role,
    ) -> ConnectionGuard {
        let tag = self.connection_begin(local_addr, remote_addr, role == Role::Client);
        ConnectionGuard {
            handler: self.clone(),
            tag: Some(tag),
        }
    }

    /// Begin an RPC and end it when the returned guard drops
    pub fn track_rpc(&self, info: &RpcTagInfo, role: Role) -> InFlightGuard {
        let tag = self.rpc_begin(info, role == Role::Client);
        InFlightGuard {
            handler: self.clone(),
            tag: Some(tag),
        }
    }

    /// Track an accepted or dialed TCP stream for as long as it lives
    pub fn track_tcp(&self, stream: TcpStream, role: Role) -> io::Result<TrackedConnection<TcpStream>> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let guard = self.track_connection(local_addr, remote_addr, role);
        Ok(TrackedConnection::new(stream, guard))
    }
}

/// RAII pairing of connection begin/end
pub struct ConnectionGuard {
    handler: StatsHandler,
    tag: Option<ConnTag>,
}

impl ConnectionGuard {
    pub fn tag(&self) -> Option<&ConnTag> {
        self.tag.as_ref()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.handler.connection_end(tag);
        }
    }
}

/// RAII pairing of RPC begin/end for the in-flight gauge
pub struct InFlightGuard {
    handler: StatsHandler,
    tag: Option<RpcTag>,
}

impl InFlightGuard {
    pub fn tag(&self) -> Option<&RpcTag> {
        self.tag.as_ref()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.handler.rpc_end(tag);
        }
    }
}

/// IO wrapper keeping the connections gauge up while the connection lives
///
/// Implements tonic's `Connected` by delegating to the wrapped IO, so
/// requests served over it still expose the remote address.
#[pin_project]
pub struct TrackedConnection<IO> {
    #[pin]
    io: IO,
    guard: ConnectionGuard,
}

impl<IO> TrackedConnection<IO> {
    pub fn new(io: IO, guard: ConnectionGuard) -> Self {
        Self { io, guard }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn tag(&self) -> Option<&ConnTag> {
        self.guard.tag()
    }
}

impl<IO: AsyncRead> AsyncRead for TrackedConnection<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().io.poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite> AsyncWrite for TrackedConnection<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

impl<IO: Connected> Connected for TrackedConnection<IO> {
    type ConnectInfo = IO::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.io.connect_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;

    fn handler() -> (Arc<Monitoring>, StatsHandler) {
        let monitoring = Arc::new(Monitoring::new(&MetricsConfig::default()).unwrap());
        (monitoring.clone(), StatsHandler::new(monitoring))
    }

    #[test]
    fn test_connection_begin_end_nets_zero() {
        let (monitoring, stats) = handler();
        let local: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let values = ["127.0.0.1:40000", "127.0.0.1:9090"];

        let tag = stats.connection_begin(local, remote, false);
        assert_eq!(
            monitoring.server.connections().with_label_values(&values).get(),
            1
        );

        stats.connection_end(tag);
        assert_eq!(
            monitoring.server.connections().with_label_values(&values).get(),
            0
        );
        assert_eq!(
            monitoring.client.connections().with_label_values(&values).get(),
            0
        );
    }

    #[test]
    fn test_rpc_roles_are_independent() {
        let (monitoring, stats) = handler();
        let info = RpcTagInfo::new("/demo.Echo/Say", true);
        let values = ["demo.Echo", "Say", "true"];

        let client = stats.rpc_begin(&info, true);
        let server = stats.rpc_begin(&info, false);
        assert_eq!(
            monitoring.client.in_flight_requests().with_label_values(&values).get(),
            1
        );
        assert_eq!(
            monitoring.server.in_flight_requests().with_label_values(&values).get(),
            1
        );

        stats.rpc_end(client);
        assert_eq!(
            monitoring.client.in_flight_requests().with_label_values(&values).get(),
            0
        );
        assert_eq!(
            monitoring.server.in_flight_requests().with_label_values(&values).get(),
            1
        );
        stats.rpc_end(server);
    }

    #[test]
    fn test_in_flight_guard_ends_on_drop() {
        let (monitoring, stats) = handler();
        let info = RpcTagInfo::new("malformed", false);
        let values = ["unknown", "unknown", "false"];

        {
            let guard = stats.track_rpc(&info, Role::Server);
            assert_eq!(guard.tag().map(|t| t.role()), Some(Role::Server));
            assert_eq!(
                monitoring.server.in_flight_requests().with_label_values(&values).get(),
                1
            );
        }

        assert_eq!(
            monitoring.server.in_flight_requests().with_label_values(&values).get(),
            0
        );
    }

    #[tokio::test]
    async fn test_tracked_tcp_connection() {
        let (monitoring, stats) = handler();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let tracked = stats.track_tcp(accepted, Role::Server).unwrap();

        let labels = tracked.tag().unwrap().labels().clone();
        assert_eq!(labels.local_addr, addr.to_string());
        assert_eq!(labels.remote_addr, client.local_addr().unwrap().to_string());
        let values = [labels.remote_addr.as_str(), labels.local_addr.as_str()];
        assert_eq!(
            monitoring.server.connections().with_label_values(&values).get(),
            1
        );

        drop(tracked);
        assert_eq!(
            monitoring.server.connections().with_label_values(&values).get(),
            0
        );
    }
}
