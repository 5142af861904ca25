//! Instrumented gRPC server
//!
//! Every accepted TCP connection is wrapped so the connection gauge follows
//! its lifetime, and every request passes through [`GrpcMetricsLayer`].

use futures::stream::{self, Stream};
use grpc_metrics::{GrpcMetricsLayer, MetricsInterceptor, Role, ServiceInfo, TrackedConnection};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tracing::{info, warn};

pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

/// Services hosted by this process, used for series pre-creation and for
/// resolving the call shape of streaming methods.
pub fn hosted_services() -> Vec<ServiceInfo> {
    vec![ServiceInfo::new(HEALTH_SERVICE)
        .unary("Check")
        .method("Watch", false, true)]
}

/// Accepted connections, each tracked until the server drops it
fn tracked_incoming(
    listener: TcpListener,
    interceptor: &MetricsInterceptor,
) -> impl Stream<Item = io::Result<TrackedConnection<TcpStream>>> {
    let stats = interceptor.stats_handler();
    stream::unfold((listener, stats), |(listener, stats)| async move {
        let conn = match listener.accept().await {
            Ok((tcp, _)) => {
                if let Err(e) = tcp.set_nodelay(true) {
                    warn!(error = %e, "Failed to set TCP_NODELAY");
                }
                stats.track_tcp(tcp, Role::Server)
            }
            Err(e) => Err(e),
        };
        Some((conn, (listener, stats)))
    })
}

pub async fn serve(
    addr: SocketAddr,
    interceptor: MetricsInterceptor,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_with_listener(listener, interceptor, shutdown).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    interceptor: MetricsInterceptor,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let (mut reporter, health_service) = tonic_health::server::health_reporter();
    reporter
        .set_service_status("", ServingStatus::Serving)
        .await;

    let local_addr = listener.local_addr()?;
    let layer = GrpcMetricsLayer::new(interceptor.clone()).with_services(&hosted_services());
    let incoming = tracked_incoming(listener, &interceptor);

    info!("gRPC server listening on {}", local_addr);

    Server::builder()
        .layer(layer)
        .add_service(health_service)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    info!("gRPC server stopped");
    Ok(())
}
