use actix_web::{web, App, HttpServer};
use anyhow::Context;
use grpc_metrics::MetricsInterceptor;
use metrics_service::{config::Config, grpc, http, logging};
use prometheus::Registry;
use tracing::{error, info, warn};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init_tracing(config.log_format);

    info!(
        grpc_port = config.grpc_port,
        http_port = config.http_port,
        track_peers = config.track_peers,
        "Starting metrics-service"
    );

    let interceptor = MetricsInterceptor::new(config.metrics_config())
        .context("Failed to build gRPC metrics")?;
    let registry = Registry::new();
    interceptor
        .register(&registry)
        .context("Failed to register gRPC metrics")?;
    register_process_metrics(&registry);
    interceptor.preregister(&grpc::hosted_services())?;

    let grpc_addr = config.grpc_addr()?;
    let grpc_interceptor = interceptor.clone();
    let grpc_handle = tokio::spawn(async move {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        };
        if let Err(e) = grpc::serve(grpc_addr, grpc_interceptor, shutdown).await {
            error!("gRPC server failed: {:#}", e);
        }
    });

    let http_addr = config.http_addr()?;
    info!("Metrics endpoint listening on http://{}/metrics", http_addr);

    let registry = web::Data::new(registry);
    HttpServer::new(move || {
        App::new()
            .app_data(registry.clone())
            .configure(http::configure)
    })
    .bind(http_addr)?
    .run()
    .await?;

    if let Err(e) = grpc_handle.await {
        warn!("gRPC server task ended abnormally: {}", e);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn register_process_metrics(registry: &Registry) {
    let collector = prometheus::process_collector::ProcessCollector::for_self();
    if let Err(e) = registry.register(Box::new(collector)) {
        warn!("Failed to register process metrics: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn register_process_metrics(_registry: &Registry) {}
