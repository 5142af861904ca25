use grpc_metrics::{MetricsConfig, MetricsInterceptor};
use metrics_service::grpc::serve_with_listener;
use prometheus::core::Collector;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

fn handler_total(interceptor: &MetricsInterceptor, handler: &str) -> u64 {
    interceptor
        .server()
        .requests_total()
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == "handler" && pair.get_value() == handler)
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

#[tokio::test]
async fn test_health_check_is_recorded() {
    let interceptor = MetricsInterceptor::new(MetricsConfig::default().with_track_peers(true)).unwrap();
    let registry = Registry::new();
    interceptor.register(&registry).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_with_listener(listener, interceptor.clone(), async {
        shutdown_rx.await.ok();
    }));

    let mut client = HealthClient::new(
        tonic::transport::Endpoint::from_shared(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .unwrap(),
    );
    client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap();

    assert_eq!(handler_total(&interceptor, "Check"), 1);

    let open: i64 = interceptor
        .server()
        .connections()
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_gauge().get_value() as i64)
        .sum();
    assert_eq!(open, 1);

    let body = grpc_metrics::render(&registry).unwrap();
    assert!(body.contains(r#"peer="127.0.0.1:"#));

    let mut watch = client
        .watch(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner();
    watch.message().await.unwrap().expect("initial status");

    let server_metrics = interceptor.server();
    assert_eq!(
        server_metrics
            .in_flight_requests()
            .with_label_values(&["grpc.health.v1.Health", "Watch", "false"])
            .get(),
        1
    );
    assert_eq!(handler_total(&interceptor, "Watch"), 0);
    let sent: u64 = server_metrics
        .sent_messages()
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum();
    assert_eq!(sent, 1);

    drop(watch);
    drop(client);
    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
