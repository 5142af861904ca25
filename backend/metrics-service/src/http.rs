use actix_web::{web, HttpResponse};
use prometheus::Registry;

/// Handler that serialises the registry in the Prometheus text format.
pub async fn metrics_handler(registry: web::Data<Registry>) -> HttpResponse {
    match grpc_metrics::render(&registry) {
        Ok(body) => HttpResponse::Ok()
            .content_type(prometheus::TEXT_FORMAT)
            .body(body),
        Err(err) => {
            tracing::error!(error = %err, "Failed to render metrics");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_handler))
        .route("/health", web::get().to(|| async { "OK" }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use grpc_metrics::{CallInfo, MetricsConfig, MetricsInterceptor};
    use tonic::Status;

    #[actix_web::test]
    async fn test_metrics_endpoint_serves_text_format() {
        let interceptor = MetricsInterceptor::new(MetricsConfig::default()).unwrap();
        let registry = Registry::new();
        interceptor.register(&registry).unwrap();
        interceptor
            .unary_server()
            .intercept(&CallInfo::unary("/demo.Echo/Say"), || async {
                Ok::<_, Status>(())
            })
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(registry))
                .configure(configure),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        let body = test::read_body(resp).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(
            r#"grpc_server_requests_total{code="OK",handler="Say",service="demo.Echo",type="unary"} 1"#
        ));
    }
}
