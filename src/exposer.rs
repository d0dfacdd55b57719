//! HTTP exposer (§4.G, §6): serves `GET <target.route>` with the current
//! registry snapshot in Prometheus text format. Never triggers collection
//! itself.
//!
//! Grounded on `BatiGencho-renewabl-test`'s `wire-api` `/metrics` route and
//! its `axum::serve(...).with_graceful_shutdown(...)` bootstrap.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

use crate::config::TargetConfig;
use crate::registry::MetricRegistry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn metrics_handler(State(registry): State<MetricRegistry>) -> impl IntoResponse {
    match registry.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error rendering metrics: {e}")).into_response()
        }
    }
}

/// Build the exposer's router. `axum` itself returns 405 for methods a route
/// doesn't declare, satisfying "any other method returns 405" (§6) without
/// extra handling.
pub fn router(target: &TargetConfig, registry: MetricRegistry) -> Router {
    Router::new().route(&target.route, get(metrics_handler)).with_state(registry)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(target: &TargetConfig, registry: MetricRegistry, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", target.ip, target.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid target address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, route = %target.route, "metric exposer listening");
    axum::serve(listener, router(target, registry)).with_graceful_shutdown(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn target() -> TargetConfig {
        TargetConfig {
            ip: "127.0.0.1".into(),
            port: 0,
            route: "/metrics".into(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_get_metrics_returns_200_with_prometheus_content_type() {
        let registry = MetricRegistry::new(vec![]);
        registry.gauge_set("g", "help", &[], 1.0, None).unwrap();
        let app = router(&target(), registry);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, PROMETHEUS_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_non_get_method_returns_405() {
        let registry = MetricRegistry::new(vec![]);
        let app = router(&target(), registry);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
