//! # HTTP Boundary
//!
//! Maps request paths to host endpoints, entrypoint routes and bit
//! handlers.
//!
//! ```text
//! /diagnostics, /metrics, /metrics/prometheus   host endpoints
//! routes mounted by entrypoints                 merged in load order
//! everything else                               dispatch::dispatch
//! ```

pub mod dispatch;
pub mod ui;

use crate::container::HostContainer;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bit_telemetry::PROMETHEUS_CONTENT_TYPE;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use dispatch::STATE_VERSION_HEADER;

/// Build the complete router for a host.
///
/// An entrypoint whose routes cannot be mounted (it panics, or a path
/// overlaps one that is already mounted) is skipped and recorded.
pub fn build_router(host: Arc<HostContainer>) -> Router {
    let mut router = Router::new()
        .route("/diagnostics", get(diagnostics))
        .route("/metrics", get(metrics_json))
        .route("/metrics/prometheus", get(metrics_prometheus))
        .fallback(dispatch::dispatch)
        .with_state(Arc::clone(&host));

    for (module, entrypoint) in host.registry.entrypoints() {
        let current = router.clone();
        let mounted = catch_unwind(AssertUnwindSafe(|| {
            current.merge(entrypoint.mount_routes(Router::new()))
        }));
        match mounted {
            Ok(merged) => {
                info!(module = %module, entrypoint = %entrypoint.name(), "Entrypoint routes mounted");
                router = merged;
            }
            Err(panic) => {
                let reason = crate::loader::panic_message(&*panic);
                error!(module = %module, entrypoint = %entrypoint.name(), error = %reason, "Entrypoint routes rejected");
                host.record_entrypoint_failure(format!(
                    "{module}/{}: mount_routes failed: {reason}",
                    entrypoint.name()
                ));
            }
        }
    }

    let router = router
        .layer(CatchPanicLayer::custom(handler_panicked))
        .layer(TraceLayer::new_for_http());

    if host.config.server.cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn diagnostics(State(host): State<Arc<HostContainer>>) -> impl IntoResponse {
    Json(host.diagnostics())
}

async fn metrics_json(State(host): State<Arc<HostContainer>>) -> impl IntoResponse {
    Json(host.metrics_sample())
}

async fn metrics_prometheus(State(host): State<Arc<HostContainer>>) -> Response {
    match host.prometheus_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE))],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn handler_panicked(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let reason = crate::loader::panic_message(&*panic);
    error!(error = %reason, "Request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "request handler panicked" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::HostConfig;
    use crate::loader::UnitCatalog;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn empty_host(root: &TempDir) -> Arc<HostContainer> {
        let mut config = HostConfig::default();
        config.modules.root_dir = root.path().to_path_buf();
        Arc::new(HostContainer::assemble(config, &UnitCatalog::new()).unwrap())
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    #[tokio::test]
    async fn test_host_endpoints_without_modules() {
        let root = TempDir::new().unwrap();
        let router = build_router(empty_host(&root));

        let (status, body, _) = get(router.clone(), "/diagnostics").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["bits"], json!([]));

        let (status, body, _) = get(router.clone(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["bits_loaded"], 0);

        let (status, body, content_type) = get(router.clone(), "/metrics/prometheus").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(PROMETHEUS_CONTENT_TYPE));
        assert!(body.contains("bithost_state_watchers 0"));

        let (status, _, _) = get(router, "/nothing/here").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
