//! # Prometheus Metrics
//!
//! Node metrics, scraped at `/metrics` on the configured metrics port. All
//! metrics live in a dedicated [`prometheus::Registry`] with the
//! `shardstore` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use shardstore_protocol::storage::StorageMetrics;

/// All metric handles of the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Per-call storage metrics, recorded by the `MetricsBackend` wrapper.
    pub storage: StorageMetrics,
    /// Committee members the storage client is connected to.
    pub connected_storage_nodes: IntGauge,
    /// Epoch of the committee the client's connections were built from.
    pub committee_epoch: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("shardstore".into()), None)?;

        let storage = StorageMetrics::register(&registry)?;

        let connected_storage_nodes = IntGauge::new(
            "connected_storage_nodes",
            "Storage committee members the client holds connections to",
        )?;
        registry.register(Box::new(connected_storage_nodes.clone()))?;

        let committee_epoch = IntGauge::new(
            "storage_committee_epoch",
            "Epoch of the storage committee in use",
        )?;
        registry.register(Box::new(committee_epoch.clone()))?;

        Ok(Self {
            registry,
            storage,
            connected_storage_nodes,
            committee_epoch,
        })
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `/metrics`. Returns HTTP 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Router serving `/metrics`.
pub fn router(metrics: SharedMetrics) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_renders_prefixed_families() {
        let metrics = Arc::new(NodeMetrics::new().unwrap());
        metrics.connected_storage_nodes.set(3);
        metrics
            .storage
            .calls_total
            .with_label_values(&["client", "get", "ok"])
            .inc();

        let response = router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("shardstore_connected_storage_nodes 3"));
        assert!(text.contains("shardstore_storage_calls_total"));
    }
}
