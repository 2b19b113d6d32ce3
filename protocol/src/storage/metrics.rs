//! # Metrics Backend
//!
//! Records call counts, outcomes and latencies of another backend in a
//! [`prometheus::Registry`]. The node binary exposes that registry at
//! `/metrics`.

use std::sync::Arc;

use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use super::api::{
    ApplyBatchRequest, Backend, GetRequest, GetResponse, Initialized, Receipt, RequestContext,
    StorageResult,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Metric handles shared by every wrapped call.
#[derive(Clone)]
pub struct StorageMetrics {
    /// `storage_calls_total{backend, op, outcome}`.
    pub calls_total: IntCounterVec,
    /// `storage_call_latency_seconds{backend, op}`.
    pub call_latency_seconds: HistogramVec,
    /// `storage_apply_ops_total{backend}`: write logs applied.
    pub apply_ops_total: IntCounterVec,
}

impl StorageMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let calls_total = IntCounterVec::new(
            Opts::new("storage_calls_total", "Storage backend calls by operation and outcome"),
            &["backend", "op", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "storage_call_latency_seconds",
                "Storage backend call latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["backend", "op"],
        )?;
        registry.register(Box::new(call_latency_seconds.clone()))?;

        let apply_ops_total = IntCounterVec::new(
            Opts::new("storage_apply_ops_total", "Write logs applied through the backend"),
            &["backend"],
        )?;
        registry.register(Box::new(apply_ops_total.clone()))?;

        Ok(Self {
            calls_total,
            call_latency_seconds,
            apply_ops_total,
        })
    }

    fn observe<T>(
        &self,
        backend: &str,
        op: &str,
        started: std::time::Instant,
        result: &StorageResult<T>,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) if e.is_retryable() => "retryable_error",
            Err(_) => "error",
        };
        self.calls_total.with_label_values(&[backend, op, outcome]).inc();
        self.call_latency_seconds
            .with_label_values(&[backend, op])
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Backend wrapper that records [`StorageMetrics`].
pub struct MetricsBackend {
    inner: Arc<dyn Backend>,
    name: String,
    metrics: StorageMetrics,
}

impl MetricsBackend {
    /// `name` becomes the `backend` label.
    pub fn new(inner: Arc<dyn Backend>, name: impl Into<String>, metrics: StorageMetrics) -> Self {
        Self {
            inner,
            name: name.into(),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Backend for MetricsBackend {
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse> {
        let started = std::time::Instant::now();
        let result = self.inner.get(ctx, request).await;
        self.metrics.observe(&self.name, "get", started, &result);
        result
    }

    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        let ops = request.ops.len() as u64;
        let started = std::time::Instant::now();
        let result = self.inner.apply_batch(ctx, request).await;
        self.metrics.observe(&self.name, "apply_batch", started, &result);
        if result.is_ok() {
            self.metrics
                .apply_ops_total
                .with_label_values(&[self.name.as_str()])
                .inc_by(ops);
        }
        result
    }

    fn initialized(&self) -> Initialized {
        self.inner.initialized()
    }

    fn cleanup(&self) {
        self.inner.cleanup();
    }
}
