//! # Crashing Backend
//!
//! Fault injection for long-running tests: wraps another backend and aborts
//! the process at named crash points with a configured probability. Never
//! enable this outside of test networks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::error;

use super::api::{
    ApplyBatchRequest, Backend, GetRequest, GetResponse, Initialized, Receipt, RequestContext,
    StorageResult,
};

/// Where a crash may be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    BeforeGet,
    AfterGet,
    BeforeApply,
    AfterApply,
}

impl CrashPoint {
    pub const ALL: [CrashPoint; 4] = [
        CrashPoint::BeforeGet,
        CrashPoint::AfterGet,
        CrashPoint::BeforeApply,
        CrashPoint::AfterApply,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeGet => "storage.before_get",
            Self::AfterGet => "storage.after_get",
            Self::BeforeApply => "storage.before_apply",
            Self::AfterApply => "storage.after_apply",
        }
    }
}

impl fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Default probability used for every crash point.
pub const DEFAULT_CRASH_PROBABILITY: f64 = 0.01;

type CrashAction = Arc<dyn Fn(CrashPoint) + Send + Sync>;

/// Backend wrapper that may abort at any [`CrashPoint`].
pub struct CrashingBackend {
    inner: Arc<dyn Backend>,
    probabilities: HashMap<CrashPoint, f64>,
    action: CrashAction,
}

impl CrashingBackend {
    /// Wraps `inner` with [`DEFAULT_CRASH_PROBABILITY`] at every point.
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        let probabilities = CrashPoint::ALL
            .iter()
            .map(|p| (*p, DEFAULT_CRASH_PROBABILITY))
            .collect();
        Self {
            inner,
            probabilities,
            action: Arc::new(|point| {
                error!(crash_point = %point, "injected crash");
                std::process::abort();
            }),
        }
    }

    /// Sets the probability for one point, clamped to `[0, 1]`.
    pub fn with_probability(mut self, point: CrashPoint, probability: f64) -> Self {
        self.probabilities.insert(point, probability.clamp(0.0, 1.0));
        self
    }

    /// Replaces what happens at a crash.
    pub fn with_action(mut self, action: impl Fn(CrashPoint) + Send + Sync + 'static) -> Self {
        self.action = Arc::new(action);
        self
    }

    fn maybe_crash(&self, point: CrashPoint) {
        let probability = self.probabilities.get(&point).copied().unwrap_or(0.0);
        if probability > 0.0 && rand::thread_rng().gen_bool(probability) {
            (self.action)(point);
        }
    }
}

#[async_trait]
impl Backend for CrashingBackend {
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse> {
        self.maybe_crash(CrashPoint::BeforeGet);
        let response = self.inner.get(ctx, request).await?;
        self.maybe_crash(CrashPoint::AfterGet);
        Ok(response)
    }

    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        self.maybe_crash(CrashPoint::BeforeApply);
        let receipts = self.inner.apply_batch(ctx, request).await?;
        self.maybe_crash(CrashPoint::AfterApply);
        Ok(receipts)
    }

    fn initialized(&self) -> Initialized {
        self.inner.initialized()
    }

    fn cleanup(&self) {
        self.inner.cleanup();
    }
}
