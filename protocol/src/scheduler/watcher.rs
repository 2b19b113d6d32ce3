//! # Committee Watcher
//!
//! Tracks the storage committee of one runtime.
//!
//! ```text
//! scheduler stream ──► filter (kind == Storage && runtime matches)
//!                        │
//!                        ├──► current committee (replaced wholesale)
//!                        └──► downstream channel (one event per update)
//! ```
//!
//! The watcher owns its scheduler subscription. Unsubscribing (explicitly or
//! by dropping the watcher) closes the subscription and stops the filter
//! task; the downstream channel then yields `None`.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{Committee, CommitteeKind, SchedulerBackend, Subscription};
use crate::crypto::PublicKey;

/// Watches the scheduler for a runtime's storage committee.
pub struct CommitteeWatcher {
    runtime_id: PublicKey,
    current: Arc<RwLock<Option<Committee>>>,
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl CommitteeWatcher {
    /// Subscribes to `scheduler` and spawns the filter task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        scheduler: &dyn SchedulerBackend,
        runtime_id: PublicKey,
    ) -> (Self, mpsc::UnboundedReceiver<Committee>) {
        let (mut committees, subscription) = scheduler.watch_committees();
        let (tx, rx) = mpsc::unbounded_channel();
        let current = Arc::new(RwLock::new(None));

        let task_current = Arc::clone(&current);
        let task = tokio::spawn(async move {
            while let Some(committee) = committees.recv().await {
                if committee.kind != CommitteeKind::Storage {
                    trace!(kind = %committee.kind, "ignoring non-storage committee");
                    continue;
                }
                if committee.runtime_id != runtime_id {
                    trace!(
                        runtime_id = %committee.runtime_id,
                        "ignoring committee for other runtime"
                    );
                    continue;
                }

                debug!(
                    runtime_id = %runtime_id,
                    epoch = committee.valid_for,
                    members = committee.members.len(),
                    "storage committee updated"
                );
                *task_current.write() = Some(committee.clone());

                if tx.send(committee).is_err() {
                    break;
                }
            }
            debug!(runtime_id = %runtime_id, "committee watcher stopped");
        });

        info!(runtime_id = %runtime_id, "watching storage committee");

        (
            Self {
                runtime_id,
                current,
                subscription,
                task,
            },
            rx,
        )
    }

    pub fn runtime_id(&self) -> &PublicKey {
        &self.runtime_id
    }

    /// The last storage committee seen for the runtime, if any.
    pub fn current(&self) -> Option<Committee> {
        self.current.read().clone()
    }

    /// Stops watching. Equivalent to dropping the watcher.
    pub fn unsubscribe(self) {}

    fn stop(&mut self) {
        self.subscription.close();
        self.task.abort();
    }
}

impl Drop for CommitteeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
