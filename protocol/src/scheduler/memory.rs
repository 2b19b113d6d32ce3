//! In-process committee publisher.
//!
//! Stands in for a consensus-backed scheduler on devnets and in tests: the
//! caller decides what gets elected and calls [`MemoryScheduler::publish`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Committee, CommitteeKind, SchedulerBackend, Subscription};
use crate::crypto::PublicKey;

#[derive(Default)]
struct SchedulerState {
    next_subscriber: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Committee>>,
    current: HashMap<(PublicKey, CommitteeKind), Committee>,
}

/// A scheduler whose elections are driven by hand.
#[derive(Clone, Default)]
pub struct MemoryScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `committee` the current one for its runtime and kind, and sends
    /// it to every live subscriber. Subscribers whose receiver is gone are
    /// pruned.
    pub fn publish(&self, committee: Committee) {
        let mut state = self.state.lock();
        state
            .current
            .insert((committee.runtime_id, committee.kind), committee.clone());
        state
            .subscribers
            .retain(|_, tx| tx.send(committee.clone()).is_ok());

        debug!(
            runtime_id = %committee.runtime_id,
            kind = %committee.kind,
            epoch = committee.valid_for,
            members = committee.members.len(),
            subscribers = state.subscribers.len(),
            "committee published"
        );
    }

    /// Current committee for `runtime_id` and `kind`, if one was published.
    pub fn committee(&self, runtime_id: &PublicKey, kind: CommitteeKind) -> Option<Committee> {
        self.state.lock().current.get(&(*runtime_id, kind)).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl SchedulerBackend for MemoryScheduler {
    fn watch_committees(&self) -> (mpsc::UnboundedReceiver<Committee>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        for committee in state.current.values() {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(committee.clone());
        }
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, tx);
        drop(state);

        let weak = Arc::downgrade(&self.state);
        let subscription = Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().subscribers.remove(&id);
            }
        });

        (rx, subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn key() -> PublicKey {
        Keypair::generate().public_key()
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let scheduler = MemoryScheduler::new();
        let (mut rx1, _sub1) = scheduler.watch_committees();
        let (mut rx2, _sub2) = scheduler.watch_committees();

        let committee = Committee::storage(key(), 1, &[key()]);
        scheduler.publish(committee.clone());

        assert_eq!(rx1.recv().await, Some(committee.clone()));
        assert_eq!(rx2.recv().await, Some(committee));
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_committees() {
        let scheduler = MemoryScheduler::new();
        let runtime = key();
        scheduler.publish(Committee::storage(runtime, 1, &[key()]));
        let latest = Committee::storage(runtime, 2, &[key(), key()]);
        scheduler.publish(latest.clone());

        let (mut rx, _sub) = scheduler.watch_committees();
        assert_eq!(rx.recv().await, Some(latest));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_subscription_ends_stream() {
        let scheduler = MemoryScheduler::new();
        let (mut rx, mut sub) = scheduler.watch_committees();
        assert_eq!(scheduler.subscriber_count(), 1);

        sub.close();
        assert_eq!(scheduler.subscriber_count(), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let scheduler = MemoryScheduler::new();
        let (rx, _sub) = scheduler.watch_committees();
        drop(rx);
        scheduler.publish(Committee::storage(key(), 1, &[]));
        assert_eq!(scheduler.subscriber_count(), 0);
    }

    #[test]
    fn tracks_current_per_runtime_and_kind() {
        let scheduler = MemoryScheduler::new();
        let runtime = key();
        let committee = Committee::storage(runtime, 3, &[key()]);
        scheduler.publish(committee.clone());
        assert_eq!(
            scheduler.committee(&runtime, CommitteeKind::Storage),
            Some(committee)
        );
        assert_eq!(scheduler.committee(&runtime, CommitteeKind::Compute), None);
    }
}
