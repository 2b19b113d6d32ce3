//! # Scheduler Interface
//!
//! The scheduler elects committees of nodes for each runtime every epoch.
//! Storage clients only care about one kind, the storage committee of the
//! runtime they serve, and learn about it from the committee stream exposed
//! by [`SchedulerBackend::watch_committees`].
//!
//! Committees are replaced wholesale. A new event for the same runtime and
//! kind supersedes the previous one entirely; nothing is ever patched.

pub mod memory;
pub mod watcher;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::PublicKey;

pub use memory::MemoryScheduler;
pub use watcher::CommitteeWatcher;

/// What a committee is elected to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitteeKind {
    Compute,
    Storage,
    TransactionScheduler,
    Merge,
}

impl fmt::Display for CommitteeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compute => "compute",
            Self::Storage => "storage",
            Self::TransactionScheduler => "transaction_scheduler",
            Self::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// A member's role within its committee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitteeRole {
    Worker,
    BackupWorker,
    Leader,
}

/// One committee member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeNode {
    pub role: CommitteeRole,
    pub public_key: PublicKey,
}

/// A committee elected for a runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub kind: CommitteeKind,
    pub members: Vec<CommitteeNode>,
    pub runtime_id: PublicKey,
    /// Epoch the committee was elected for.
    pub valid_for: u64,
}

impl Committee {
    /// A storage committee whose members are all workers.
    pub fn storage(runtime_id: PublicKey, valid_for: u64, members: &[PublicKey]) -> Self {
        Self {
            kind: CommitteeKind::Storage,
            members: members
                .iter()
                .map(|pk| CommitteeNode {
                    role: CommitteeRole::Worker,
                    public_key: *pk,
                })
                .collect(),
            runtime_id,
            valid_for,
        }
    }

    pub fn member_keys(&self) -> Vec<PublicKey> {
        self.members.iter().map(|m| m.public_key).collect()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to a live committee or node stream.
///
/// Closing (or dropping) the handle unregisters the stream from its
/// publisher, which then drops its sending half.
pub struct Subscription {
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(on_close: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Unsubscribes. Idempotent.
    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.on_close.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Source of committee elections.
pub trait SchedulerBackend: Send + Sync {
    /// Subscribes to committee elections.
    ///
    /// The stream is unbounded and starts with the committees currently in
    /// force, followed by every new election.
    fn watch_committees(&self) -> (mpsc::UnboundedReceiver<Committee>, Subscription);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::crypto::Keypair;

    #[test]
    fn subscription_closes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!sub.is_closed());
        sub.close();
        sub.close();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_closes_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn storage_committee_builder() {
        let runtime = Keypair::generate().public_key();
        let members = [Keypair::generate().public_key(), Keypair::generate().public_key()];
        let committee = Committee::storage(runtime, 4, &members);
        assert_eq!(committee.kind, CommitteeKind::Storage);
        assert_eq!(committee.member_keys(), members.to_vec());
        assert!(committee
            .members
            .iter()
            .all(|m| m.role == CommitteeRole::Worker));
    }
}
