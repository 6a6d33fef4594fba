// src/snapshot.rs
//! Atomically-published current state shared between the loader task and
//! an unbounded number of concurrent readers.
//!
//! The store holds one immutable `Arc<Snapshot>` behind a watch channel;
//! publishing swaps the whole reference, so a reader can never observe a
//! quarantine set and a test tree from different refresh cycles.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::collection::TestCollection;
use crate::model::TestCaseIdentity;

/// One published generation of loader output. Immutable once built.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// 0 only for the pre-first-publish default.
    pub generation: u64,
    pub quarantined: HashSet<TestCaseIdentity>,
    pub tests: TestCollection,
}

impl Snapshot {
    pub fn is_quarantined(&self, identity: &TestCaseIdentity) -> bool {
        self.quarantined.contains(identity)
    }
}

pub struct SnapshotStore {
    current: watch::Sender<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(Snapshot::default()));
        Self { current }
    }

    /// The last-published snapshot, or the empty generation-0 default before
    /// the first publish. Callers should hold on to the returned `Arc` for
    /// the duration of one logical read rather than re-fetching mid-way.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.borrow().clone()
    }

    /// Replace the current snapshot. Concurrent publishes are
    /// last-write-wins; the generation is assigned inside the swap so it is
    /// always monotonic.
    pub fn publish(&self, quarantined: HashSet<TestCaseIdentity>, tests: TestCollection) {
        self.current.send_modify(|slot| {
            *slot = Arc::new(Snapshot {
                generation: slot.generation + 1,
                quarantined,
                tests,
            });
        });
    }

    /// Resolves once the first publish has happened. Dependents use this for
    /// readiness gating; it completes immediately if a publish already
    /// occurred.
    pub async fn ready(&self) {
        let mut rx = self.current.subscribe();
        let _ = rx.wait_for(|snapshot| snapshot.generation > 0).await;
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Health of the background loader, surfaced over the HTTP readiness probe.
/// A detached first load that fails must end up here rather than being
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Failed(String),
}

#[derive(Clone)]
pub struct ReadinessGate {
    state: Arc<watch::Sender<Readiness>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Readiness::Starting);
        Self { state: Arc::new(state) }
    }

    pub fn get(&self) -> Readiness {
        self.state.borrow().clone()
    }

    pub fn set_ready(&self) {
        self.state.send_replace(Readiness::Ready);
    }

    pub fn set_failed(&self, reason: String) {
        self.state.send_replace(Readiness::Failed(reason));
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
