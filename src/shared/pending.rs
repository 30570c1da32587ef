// This is free and unencumbered software released into the public domain.

use derive_more::Display;
use std::collections::BTreeMap;

/// A condition a deferred operation waits for.
///
/// Ordered the way an operation can move between them: a replayed operation
/// only ever re-defers under a later dependency.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    VideoOutputReady,
    MediaBound,
    RecorderReady,
}

/// Operations that cannot run yet, queued per unmet dependency.
#[derive(Debug)]
pub struct PendingOperationStore<Op> {
    queues: BTreeMap<Dependency, Vec<Op>>,
}

impl<Op> Default for PendingOperationStore<Op> {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }
}

impl<Op> PendingOperationStore<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, op: Op, dependency: Dependency) {
        self.queues.entry(dependency).or_default().push(op);
    }

    /// Removes and returns everything queued under `dependency`, oldest first.
    ///
    /// The caller replays the operations in order; each is handed out once.
    #[must_use]
    pub fn resolve(&mut self, dependency: Dependency) -> Vec<Op> {
        self.queues
            .get_mut(&dependency)
            .map(core::mem::take)
            .unwrap_or_default()
    }

    pub fn pending(&self, dependency: Dependency) -> &[Op] {
        self.queues
            .get(&dependency)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued operation without replaying it.
    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

impl<Op: PartialEq> PendingOperationStore<Op> {
    /// Like [`defer`](Self::defer), but keeps at most one copy of `op` per dependency.
    pub fn defer_once(&mut self, op: Op, dependency: Dependency) {
        if !self.pending(dependency).contains(&op) {
            self.defer(op, dependency);
        }
    }
}
