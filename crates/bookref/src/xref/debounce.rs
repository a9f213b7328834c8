//
// xref/debounce.rs
//
// Per-path coalescing of file change events
//

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use super::types::ChangeKind;

/// Combine a pending change with a newer one for the same path.
pub fn merge_change(pending: ChangeKind, latest: ChangeKind) -> ChangeKind {
    use ChangeKind::*;
    match (pending, latest) {
        (Added, Modified) => Added,
        (Added, Removed) => Removed,
        (Modified, Removed) => Removed,
        (Removed, Added) => Modified,
        (Removed, Modified) => Modified,
        (_, latest) => latest,
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    kind: ChangeKind,
    last_event: Instant,
    /// Arrival order of the first event, used to keep batches stable
    seq: u64,
}

/// Groups change events per path until each path has been quiet long enough.
///
/// Nothing is released before the grace window that starts at construction
/// has passed, so a startup scan and the edits racing it collapse together.
#[derive(Debug)]
pub struct ChangeCoalescer {
    settle: Duration,
    grace_until: Instant,
    pending: HashMap<PathBuf, PendingChange>,
    next_seq: u64,
}

impl ChangeCoalescer {
    pub fn new(settle: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            settle,
            grace_until: now + grace,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Record an event, merging it with any pending change for the path.
    pub fn push(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        match self.pending.get_mut(&path) {
            Some(change) => {
                change.kind = merge_change(change.kind, kind);
                change.last_event = now;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending.insert(
                    path,
                    PendingChange {
                        kind,
                        last_event: now,
                        seq,
                    },
                );
            }
        }
    }

    /// Remove and return every change that has settled, in arrival order.
    pub fn take_ready(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        if now < self.grace_until {
            return Vec::new();
        }

        let settle = self.settle;
        let ready_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, change)| now.saturating_duration_since(change.last_event) >= settle)
            .map(|(path, _)| path.clone())
            .collect();

        let mut ready: Vec<(u64, PathBuf, ChangeKind)> = ready_paths
            .into_iter()
            .filter_map(|path| {
                self.pending
                    .remove(&path)
                    .map(|change| (change.seq, path, change.kind))
            })
            .collect();
        ready.sort_by_key(|(seq, _, _)| *seq);
        ready.into_iter().map(|(_, path, kind)| (path, kind)).collect()
    }

    /// When the next pending change could become ready, if any is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|change| change.last_event + self.settle)
            .min()
            .map(|deadline| deadline.max(self.grace_until))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
