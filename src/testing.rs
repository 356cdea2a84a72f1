//! Test-support types, grounded on the teacher's own `testing.rs`:
//! instrumented values for asserting clone counts, a recording change
//! observer, and a fake clock for deterministic transaction timestamps.

use crate::change::{Broadcast, ChangeObserver, PropertyChange};
use crate::registry::SubjectHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use subjective_depgraph::DataMap;

/// A value that counts how many times it has been cloned, for asserting
/// that a code path which should read a value exactly once (or exactly N
/// times) actually does.
#[derive(Debug)]
pub struct CountsClones {
    /// The wrapped value.
    pub value: i64,
    clones: Arc<AtomicU64>,
}

impl CountsClones {
    /// Wraps `value`, starting its clone counter at zero.
    pub fn new(value: i64) -> Self {
        Self { value, clones: Arc::new(AtomicU64::new(0)) }
    }

    /// The number of times this value (or a clone descended from it) has
    /// been cloned.
    pub fn clone_count(&self) -> u64 {
        self.clones.load(Ordering::SeqCst)
    }
}

impl Clone for CountsClones {
    fn clone(&self) -> Self {
        self.clones.fetch_add(1, Ordering::SeqCst);
        Self { value: self.value, clones: self.clones.clone() }
    }
}

impl PartialEq for CountsClones {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

/// A [`ChangeObserver`] that records every change it sees, in order, for
/// assertions about emission order and count.
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<String>>,
}

impl RecordingObserver {
    /// Creates an observer with nothing recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every change seen so far, formatted as
    /// `"subject#N.Property"`.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// The number of changes seen so far.
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl ChangeObserver for RecordingObserver {
    fn on_change(&self, change: &PropertyChange) {
        self.seen.lock().push(format!("{}", change.property));
    }
}

/// A deterministic, manually-advanced clock for timestamp-dependent
/// transaction-conflict tests, standing in for a wall-clock source.
#[derive(Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    /// Creates a clock starting at timestamp 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current timestamp.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    /// Advances the clock by `delta` and returns the new timestamp.
    pub fn advance(&self, delta: u64) -> u64 {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

/// A [`SubjectHandle`] with an empty data map and a no-op `recompute`,
/// useful wherever a test needs a registered subject but doesn't care
/// about its recomputation behavior.
#[derive(Default)]
pub struct StubHandle {
    data_map: DataMap,
    broadcast: Broadcast,
}

impl SubjectHandle for StubHandle {
    fn data_map(&self) -> &DataMap {
        &self.data_map
    }

    fn recompute(&self, _property: &'static str) {}

    fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_clones_tracks_every_clone() {
        let original = CountsClones::new(1);
        let _a = original.clone();
        let _b = original.clone();
        assert_eq!(original.clone_count(), 2);
    }

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.advance(5), 5);
        assert_eq!(clock.advance(3), 8);
    }
}
