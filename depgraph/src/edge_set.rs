//! A lock-free, versioned, copy-on-write set.
//!
//! [`EdgeSet`] is the storage behind every `required_properties` and
//! `used_by_properties` slot in the derived-property engine. Reads take a
//! stable, reference-counted snapshot (an `items()` call never blocks a
//! concurrent writer and never observes a torn update); writes always
//! replace the whole backing array rather than mutating it in place.
//!
//! The version counter and the item array are swapped together as a single
//! `Arc`, so a reader that loads both via one [`ArcSwap::load`] always sees
//! a version/items pair that were written atomically by the same mutator —
//! there's no separate "pointer" and "version" load to tear.

use arc_swap::ArcSwap;
use std::sync::Arc;

struct Snapshot<T> {
    version: u64,
    items: Arc<[T]>,
}

impl<T> Snapshot<T> {
    fn empty() -> Self {
        Self { version: 0, items: Arc::from(Vec::new().into_boxed_slice()) }
    }
}

/// A lock-free copy-on-write set of items, versioned so that concurrent
/// mutators can detect whether their view of the set is still current.
///
/// Mutations that *observe* the current contents before deciding what to
/// store (the derived-property engine's exclusive-replace path, §4.8 of the
/// spec this crate backs) should use [`EdgeSet::try_replace`] so they can
/// detect a conflicting concurrent writer and fall back to the merge path.
/// Mutations that only need to add or remove a single item regardless of
/// what else changed concurrently (e.g. the merge path itself, or detach
/// cleanup) should use [`EdgeSet::add`] / [`EdgeSet::remove`], which retry
/// under contention and therefore always succeed.
pub struct EdgeSet<T> {
    inner: ArcSwap<Snapshot<T>>,
}

impl<T> Default for EdgeSet<T> {
    fn default() -> Self {
        Self { inner: ArcSwap::from_pointee(Snapshot::empty()) }
    }
}

impl<T> EdgeSet<T> {
    /// Creates an empty edge set at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current version. Monotonically non-decreasing: every successful
    /// mutation (`add`, `remove`, or `try_replace`) bumps it by exactly 1.
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    /// The number of items currently in the set.
    pub fn count(&self) -> usize {
        self.inner.load().items.len()
    }

    /// A stable snapshot of the set's contents. The returned `Arc` stays
    /// valid for as long as the caller holds it even if a concurrent writer
    /// replaces the set's storage immediately after this call returns.
    pub fn items(&self) -> Arc<[T]>
    where
        T: Clone,
    {
        Arc::clone(&self.inner.load().items)
    }

    /// A `(version, items)` pair loaded as a single atomic snapshot. Use
    /// this instead of calling [`EdgeSet::version`] and [`EdgeSet::items`]
    /// separately when the two need to be consistent with each other, as
    /// `store_recorded`'s version check does.
    pub fn snapshot(&self) -> (u64, Arc<[T]>)
    where
        T: Clone,
    {
        let snap = self.inner.load();
        (snap.version, Arc::clone(&snap.items))
    }
}

impl<T> EdgeSet<T>
where
    T: Clone + PartialEq,
{
    /// Returns `true` if `item` is present in the set.
    pub fn contains(&self, item: &T) -> bool {
        self.inner.load().items.iter().any(|i| i == item)
    }

    /// Adds `item` if absent, retrying under concurrent contention.
    /// Returns `false` without mutating anything if `item` was already
    /// present.
    pub fn add(&self, item: T) -> bool {
        loop {
            let current = self.inner.load();
            if current.items.iter().any(|i| i == &item) {
                return false;
            }
            let mut next: Vec<T> = current.items.iter().cloned().collect();
            next.push(item.clone());
            let replacement =
                Arc::new(Snapshot { version: current.version + 1, items: Arc::from(next) });
            let previous = self.inner.compare_and_swap(&current, replacement);
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
            // lost the race with another writer; reload and retry
        }
    }

    /// Removes `item` if present, retrying under concurrent contention.
    /// Returns `false` without mutating anything if `item` was absent.
    pub fn remove(&self, item: &T) -> bool {
        loop {
            let current = self.inner.load();
            if !current.items.iter().any(|i| i == item) {
                return false;
            }
            let next: Vec<T> = current.items.iter().filter(|i| *i != item).cloned().collect();
            let replacement =
                Arc::new(Snapshot { version: current.version + 1, items: Arc::from(next) });
            let previous = self.inner.compare_and_swap(&current, replacement);
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
        }
    }

    /// Order-insensitive equality against `other`.
    ///
    /// Edge-set frames are small in practice (a derived getter typically
    /// touches a handful of base properties), so this is a plain quadratic
    /// scan rather than a sort — sorting would require `Ord` on `T`, which
    /// property references don't need otherwise.
    pub fn sequence_equal(&self, other: &[T]) -> bool {
        let current = self.inner.load();
        if current.items.len() != other.len() {
            return false;
        }
        current.items.iter().all(|item| other.iter().any(|o| o == item))
    }

    /// Atomically replaces the set's contents with `new_items`, but only if
    /// the set's version still equals `expected_version`. Returns `false`
    /// without mutating anything if a concurrent writer already bumped the
    /// version — the caller should fall back to the merge path (§4.8)
    /// rather than retrying this call, since `new_items` was computed
    /// against a recording taken against the stale version.
    pub fn try_replace(&self, new_items: &[T], expected_version: u64) -> bool {
        let current = self.inner.load();
        if current.version != expected_version {
            return false;
        }
        let replacement = Arc::new(Snapshot {
            version: current.version + 1,
            items: Arc::from(new_items.to_vec()),
        });
        let previous = self.inner.compare_and_swap(&current, replacement);
        Arc::ptr_eq(&previous, &current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let set: EdgeSet<u32> = EdgeSet::new();
        assert_eq!(set.version(), 0);
        assert_eq!(set.count(), 0);
        assert!(set.items().is_empty());
    }

    #[test]
    fn add_remove_bump_version() {
        let set = EdgeSet::new();
        assert!(set.add(1));
        assert_eq!(set.version(), 1);
        assert!(!set.add(1), "duplicate add is a no-op");
        assert_eq!(set.version(), 1, "no-op add does not bump the version");
        assert!(set.contains(&1));

        assert!(set.remove(&1));
        assert_eq!(set.version(), 2);
        assert!(!set.contains(&1));
        assert!(!set.remove(&1), "duplicate remove is a no-op");
        assert_eq!(set.version(), 2);
    }

    #[test]
    fn try_replace_requires_matching_version() {
        let set = EdgeSet::new();
        set.add(1);
        let (version, _items) = set.snapshot();

        assert!(set.try_replace(&[1, 2, 3], version));
        assert_eq!(set.version(), version + 1);
        assert!(set.sequence_equal(&[3, 2, 1]));

        // stale version must fail
        assert!(!set.try_replace(&[9], version));
        assert!(set.sequence_equal(&[1, 2, 3]));
    }

    #[test]
    fn sequence_equal_is_order_insensitive() {
        let set = EdgeSet::new();
        set.add("a".to_string());
        set.add("b".to_string());
        assert!(set.sequence_equal(&["b".to_string(), "a".to_string()]));
        assert!(!set.sequence_equal(&["a".to_string()]));
    }

    #[test]
    fn version_never_decreases_under_concurrent_adds() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let set = StdArc::new(EdgeSet::<u32>::new());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let set = StdArc::clone(&set);
            handles.push(thread::spawn(move || {
                set.add(i);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.count(), 8);
        assert_eq!(set.version(), 8);
    }
}
