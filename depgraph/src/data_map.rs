//! Per-subject extension-data storage.
//!
//! Each subject owns exactly one [`DataMap`], the sole persistence point for
//! state that isn't a declared property: dependency edge sets, last-known
//! values for derived properties, write timestamps, authorization
//! overrides, serialization path bindings. Storage is type-sharded the way
//! `dyn-cache`'s namespaces are — each `(scope, key)` slot stores one boxed
//! value, downcast back to its concrete type on read — but a `DataMap` is
//! guarded by a single reader-writer lock rather than being lock-free,
//! since it isn't on the hot path the way [`crate::EdgeSet`] is (only the
//! edge sets nested inside its slots are).

use downcast_rs::{impl_downcast, DowncastSync};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt::{self, Debug, Formatter};

trait AnySync: DowncastSync + Debug {}
impl_downcast!(AnySync);
impl<T: DowncastSync + Debug> AnySync for T {}

/// A key into a subject's data map: the optional owning property (`None`
/// for subject-scoped slots) plus a dot-namespaced string key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DataKey {
    property: Option<&'static str>,
    key: &'static str,
}

impl DataKey {
    /// A slot scoped to the subject as a whole, not to any one property.
    pub const fn subject(key: &'static str) -> Self {
        Self { property: None, key }
    }

    /// A slot scoped to a single declared property.
    pub const fn property(property: &'static str, key: &'static str) -> Self {
        Self { property: Some(property), key }
    }
}

/// A concurrent map from [`DataKey`] to an arbitrary `Send + Sync + 'static`
/// value, type-checked on every access.
#[derive(Default)]
pub struct DataMap {
    inner: RwLock<HashMap<DataKey, Box<dyn AnySync>>>,
}

impl DataMap {
    /// Creates an empty data map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the value stored at `key`, if present and of type
    /// `T`. Panics if a value is present at `key` but was stored as a
    /// different type — this indicates two extensions collided on the same
    /// key, a programmer error rather than something to recover from.
    pub fn get<T>(&self, key: &DataKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.with(key, T::clone)
    }

    /// Like [`DataMap::get`], but returns `None` instead of panicking on a
    /// type mismatch.
    pub fn try_get<T>(&self, key: &DataKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let guard = self.inner.read();
        guard.get(key).and_then(|boxed| boxed.as_any().downcast_ref::<T>()).cloned()
    }

    /// Runs `f` against a reference to the stored value without cloning it.
    pub fn with<T, R>(&self, key: &DataKey, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Send + Sync + 'static,
    {
        let guard = self.inner.read();
        let stored = guard.get(key)?;
        let stored =
            stored.as_any().downcast_ref::<T>().expect("data map key used with inconsistent type");
        Some(f(stored))
    }

    /// Overwrites the value stored at `key`.
    pub fn put<T>(&self, key: DataKey, value: T)
    where
        T: Send + Sync + Debug + 'static,
    {
        self.inner.write().insert(key, Box::new(value));
    }

    /// Returns the value at `key`, inserting the result of `factory` if
    /// absent. `factory` is called at most once per key even under
    /// concurrent callers: a read lock is tried first, and only on a miss
    /// is the write lock taken, with a second check inside it.
    pub fn get_or_insert_with<T>(&self, key: DataKey, factory: impl FnOnce() -> T) -> T
    where
        T: Clone + Send + Sync + Debug + 'static,
    {
        if let Some(existing) = self.try_get::<T>(&key) {
            return existing;
        }
        let mut guard = self.inner.write();
        if let Some(existing) =
            guard.get(&key).and_then(|boxed| boxed.as_any().downcast_ref::<T>()).cloned()
        {
            return existing;
        }
        let value = factory();
        guard.insert(key, Box::new(value.clone()));
        value
    }

    /// Replaces the value at `key` with `f` applied to its current value
    /// (or `T::default()` if absent), under a single write-lock hold so the
    /// read-modify-write is atomic with respect to other `update` callers.
    pub fn update<T>(&self, key: DataKey, f: impl FnOnce(T) -> T) -> T
    where
        T: Clone + Default + Send + Sync + Debug + 'static,
    {
        let mut guard = self.inner.write();
        let current = guard
            .get(&key)
            .and_then(|boxed| boxed.as_any().downcast_ref::<T>())
            .cloned()
            .unwrap_or_default();
        let next = f(current);
        guard.insert(key, Box::new(next.clone()));
        next
    }

    /// Removes and returns the value at `key`, if present.
    pub fn remove<T>(&self, key: &DataKey) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self.inner.write();
        let boxed = guard.remove(key)?;
        boxed.into_any().downcast::<T>().ok().map(|b| *b)
    }

    /// `true` if no slots remain — used by detach cleanup to decide whether
    /// a subject's data map can be dropped entirely.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Debug for DataMap {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("DataMap").field("slots", &self.inner.read().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_roundtrip() {
        let map = DataMap::new();
        let key = DataKey::subject("last_changed_ts");
        map.put(key.clone(), 42u64);
        assert_eq!(map.get::<u64>(&key), Some(42));
    }

    #[test]
    fn get_or_insert_with_runs_factory_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let map = DataMap::new();
        let key = DataKey::property("full_name", "required");
        for _ in 0..5 {
            let v = map.get_or_insert_with(key.clone(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                7i32
            });
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_applies_read_modify_write() {
        let map = DataMap::new();
        let key = DataKey::subject("counter");
        assert_eq!(map.update::<i32>(key.clone(), |v| v + 1), 1);
        assert_eq!(map.update::<i32>(key.clone(), |v| v + 1), 2);
        assert_eq!(map.get::<i32>(&key), Some(2));
    }

    #[test]
    fn subject_and_property_scopes_are_distinct() {
        let map = DataMap::new();
        map.put(DataKey::subject("x"), 1u8);
        map.put(DataKey::property("name", "x"), 2u8);
        assert_eq!(map.get::<u8>(&DataKey::subject("x")), Some(1));
        assert_eq!(map.get::<u8>(&DataKey::property("name", "x")), Some(2));
    }
}
