//! Process-wide registry mapping a subject's stable identity to a handle
//! the derived-property engine can use to reach its data map and
//! recompute one of its properties addressed only by name.
//!
//! Subjects are ordinary Rust values; nothing about [`crate::subject::Subject`]
//! requires them to live behind a shared pointer reachable from anywhere.
//! But the engine's propagation step (`spec.md` §4.8, "for each dependent
//! in the snapshot, invoke recalculate") names dependents only as
//! `PropertyReference`s, which may point at a different subject than the
//! one just written. Resolving that reference back to something callable
//! needs exactly one indirection: this registry, populated on attach and
//! cleared on detach by [`crate::lifecycle`].

use crate::change::Broadcast;
use crate::subject::SubjectId;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use subjective_depgraph::DataMap;

/// What the engine needs from a live, attached subject.
pub trait SubjectHandle: Send + Sync + 'static {
    /// The subject's extension-data map, where dependency edges and
    /// last-known values live.
    fn data_map(&self) -> &DataMap;

    /// Re-invokes `property`'s getter and re-runs the derived-property
    /// bookkeeping for it. A no-op if `property` isn't declared as
    /// derived on this subject.
    fn recompute(&self, property: &'static str);

    /// The subject's observable-broadcast fan-out.
    fn broadcast(&self) -> &Broadcast;
}

static REGISTRY: Lazy<RwLock<HashMap<SubjectId, Arc<dyn SubjectHandle>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers `handle` under `id`, replacing any prior registration — a
/// subject that reattaches after a full detach re-registers under the
/// same id.
pub fn register(id: SubjectId, handle: Arc<dyn SubjectHandle>) {
    REGISTRY.write().insert(id, handle);
}

/// Removes the registration for `id`, once its reference count reaches
/// zero and detach bookkeeping has run.
pub fn unregister(id: SubjectId) {
    REGISTRY.write().remove(&id);
}

/// Looks up the handle for `id`, if currently registered.
pub fn lookup(id: SubjectId) -> Option<Arc<dyn SubjectHandle>> {
    REGISTRY.read().get(&id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Noop {
        broadcast: Broadcast,
    }
    impl SubjectHandle for Noop {
        fn data_map(&self) -> &DataMap {
            unimplemented!("not exercised by this test")
        }
        fn recompute(&self, _property: &'static str) {}
        fn broadcast(&self) -> &Broadcast {
            &self.broadcast
        }
    }

    #[test]
    fn register_lookup_unregister_round_trip() {
        let id = SubjectId::next();
        assert!(lookup(id).is_none());
        register(id, Arc::new(Noop::default()));
        assert!(lookup(id).is_some());
        unregister(id);
        assert!(lookup(id).is_none());
    }
}
