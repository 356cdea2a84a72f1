//! The derived-property engine's read/write entry points: `spec.md` §4.8's
//! "on any property read" and "on any property write" algorithms, and the
//! `recalculate` routine a dependent's recomputation runs through.
//!
//! Everything else in this crate is a primitive (the recorder, the edge
//! sets, the interceptor chain, the transaction coordinator); this module
//! is where they're wired into the actual control flow a generated or
//! hand-written property accessor calls through.

use crate::change::{self, Broadcast, PropertyChange};
use crate::context::SubjectContext;
use crate::derived;
use crate::interceptor::{run_read_chain, run_write_chain, ReadContext, WriteContext};
use crate::lifecycle;
use crate::metadata::DynValue;
use crate::recorder;
use crate::registry;
use crate::subject::{PropertyReference, SubjectId};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use subjective_depgraph::DataMap;

thread_local! {
    static WRITE_DEPTH: Cell<u32> = Cell::new(0);
}

/// The current thread's write-nesting depth: >0 while a
/// [`write_property`] call's interceptor chain (equality check through
/// storage) is on the stack. A derived getter invoked from within that
/// chain — by `recalculate` during propagation — observes depth 0 again,
/// since the depth counter is decremented before propagation runs; only a
/// write interceptor that itself performs another property write would
/// see a nonzero depth here.
pub fn write_depth() -> u32 {
    WRITE_DEPTH.with(Cell::get)
}

/// Implemented by property value types that may hold a reference to
/// another subject, so the lifecycle tracker can detect attach/detach
/// through an ordinary property write (`spec.md` §4.5) without the engine
/// needing to downcast an arbitrary `T`. Types with no such meaning keep
/// the default `None`.
pub trait SubjectLink {
    /// The subject this value currently references, if any.
    fn linked_subject(&self) -> Option<SubjectId> {
        None
    }
}

macro_rules! no_link {
    ($($t:ty),* $(,)?) => {
        $(impl SubjectLink for $t {})*
    };
}
no_link!(bool, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, char, String, ());

impl SubjectLink for SubjectId {
    fn linked_subject(&self) -> Option<SubjectId> {
        Some(*self)
    }
}

impl<T: SubjectLink> SubjectLink for Option<T> {
    fn linked_subject(&self) -> Option<SubjectId> {
        self.as_ref().and_then(SubjectLink::linked_subject)
    }
}

/// Reads `property`, running it through `context`'s read-interceptor chain
/// for value type `T` and recording a dependency touch if a derived
/// getter's recording is active on this thread.
///
/// `read_stored` performs the actual storage read; it runs once, as the
/// chain's terminal, unless an interceptor short-circuits it.
pub fn read_property<T>(
    property: PropertyReference,
    context: &SubjectContext,
    read_stored: impl FnOnce() -> T,
) -> T
where
    T: Clone + Send + Sync + 'static,
{
    let interceptors = context.read_interceptors::<T>();
    let mut ctx = ReadContext::new(property);
    let slot = std::cell::RefCell::new(Some(read_stored));
    let value = run_read_chain(&interceptors, &mut ctx, |c| {
        let read_stored = slot.borrow_mut().take().expect("chain terminal invoked at most once");
        c.set_value(read_stored());
    });
    if recorder::is_recording() {
        recorder::touch(property);
    }
    value
}

/// Writes `property`: equality-checks, runs `context`'s write-interceptor
/// chain for `T`, then either stores immediately or — inside an open
/// transaction — captures the write for later replay. A non-captured write
/// updates any subject link the value carries, emits a [`PropertyChange`]
/// to the subject's broadcast, and propagates to every derived property
/// that reads it.
pub fn write_property<T>(
    property: PropertyReference,
    context: &Arc<SubjectContext>,
    current_value: T,
    new_value: T,
    store: impl Fn(T) + Send + Sync + Clone + 'static,
) where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + SubjectLink + 'static,
{
    if new_value == current_value {
        return;
    }

    WRITE_DEPTH.with(|d| d.set(d.get() + 1));
    let interceptors = context.write_interceptors::<T>();
    let mut ctx = WriteContext::new(property, current_value.clone(), new_value);
    let old_value = current_value;
    let chain_context = context.clone();

    run_write_chain(&interceptors, &mut ctx, |c| {
        let final_value = c.final_value().clone();
        if crate::transaction::is_capturing() {
            let apply_context = chain_context.clone();
            let apply_store = store.clone();
            let apply_old = old_value.clone();
            let apply_final = final_value.clone();
            let restore_store = store.clone();
            let restore_old = old_value.clone();
            crate::transaction::capture(
                property,
                DynValue::new(old_value.clone()),
                move || finish(property, &apply_context, &apply_old, apply_final.clone(), &apply_store),
                move || restore_store(restore_old),
            );
        } else {
            finish(property, &chain_context, &old_value, final_value, &store);
        }
    });
    WRITE_DEPTH.with(|d| d.set(d.get() - 1));

    if !crate::transaction::is_capturing() {
        propagate_to_dependents(property);
    } else {
        lifecycle::flush_pending_removals(|base, dependent| {
            if let Some(base_data) = derived::data_for_ref(base) {
                base_data.used_by_properties.remove(&dependent);
            }
        });
    }
}

/// Performs the store, subject-link lifecycle transition, and change
/// broadcast for a write that is actually taking effect right now (either
/// an immediate non-transactional write, or a captured write being
/// replayed on commit).
fn finish<T>(
    property: PropertyReference,
    context: &Arc<SubjectContext>,
    old_value: &T,
    final_value: T,
    store: &impl Fn(T),
) where
    T: Clone + fmt::Debug + PartialEq + Send + Sync + SubjectLink + 'static,
{
    store(final_value.clone());

    let old_link = old_value.linked_subject();
    let new_link = final_value.linked_subject();
    if old_link != new_link {
        if let Some(old_child) = old_link {
            lifecycle::detach_subject(context, old_child, Some(property));
        }
        if let Some(new_child) = new_link {
            lifecycle::attach_subject(context, new_child, Some(property), || {
                registry::lookup(new_child)
                    .unwrap_or_else(|| panic!("{} must be registered before being linked", new_child))
            });
        }
    }

    if let Some(handle) = registry::lookup(property.subject()) {
        let record = PropertyChange {
            property,
            source: change::current_source(),
            changed_timestamp: change::current_changed_timestamp(),
            received_timestamp: change::current_received_timestamp(),
            old_value: DynValue::new(old_value.clone()),
            new_value: DynValue::new(final_value),
        };
        handle.broadcast().emit(&record);
    }
}

/// Propagates a completed write at `property` to every derived property
/// that reads it, per `spec.md` §4.8 steps 5-9.
fn propagate_to_dependents(property: PropertyReference) {
    let Some(data) = derived::data_for_ref(property) else {
        lifecycle::flush_pending_removals(|base, dependent| {
            if let Some(base_data) = derived::data_for_ref(base) {
                base_data.used_by_properties.remove(&dependent);
            }
        });
        return;
    };
    let (_, dependents) = data.used_by_properties.snapshot();
    if !dependents.is_empty() {
        for dependent in dependents.into_iter().filter(|d| *d != property) {
            if let Some(handle) = registry::lookup(dependent.subject()) {
                handle.recompute(dependent.property());
            }
        }
    }
    lifecycle::flush_pending_removals(|base, dependent| {
        if let Some(base_data) = derived::data_for_ref(base) {
            base_data.used_by_properties.remove(&dependent);
        }
    });
}

/// Recomputes a derived property: starts a recording frame, invokes
/// `getter`, reconciles the recorded dependencies via
/// [`derived::store_recorded`], updates `last_known_value`, and — if the
/// value actually changed — fires a change notification with a no-op
/// terminal (the computed value already lives in `last_known_value`, not
/// in any backing storage slot).
///
/// Called by the `SubjectHandle::recompute` a `#[derive(Subject)]` type
/// generates for each of its derived properties.
pub fn recalculate<T>(
    property: PropertyReference,
    context: &Arc<SubjectContext>,
    data_map: &DataMap,
    getter: impl FnOnce() -> T,
) where
    T: Clone + fmt::Debug + PartialEq + Send + Sync + SubjectLink + 'static,
{
    let data = derived::data_for(data_map, property.property());
    recorder::start_recording();
    let new_value = getter();
    let recorded = recorder::finish_recording();
    derived::store_recorded(property, &data, &recorded);

    let previous = data.replace_last_known_value(DynValue::new(new_value.clone()));
    let old_value = previous.as_ref().and_then(DynValue::downcast_ref::<T>).cloned();

    match old_value {
        Some(old_value) if old_value != new_value => {
            change::with_no_source(|| {
                finish(property, context, &old_value, new_value, &|_: T| {});
            });
        }
        Some(_) => {}
        None => propagate_to_dependents(property),
    }
}

/// Notifies the engine that `property`, declared both derived and
/// settable, just had its setter invoked — the rare "derived with setter"
/// pattern (`spec.md` §4.8 step 4) where observers should see the
/// recomputed value rather than whatever the setter alone stored.
pub fn recompute_after_derived_setter<T>(
    property: PropertyReference,
    context: &Arc<SubjectContext>,
    data_map: &DataMap,
    getter: impl FnOnce() -> T,
) where
    T: Clone + fmt::Debug + PartialEq + Send + Sync + SubjectLink + 'static,
{
    recalculate(property, context, data_map, getter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::testing::StubHandle;
    use parking_lot::Mutex;

    fn prop(subject: SubjectId, name: &'static str) -> PropertyReference {
        PropertyReference::new(subject, name)
    }

    #[test]
    fn read_property_touches_recorder_when_active() {
        let ctx = ContextBuilder::new().build();
        let property = prop(SubjectId::next(), "Name");

        assert!(!recorder::is_recording());
        let value = read_property(property, &ctx, || "hello".to_string());
        assert_eq!(value, "hello");

        recorder::start_recording();
        let _ = read_property(property, &ctx, || "hello".to_string());
        let recorded = recorder::finish_recording();
        recorder::clear_last();
        assert_eq!(recorded, vec![property]);
    }

    #[test]
    fn equal_value_write_is_a_no_op() {
        let ctx = ContextBuilder::new().build();
        let stored = Mutex::new(5i32);
        write_property(prop(SubjectId::next(), "X"), &ctx, 5, 5, |v| *stored.lock() = v);
        assert_eq!(*stored.lock(), 5);
    }

    #[test]
    fn write_stores_and_broadcasts_to_registered_subject() {
        let ctx = ContextBuilder::new().build();
        let subject = SubjectId::next();
        let handle = Arc::new(StubHandle::default());
        registry::register(subject, handle.clone());

        let observer = Arc::new(crate::testing::RecordingObserver::new());
        handle.broadcast().subscribe(observer.clone());

        let stored = Mutex::new(0i32);
        write_property(prop(subject, "X"), &ctx, 0, 9, |v| *stored.lock() = v);

        assert_eq!(*stored.lock(), 9);
        assert_eq!(observer.count(), 1);
        registry::unregister(subject);
    }

    #[test]
    fn write_propagates_to_derived_dependent() {
        let ctx = ContextBuilder::new().build();
        let subject = SubjectId::next();

        struct RecomputingHandle {
            inner: StubHandle,
            recomputed: Arc<std::sync::atomic::AtomicUsize>,
        }
        impl registry::SubjectHandle for RecomputingHandle {
            fn data_map(&self) -> &DataMap {
                self.inner.data_map()
            }
            fn recompute(&self, property: &'static str) {
                assert_eq!(property, "Derived");
                self.recomputed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn broadcast(&self) -> &Broadcast {
                self.inner.broadcast()
            }
        }

        let recomputed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = Arc::new(RecomputingHandle { inner: StubHandle::default(), recomputed: recomputed.clone() });
        registry::register(subject, handle.clone());

        let base = prop(subject, "Base");
        let derived_prop = prop(subject, "Derived");
        derived::data_for(handle.data_map(), "Base").used_by_properties.add(derived_prop);

        let stored = Mutex::new(0i32);
        write_property(base, &ctx, 0, 1, |v| *stored.lock() = v);

        assert_eq!(recomputed.load(std::sync::atomic::Ordering::SeqCst), 1);
        registry::unregister(subject);
    }
}
