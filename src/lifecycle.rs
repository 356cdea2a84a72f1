//! Lifecycle tracker: attach/detach reference counting and the
//! notifications fired as subjects enter and leave the graph.

use crate::context::SubjectContext;
use crate::registry;
use crate::subject::{PropertyReference, SubjectId};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// One of the four event shapes `spec.md` §4.5 defines, delivered to every
/// registered [`LifecycleHandler`] in order.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// A subject's reference count went from 0 to 1 (or back up from 0
    /// after a prior detach).
    AttachSubject {
        /// The subject that attached.
        subject: SubjectId,
        /// The property it attached through, if any (a subject can also
        /// attach as a root with no parent property).
        via_property: Option<PropertyReference>,
        /// The reference count immediately after this attach.
        ref_count_after: u32,
        /// Whether this is the subject's very first attach.
        is_first_attach: bool,
    },
    /// A subject's reference count went from N to N-1 and reached 0.
    DetachSubject {
        /// The subject that detached.
        subject: SubjectId,
        /// The property it detached through, if any.
        via_property: Option<PropertyReference>,
        /// The reference count immediately after this detach (always 0).
        ref_count_after: u32,
        /// Whether this detach is the subject's last (it always is, since
        /// this event only fires when the count reaches 0).
        is_last_detach: bool,
    },
    /// `property` on `subject` received its first attached reference.
    AttachProperty {
        /// The subject owning the property.
        subject: SubjectId,
        /// The property name.
        property: &'static str,
    },
    /// `property` on `subject` lost its last attached reference.
    DetachProperty {
        /// The subject owning the property.
        subject: SubjectId,
        /// The property name.
        property: &'static str,
    },
}

/// A handler notified of every lifecycle event on a context, in the order
/// its markers resolve to.
pub trait LifecycleHandler: Send + Sync + 'static {
    /// Handles one lifecycle event.
    fn on_event(&self, event: &LifecycleEvent);
}

/// Per-subject reference counting keyed on the parent `(subject,
/// property)` edge, per `spec.md`'s cyclic-reference design note: a
/// subject's count is the number of distinct parent edges holding it, not
/// the number of `Arc`/`Rc` clones in memory, so two subjects can
/// reference each other without either pinning the other in place.
#[derive(Default)]
pub struct ReferenceCounts {
    // subject -> set of (parent_subject, parent_property) edges holding it
    inner: Mutex<HashMap<SubjectId, Vec<(SubjectId, &'static str)>>>,
}

impl ReferenceCounts {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current reference count for `subject`.
    pub fn count(&self, subject: SubjectId) -> u32 {
        self.inner.lock().get(&subject).map(|edges| edges.len() as u32).unwrap_or(0)
    }

    /// Adds an edge `(parent, property) -> subject`. Returns the count
    /// after the add and whether this was the edge's first attach
    /// (count went from 0 to 1).
    pub fn add_edge(&self, subject: SubjectId, parent: SubjectId, property: &'static str) -> (u32, bool) {
        let mut table = self.inner.lock();
        let edges = table.entry(subject).or_default();
        if !edges.contains(&(parent, property)) {
            edges.push((parent, property));
        }
        let count = edges.len() as u32;
        (count, count == 1)
    }

    /// Removes the edge `(parent, property) -> subject`. Returns the
    /// count after the removal and whether it reached 0.
    pub fn remove_edge(
        &self,
        subject: SubjectId,
        parent: SubjectId,
        property: &'static str,
    ) -> (u32, bool) {
        let mut table = self.inner.lock();
        let count = if let Some(edges) = table.get_mut(&subject) {
            edges.retain(|edge| edge != &(parent, property));
            let count = edges.len() as u32;
            if count == 0 {
                table.remove(&subject);
            }
            count
        } else {
            0
        };
        (count, count == 0)
    }
}

/// Counts how many distinct children are currently attached through a
/// given `(subject, property)` edge, so an `AttachProperty`/`DetachProperty`
/// event only fires on the edge's first attach / last detach — distinct
/// from [`ReferenceCounts`], which counts from the child's side.
#[derive(Default)]
struct PropertyRefCounts {
    inner: Mutex<HashMap<(SubjectId, &'static str), u32>>,
}

impl PropertyRefCounts {
    fn increment(&self, subject: SubjectId, property: &'static str) -> (u32, bool) {
        let mut table = self.inner.lock();
        let count = table.entry((subject, property)).or_insert(0);
        *count += 1;
        (*count, *count == 1)
    }

    fn decrement(&self, subject: SubjectId, property: &'static str) -> (u32, bool) {
        let mut table = self.inner.lock();
        match table.get_mut(&(subject, property)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                let count = *count;
                if count == 0 {
                    table.remove(&(subject, property));
                }
                (count, count == 0)
            }
            _ => (0, true),
        }
    }
}

static REF_COUNTS: Lazy<ReferenceCounts> = Lazy::new(ReferenceCounts::new);
static PROPERTY_REF_COUNTS: Lazy<PropertyRefCounts> = Lazy::new(PropertyRefCounts::default);

/// The live reference count for `subject`, per `spec.md` §4.15 — a
/// supplemented, always-current read rather than a value cached at attach
/// time.
pub fn ref_count(subject: SubjectId) -> u32 {
    REF_COUNTS.count(subject)
}

fn notify(context: &SubjectContext, event: LifecycleEvent) {
    for handler in context.lifecycle_handlers() {
        handler.on_event(&event);
    }
}

/// Attaches `subject` into the graph through `via_property` (or as a root,
/// if `None`), registering it so the derived-property engine and other
/// subjects can reach it by id, and firing `AttachSubject`/`AttachProperty`
/// events per `spec.md` §4.5.
///
/// `handle` is registered with [`crate::registry`] only on the subject's
/// very first attach; re-attaching an already-registered subject (a second
/// parent picking up the same child) just bumps its count.
pub fn attach_subject(
    context: &SubjectContext,
    subject: SubjectId,
    via_property: Option<PropertyReference>,
    handle: impl FnOnce() -> Arc<dyn registry::SubjectHandle>,
) {
    context.freeze();
    let (parent, prop_name) = via_property.map(|p| (p.subject(), p.property())).unwrap_or((subject, "<root>"));
    let (ref_count_after, is_first_attach) = REF_COUNTS.add_edge(subject, parent, prop_name);
    if is_first_attach {
        registry::register(subject, handle());
    }
    notify(
        context,
        LifecycleEvent::AttachSubject { subject, via_property, ref_count_after, is_first_attach },
    );
    if let Some(via) = via_property {
        let (_, is_first_on_property) = PROPERTY_REF_COUNTS.increment(via.subject(), via.property());
        if is_first_on_property {
            notify(
                context,
                LifecycleEvent::AttachProperty { subject: via.subject(), property: via.property() },
            );
        }
    }
}

/// Detaches `subject` from the graph through `via_property` (or as a root),
/// firing `DetachSubject`/`DetachProperty` events, and unregistering it once
/// its reference count reaches zero (Case 1 of `spec.md` §4.5: the subject
/// itself leaves the graph). Case 2 — a *dependent* derived property's
/// backward edge to a base that's since been dropped — is handled by the
/// derived-property engine via [`defer_removal`]/[`flush_pending_removals`],
/// not here.
pub fn detach_subject(
    context: &SubjectContext,
    subject: SubjectId,
    via_property: Option<PropertyReference>,
) {
    let (parent, prop_name) = via_property.map(|p| (p.subject(), p.property())).unwrap_or((subject, "<root>"));
    let (ref_count_after, is_last_detach) = REF_COUNTS.remove_edge(subject, parent, prop_name);
    if is_last_detach {
        registry::unregister(subject);
    }
    notify(
        context,
        LifecycleEvent::DetachSubject { subject, via_property, ref_count_after, is_last_detach },
    );
    if let Some(via) = via_property {
        let (_, is_last_on_property) = PROPERTY_REF_COUNTS.decrement(via.subject(), via.property());
        if is_last_on_property {
            notify(
                context,
                LifecycleEvent::DetachProperty { subject: via.subject(), property: via.property() },
            );
        }
    }
}

thread_local! {
    /// Case 2 detach cleanup deferred during an in-flight write, flushed
    /// once the write completes. See `spec.md` §4.5's fast-path note: by
    /// the time these flush, a same-write recalculation has usually
    /// already replaced the dependent's `required_properties` wholesale,
    /// so the deferred removal finds nothing and returns in O(1).
    static PENDING_REMOVALS: RefCell<Vec<(PropertyReference, PropertyReference)>> =
        RefCell::new(Vec::new());
}

/// Defers "remove `dependent` from `base.used_by_properties`" until the
/// current write completes.
pub fn defer_removal(base: PropertyReference, dependent: PropertyReference) {
    PENDING_REMOVALS.with(|p| p.borrow_mut().push((base, dependent)));
}

/// Flushes every deferred removal, applying `apply` to each `(base,
/// dependent)` pair.
pub fn flush_pending_removals(mut apply: impl FnMut(PropertyReference, PropertyReference)) {
    let pending = PENDING_REMOVALS.with(|p| std::mem::take(&mut *p.borrow_mut()));
    for (base, dependent) in pending {
        apply(base, dependent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::testing::StubHandle;
    use parking_lot::Mutex as StdMutex;

    #[test]
    fn attach_fires_events_and_registers_handle() {
        let ctx = ContextBuilder::new().build();
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        struct Recorder(Arc<StdMutex<Vec<String>>>);
        impl LifecycleHandler for Recorder {
            fn on_event(&self, event: &LifecycleEvent) {
                self.0.lock().push(format!("{:?}", event));
            }
        }
        ctx.register_lifecycle_handler(crate::context::Markers::none(), Arc::new(Recorder(seen.clone())))
            .unwrap();

        let parent = SubjectId::next();
        let child = SubjectId::next();
        let via = PropertyReference::new(parent, "Child");

        attach_subject(&ctx, child, Some(via), || Arc::new(StubHandle::default()));
        assert_eq!(ref_count(child), 1);
        assert!(registry::lookup(child).is_some());
        assert_eq!(seen.lock().len(), 2, "expect AttachSubject and AttachProperty");

        detach_subject(&ctx, child, Some(via));
        assert_eq!(ref_count(child), 0);
        assert!(registry::lookup(child).is_none());
        assert_eq!(seen.lock().len(), 4, "expect DetachSubject and DetachProperty too");
    }

    #[test]
    fn second_parent_does_not_reregister_or_reemit_attach_property() {
        let ctx = ContextBuilder::new().build();
        let child = SubjectId::next();
        let parent_a = SubjectId::next();
        let parent_b = SubjectId::next();

        attach_subject(&ctx, child, Some(PropertyReference::new(parent_a, "A")), || {
            Arc::new(StubHandle::default())
        });
        attach_subject(&ctx, child, Some(PropertyReference::new(parent_b, "B")), || {
            panic!("handle() must not be called on a second attach")
        });
        assert_eq!(ref_count(child), 2);

        detach_subject(&ctx, child, Some(PropertyReference::new(parent_a, "A")));
        assert!(registry::lookup(child).is_some(), "still referenced by parent_b");
        detach_subject(&ctx, child, Some(PropertyReference::new(parent_b, "B")));
        assert!(registry::lookup(child).is_none());
    }
}
