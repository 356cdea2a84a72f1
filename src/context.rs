//! Subject context: the service registry and fallback chain handlers are
//! discovered through.

use crate::error::{Error, Result};
use crate::interceptor::{ReadInterceptor, WriteInterceptor};
use crate::lifecycle::LifecycleHandler;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Declares a service's position in its capability's invocation order.
///
/// Plain declaration order is the default; `runs_before` names the tags of
/// other services (in the same context) that must run only after this
/// one, and `runs_first` is shorthand for "before every other service in
/// this capability", used by the derived-property engine so it can record
/// dependencies before lifecycle handlers observe the attach.
#[derive(Clone, Debug, Default)]
pub struct Markers {
    tag: Option<&'static str>,
    runs_before: Vec<&'static str>,
    runs_first: bool,
}

impl Markers {
    /// No ordering constraints; the service runs in declaration order.
    pub fn none() -> Self {
        Self::default()
    }

    /// Tags this service so other services can order themselves relative
    /// to it via [`Markers::runs_before`].
    pub fn tagged(mut self, tag: &'static str) -> Self {
        self.tag = Some(tag);
        self
    }

    /// This service must run before the service tagged `tag`, if one is
    /// registered in the same context.
    pub fn runs_before(mut self, tag: &'static str) -> Self {
        self.runs_before.push(tag);
        self
    }

    /// This service must run before every other service registered for
    /// its capability in this context.
    pub fn runs_first(mut self) -> Self {
        self.runs_first = true;
        self
    }
}

/// Sorts `entries` by the partial order their markers describe, preserving
/// each entry's relative declaration order where markers don't force a
/// different one. Kahn's algorithm over a graph built from `runs_before`
/// edges (resolved against tags present in this same call) and
/// `runs_first` edges (an implicit edge from every `runs_first` entry to
/// every other entry).
pub(crate) fn order_by_markers<S>(entries: Vec<(Markers, S)>) -> Result<Vec<S>> {
    let n = entries.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];

    let tag_index: HashMap<&'static str, usize> = entries
        .iter()
        .enumerate()
        .filter_map(|(i, (m, _))| m.tag.map(|t| (t, i)))
        .collect();

    for (i, (markers, _)) in entries.iter().enumerate() {
        if markers.runs_first {
            for j in 0..n {
                if j != i {
                    successors[i].push(j);
                    in_degree[j] += 1;
                }
            }
        }
        for before in &markers.runs_before {
            if let Some(&j) = tag_index.get(before) {
                if j != i {
                    successors[i].push(j);
                    in_degree[j] += 1;
                }
            }
        }
    }

    // Stable Kahn's algorithm: among ready nodes, always take the
    // lowest-index (earliest-declared) one first, so services with no
    // ordering constraints keep their declaration order.
    let mut ready: std::collections::BTreeSet<usize> =
        (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() != n {
        return Err(Error::HandlerOrderCycle(format!(
            "{} of {} services could not be ordered; runs-before/runs-first markers form a cycle",
            n - order.len(),
            n
        )));
    }

    let mut entries: Vec<Option<S>> = entries.into_iter().map(|(_, s)| Some(s)).collect();
    Ok(order.into_iter().map(|i| entries[i].take().expect("each index visited once")).collect())
}

struct TypedInterceptors {
    // keyed by TypeId::of::<T>(); each stored value is a
    // `Vec<(Markers, Arc<dyn ReadInterceptor<T>>)>` or the write
    // equivalent, type-erased behind `Box<dyn Any>` and downcast back at
    // chain-build time, the same sharding `dyn-cache` namespaces values by.
    read: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    write: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Default for TypedInterceptors {
    fn default() -> Self {
        Self { read: HashMap::new(), write: HashMap::new() }
    }
}

/// A service registry and fallback chain.
///
/// `services_of<C>` in the spec's pseudocode is realized here as
/// capability-specific accessors (`read_interceptors::<T>`,
/// `lifecycle_handlers`, ...) rather than one generic lookup, since Rust
/// has no dynamic "give me all things implementing trait C" operation —
/// each capability gets its own typed storage and its own ordered-fetch
/// method, documented per capability below.
pub struct SubjectContext {
    frozen: AtomicBool,
    typed: RwLock<TypedInterceptors>,
    lifecycle_handlers: RwLock<Vec<(Markers, Arc<dyn LifecycleHandler>)>>,
    services: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    fallbacks: Vec<Arc<SubjectContext>>,
}

impl fmt::Debug for SubjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectContext")
            .field("frozen", &self.frozen.load(Ordering::Relaxed))
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl SubjectContext {
    fn new(fallbacks: Vec<Arc<SubjectContext>>) -> Self {
        Self {
            frozen: AtomicBool::new(false),
            typed: RwLock::new(TypedInterceptors::default()),
            lifecycle_handlers: RwLock::new(Vec::new()),
            services: RwLock::new(HashMap::new()),
            fallbacks,
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            Err(Error::ContextFrozen)
        } else {
            Ok(())
        }
    }

    /// Freezes the context: called by [`crate::lifecycle`] the moment the
    /// first subject attaches to it. Idempotent.
    pub(crate) fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::AcqRel) {
            tracing::debug!("subject context frozen on first attach");
        }
    }

    /// `true` once the first subject has attached; registration past this
    /// point fails with [`Error::ContextFrozen`].
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Registers a read interceptor for properties of value type `T`.
    pub fn register_read_interceptor<T: 'static>(
        &self,
        markers: Markers,
        interceptor: Arc<dyn ReadInterceptor<T>>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let mut typed = self.typed.write();
        let slot = typed
            .read
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<(Markers, Arc<dyn ReadInterceptor<T>>)>::new()));
        let list = slot
            .downcast_mut::<Vec<(Markers, Arc<dyn ReadInterceptor<T>>)>>()
            .expect("TypeId-sharded slot used with a consistent type");
        list.push((markers, interceptor));
        Ok(())
    }

    /// Registers a write interceptor for properties of value type `T`.
    pub fn register_write_interceptor<T: 'static>(
        &self,
        markers: Markers,
        interceptor: Arc<dyn WriteInterceptor<T>>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let mut typed = self.typed.write();
        let slot = typed
            .write
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<(Markers, Arc<dyn WriteInterceptor<T>>)>::new()));
        let list = slot
            .downcast_mut::<Vec<(Markers, Arc<dyn WriteInterceptor<T>>)>>()
            .expect("TypeId-sharded slot used with a consistent type");
        list.push((markers, interceptor));
        Ok(())
    }

    /// Registers a lifecycle handler, run on every attach/detach event.
    pub fn register_lifecycle_handler(
        &self,
        markers: Markers,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        self.lifecycle_handlers.write().push((markers, handler));
        Ok(())
    }

    /// Registers an arbitrary typed service, retrievable later with
    /// [`SubjectContext::try_service`].
    pub fn register_service<T: Send + Sync + 'static>(&self, service: T) -> Result<()> {
        self.ensure_mutable()?;
        self.services.write().insert(TypeId::of::<T>(), Box::new(service));
        Ok(())
    }

    /// Looks up a service of type `T`, checking this context's own
    /// registrations first and then each fallback in order.
    pub fn try_service<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        if let Some(found) = self.services.read().get(&TypeId::of::<T>()) {
            return found.downcast_ref::<T>().cloned();
        }
        self.fallbacks.iter().find_map(|fallback| fallback.try_service::<T>())
    }

    /// The ordered read-interceptor chain for value type `T`: this
    /// context's own registrations (sorted by marker), followed by each
    /// fallback's chain in order.
    pub fn read_interceptors<T: 'static>(&self) -> Vec<Arc<dyn ReadInterceptor<T>>> {
        let mut own = {
            let typed = self.typed.read();
            typed
                .read
                .get(&TypeId::of::<T>())
                .and_then(|slot| slot.downcast_ref::<Vec<(Markers, Arc<dyn ReadInterceptor<T>>)>>())
                .cloned()
                .unwrap_or_default()
        };
        own = order_by_markers(own).unwrap_or_else(|err| {
            tracing::error!(%err, "read interceptor order cycle; falling back to declaration order");
            Vec::new()
        });
        let mut chain: Vec<Arc<dyn ReadInterceptor<T>>> = own;
        for fallback in &self.fallbacks {
            chain.extend(fallback.read_interceptors::<T>());
        }
        chain
    }

    /// The ordered write-interceptor chain for value type `T`.
    pub fn write_interceptors<T: 'static>(&self) -> Vec<Arc<dyn WriteInterceptor<T>>> {
        let own = {
            let typed = self.typed.read();
            typed
                .write
                .get(&TypeId::of::<T>())
                .and_then(|slot| slot.downcast_ref::<Vec<(Markers, Arc<dyn WriteInterceptor<T>>)>>())
                .cloned()
                .unwrap_or_default()
        };
        let own = order_by_markers(own).unwrap_or_else(|err| {
            tracing::error!(%err, "write interceptor order cycle; falling back to declaration order");
            Vec::new()
        });
        let mut chain: Vec<Arc<dyn WriteInterceptor<T>>> = own;
        for fallback in &self.fallbacks {
            chain.extend(fallback.write_interceptors::<T>());
        }
        chain
    }

    /// The ordered lifecycle handler list: this context's own handlers
    /// (sorted by marker), followed by each fallback's in order.
    pub fn lifecycle_handlers(&self) -> Vec<Arc<dyn LifecycleHandler>> {
        let own = self.lifecycle_handlers.read().clone();
        let own = order_by_markers(own).unwrap_or_else(|err| {
            tracing::error!(%err, "lifecycle handler order cycle; falling back to declaration order");
            Vec::new()
        });
        let mut all = own;
        for fallback in &self.fallbacks {
            all.extend(fallback.lifecycle_handlers());
        }
        all
    }
}

/// Builds a [`SubjectContext`]. This is the sole configuration surface for
/// a runtime: there is no file or environment configuration, matching
/// `spec.md` §6's "no CLI, environment, or on-disk formats belong to the
/// core."
#[derive(Default)]
pub struct ContextBuilder {
    fallbacks: Vec<Arc<SubjectContext>>,
}

impl ContextBuilder {
    /// Starts building a context with no fallbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `fallback` to the end of this context's fallback chain.
    /// Lookups consult this context's own registrations first, then each
    /// fallback in the order they were added.
    pub fn add_fallback(mut self, fallback: Arc<SubjectContext>) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    /// Builds the context. The result still accepts registrations until
    /// the first subject attaches to it.
    pub fn build(self) -> Arc<SubjectContext> {
        Arc::new(SubjectContext::new(self.fallbacks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_after_freeze_fails() {
        let ctx = ContextBuilder::new().build();
        ctx.register_service(42i32).unwrap();
        ctx.freeze();
        match ctx.register_service(7i32) {
            Err(Error::ContextFrozen) => {}
            other => panic!("expected ContextFrozen, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn service_lookup_falls_back() {
        let base = ContextBuilder::new().build();
        base.register_service("base value".to_string()).unwrap();
        let derived = ContextBuilder::new().add_fallback(base).build();
        assert_eq!(derived.try_service::<String>().as_deref(), Some("base value"));
    }

    #[test]
    fn own_service_shadows_fallback() {
        let base = ContextBuilder::new().build();
        base.register_service(1i32).unwrap();
        let derived = ContextBuilder::new().add_fallback(base).build();
        derived.register_service(2i32).unwrap();
        assert_eq!(derived.try_service::<i32>(), Some(2));
    }

    #[test]
    fn runs_first_marker_wins_ordering() {
        let order: Vec<&str> =
            order_by_markers(vec![
                (Markers::none(), "a"),
                (Markers::none().runs_first(), "b"),
                (Markers::none(), "c"),
            ])
            .unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn runs_before_tag_is_respected() {
        let order: Vec<&str> = order_by_markers(vec![
            (Markers::none().tagged("late"), "late-handler"),
            (Markers::none().runs_before("late"), "early-handler"),
        ])
        .unwrap();
        assert_eq!(order, vec!["early-handler", "late-handler"]);
    }

    #[test]
    fn marker_cycle_is_rejected() {
        let result: Result<Vec<&str>> = order_by_markers(vec![
            (Markers::none().tagged("a").runs_before("b"), "a"),
            (Markers::none().tagged("b").runs_before("a"), "b"),
        ]);
        assert!(matches!(result, Err(Error::HandlerOrderCycle(_))));
    }
}
