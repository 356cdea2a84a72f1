//! The interceptor chain: two interception contracts, read and write,
//! both generic over the property's typed value to avoid boxing on the
//! hot path.
//!
//! Push-down invocation is modeled as a continuation (`Next`) rather than
//! the spec's literal `fn(&mut Context<T>) -> T` pointer type, since a
//! plain fn pointer can't close over "the rest of the chain" — `Next`
//! instead holds a slice of the remaining interceptors plus the terminal
//! closure, advancing one step per call. This is the same shape
//! tower-style middleware chains use in Rust; it keeps the invocation
//! allocation-free once the chain itself has been built.
//!
//! Only the user-extensible portion of a write goes through this generic,
//! dynamically-ordered chain. The four mandatory interceptors named in
//! `spec.md` §4.4 — equality check, derived-property engine, lifecycle,
//! transaction capture — are fixed, statically-ordered stages composed
//! directly in [`crate::engine::write_property`] / `read_property` rather
//! than registered into this chain as trait objects: their relative order
//! is dictated by the algorithm itself, not by markers, and keeping them
//! as plain function calls avoids a vtable call on every property access
//! for behavior that never actually varies. Equality check is the
//! exception: it's expressed here as [`EqualityCheck`], a blanket
//! `WriteInterceptor` impl, because user code may want to reuse or wrap
//! it; `engine::write_property` runs it first regardless.

use crate::subject::PropertyReference;
use std::sync::Arc;

/// The state visible to a read interceptor.
pub struct ReadContext<T> {
    property: PropertyReference,
    value: Option<T>,
}

impl<T> ReadContext<T> {
    /// Builds a context for reading `property`, with no value computed
    /// yet.
    pub fn new(property: PropertyReference) -> Self {
        Self { property, value: None }
    }

    /// The property being read.
    pub fn property(&self) -> PropertyReference {
        self.property
    }

    /// The value produced so far, if the terminal reader (or an
    /// interceptor short-circuiting it) has run.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Sets the value that will be returned once the chain unwinds.
    pub fn set_value(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Takes the value out, leaving `None` behind.
    pub fn take_value(&mut self) -> Option<T> {
        self.value.take()
    }
}

/// The state visible to a write interceptor.
pub struct WriteContext<T> {
    property: PropertyReference,
    current_value: T,
    new_value: T,
    final_value: Option<T>,
}

impl<T> WriteContext<T> {
    /// Builds a context proposing to replace `current_value` with
    /// `new_value` at `property`.
    pub fn new(property: PropertyReference, current_value: T, new_value: T) -> Self {
        Self { property, current_value, new_value, final_value: None }
    }

    /// The property being written.
    pub fn property(&self) -> PropertyReference {
        self.property
    }

    /// The value stored before this write began.
    pub fn current_value(&self) -> &T {
        &self.current_value
    }

    /// The value the caller proposed.
    pub fn new_value(&self) -> &T {
        &self.new_value
    }

    /// Overrides the value that will actually be stored (used by
    /// interceptors that clamp or normalize a proposed value before it
    /// reaches the terminal mutator).
    pub fn set_final_value(&mut self, value: T) {
        self.final_value = Some(value);
    }

    /// The value that will be stored: whatever an upstream interceptor set
    /// via [`WriteContext::set_final_value`], or `new_value` otherwise.
    pub fn final_value(&self) -> &T {
        self.final_value.as_ref().unwrap_or(&self.new_value)
    }

    /// Consumes the context, returning the value that should actually be
    /// stored.
    pub fn into_final_value(self) -> T {
        self.final_value.unwrap_or(self.new_value)
    }
}

/// A read interceptor, generic over the property value type `T` it
/// applies to. Registered per-`T` on a [`crate::context::SubjectContext`].
pub trait ReadInterceptor<T>: Send + Sync + 'static {
    /// Observes or replaces a read in progress. Call `next` to continue
    /// down the chain; not calling it suppresses the remainder (used by
    /// interceptors that serve a cached or synthetic value).
    fn read(&self, ctx: &mut ReadContext<T>, next: Next<'_, ReadContext<T>>) -> T;
}

/// A write interceptor, generic over the property value type `T` it
/// applies to.
pub trait WriteInterceptor<T>: Send + Sync + 'static {
    /// Observes, may veto, or may rewrite a write in progress. Call `next`
    /// to continue down the chain; not calling it suppresses the write
    /// entirely — used by the equality-check interceptor to eliminate
    /// change notifications for no-op writes.
    fn write(&self, ctx: &mut WriteContext<T>, next: Next<'_, WriteContext<T>>);
}

/// A continuation over the remaining stages of an interceptor chain,
/// ending at a terminal closure.
pub struct Next<'a, C> {
    remaining: &'a [Arc<dyn StageFor<C>>],
    terminal: &'a dyn Fn(&mut C),
}

/// Unifies `ReadInterceptor<T>` and `WriteInterceptor<T>` behind one
/// object-safe shape so [`Next`] doesn't need a separate type per
/// capability.
trait StageFor<C> {
    fn run(&self, ctx: &mut C, next: Next<'_, C>);
}

struct ReadStage<T>(Arc<dyn ReadInterceptor<T>>);
impl<T> StageFor<ReadContext<T>> for ReadStage<T> {
    fn run(&self, ctx: &mut ReadContext<T>, next: Next<'_, ReadContext<T>>) {
        let value = self.0.read(ctx, next);
        ctx.set_value(value);
    }
}

struct WriteStage<T>(Arc<dyn WriteInterceptor<T>>);
impl<T> StageFor<WriteContext<T>> for WriteStage<T> {
    fn run(&self, ctx: &mut WriteContext<T>, next: Next<'_, WriteContext<T>>) {
        self.0.write(ctx, next)
    }
}

impl<'a, C> Next<'a, C> {
    fn new(remaining: &'a [Arc<dyn StageFor<C>>], terminal: &'a dyn Fn(&mut C)) -> Self {
        Self { remaining, terminal }
    }

    /// Invokes the next stage, or the terminal closure if none remain.
    pub fn call(self, ctx: &mut C) {
        match self.remaining.split_first() {
            Some((first, rest)) => {
                let next = Next::new(rest, self.terminal);
                first.run(ctx, next)
            }
            None => (self.terminal)(ctx),
        }
    }
}

/// Runs a write chain of `interceptors` against `ctx`, ending at
/// `terminal`.
pub fn run_write_chain<T: 'static>(
    interceptors: &[Arc<dyn WriteInterceptor<T>>],
    ctx: &mut WriteContext<T>,
    terminal: impl Fn(&mut WriteContext<T>),
) {
    let stages: Vec<Arc<dyn StageFor<WriteContext<T>>>> =
        interceptors.iter().cloned().map(|i| Arc::new(WriteStage(i)) as _).collect();
    let next = Next::new(&stages, &terminal);
    next.call(ctx);
}

/// Runs a read chain of `interceptors` against `ctx`, ending at
/// `terminal`, and returns the value the chain produced.
pub fn run_read_chain<T: 'static>(
    interceptors: &[Arc<dyn ReadInterceptor<T>>],
    ctx: &mut ReadContext<T>,
    terminal: impl Fn(&mut ReadContext<T>),
) -> T {
    let stages: Vec<Arc<dyn StageFor<ReadContext<T>>>> =
        interceptors.iter().cloned().map(|i| Arc::new(ReadStage(i)) as _).collect();
    let next = Next::new(&stages, &terminal);
    next.call(ctx);
    ctx.take_value().expect("chain terminal always sets a value")
}

/// The mandatory equality-check write interceptor: if the proposed value
/// equals the currently stored value, the write is suppressed entirely
/// (no `next`, no change notification). Exposed as an ordinary
/// [`WriteInterceptor`] so user code can compose with or replace it, but
/// `engine::write_property` always runs an equivalent check first
/// regardless of what's registered.
pub struct EqualityCheck;

impl<T: PartialEq + Send + Sync + 'static> WriteInterceptor<T> for EqualityCheck {
    fn write(&self, ctx: &mut WriteContext<T>, next: Next<'_, WriteContext<T>>) {
        if ctx.current_value() != ctx.new_value() {
            next.call(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectId;

    fn prop() -> PropertyReference {
        PropertyReference::new(SubjectId::next(), "Value")
    }

    struct DoubleWriter;
    impl WriteInterceptor<i32> for DoubleWriter {
        fn write(&self, ctx: &mut WriteContext<i32>, next: Next<'_, WriteContext<i32>>) {
            ctx.set_final_value(ctx.new_value() * 2);
            next.call(ctx);
        }
    }

    #[test]
    fn equality_check_suppresses_noop_write() {
        let mut stored = 5;
        let chain: Vec<Arc<dyn WriteInterceptor<i32>>> = vec![Arc::new(EqualityCheck)];
        let mut ctx = WriteContext::new(prop(), 5, 5);
        run_write_chain(&chain, &mut ctx, |c| stored = *c.final_value());
        assert_eq!(stored, 5, "terminal must not run on a no-op write");
    }

    #[test]
    fn interceptor_can_rewrite_final_value() {
        let mut stored = 0;
        let chain: Vec<Arc<dyn WriteInterceptor<i32>>> = vec![Arc::new(DoubleWriter)];
        let mut ctx = WriteContext::new(prop(), 0, 4);
        run_write_chain(&chain, &mut ctx, |c| stored = *c.final_value());
        assert_eq!(stored, 8);
    }

    struct ConstantReader(i32);
    impl ReadInterceptor<i32> for ConstantReader {
        fn read(&self, _ctx: &mut ReadContext<i32>, _next: Next<'_, ReadContext<i32>>) -> i32 {
            self.0
        }
    }

    #[test]
    fn read_interceptor_can_short_circuit() {
        let chain: Vec<Arc<dyn ReadInterceptor<i32>>> = vec![Arc::new(ConstantReader(99))];
        let mut ctx = ReadContext::new(prop());
        let value = run_read_chain(&chain, &mut ctx, |c| c.set_value(1));
        assert_eq!(value, 99);
    }
}
