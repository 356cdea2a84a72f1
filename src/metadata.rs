//! Subject & property metadata: immutable per-type descriptors built once
//! and shared by every subject of that type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Once;

/// Declarative markers a property or method can carry. [`Attribute::Derived`]
/// is the one the engine inspects directly ([`PropertyMetadata::is_derived`]);
/// the rest are opaque tags external collaborators (validation,
/// serialization, authorization) look for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Attribute {
    /// The property's value is computed from other properties.
    Derived,
    /// The property is part of the subject's user-facing configuration.
    Configuration,
    /// The property reflects the subject's runtime state.
    State,
    /// Invoking it reads state without side effects.
    Query,
    /// Invoking it performs a side-effecting operation.
    Operation,
    /// An extension-defined marker the core doesn't interpret.
    Custom(&'static str),
}

/// Whether a declared method is a side-effect-free query or a
/// side-effecting operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MethodKind {
    /// Safe to call repeatedly without changing observable state.
    Query,
    /// May change the subject's state or have other side effects.
    Operation,
}

/// Immutable, per-`(type, property-name)` descriptor.
///
/// `read`/`write` are intentionally type-erased (`Box<dyn Any>` in, out)
/// even though the interception contracts in [`crate::interceptor`] are
/// generic over the property's concrete type: a `TypeDescriptor` is a
/// runtime-introspectable table shared across heterogeneous property
/// types, so its accessors can't be monomorphized the way a single
/// property's hand-written getter/setter is. Declared accessors
/// (hand-written or macro-generated) call through the generic
/// `read_property`/`write_property` entry points directly rather than
/// through this table; the table exists for reflection-style consumers
/// (serialization, path-based addressing) named in `spec.md` §6.
pub struct PropertyMetadata {
    name: &'static str,
    value_type: TypeId,
    value_type_name: &'static str,
    attributes: Vec<Attribute>,
    settable: bool,
}

impl PropertyMetadata {
    /// Declares a property named `name` with value type `T`.
    pub fn new<T: 'static>(name: &'static str, attributes: Vec<Attribute>, settable: bool) -> Self {
        Self {
            name,
            value_type: TypeId::of::<T>(),
            value_type_name: std::any::type_name::<T>(),
            attributes,
            settable,
        }
    }

    /// The property's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The `TypeId` of the property's declared value type.
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    /// A human-readable name for the property's declared value type.
    pub fn value_type_name(&self) -> &'static str {
        self.value_type_name
    }

    /// The attribute set declared for this property.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// `true` if [`Attribute::Derived`] is in this property's attribute set.
    pub fn is_derived(&self) -> bool {
        self.attributes.contains(&Attribute::Derived)
    }

    /// `true` if this property has a setter. Most derived properties don't;
    /// the rare "derived with setter" pattern (`spec.md` §4.8 step 4) does.
    pub fn is_settable(&self) -> bool {
        self.settable
    }
}

impl fmt::Debug for PropertyMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyMetadata")
            .field("name", &self.name)
            .field("value_type", &self.value_type_name)
            .field("attributes", &self.attributes)
            .field("settable", &self.settable)
            .finish()
    }
}

/// Immutable, per-`(type, method-name)` descriptor.
#[derive(Debug)]
pub struct MethodMetadata {
    name: &'static str,
    kind: MethodKind,
    attributes: Vec<Attribute>,
}

impl MethodMetadata {
    /// Declares a method named `name`.
    pub fn new(name: &'static str, kind: MethodKind, attributes: Vec<Attribute>) -> Self {
        Self { name, kind, attributes }
    }

    /// The method's declared name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this method is a query or an operation.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// The attribute set declared for this method.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}

/// The ordered set of properties and methods declared by a user type,
/// built once per type and shared by every subject of that type.
#[derive(Debug)]
pub struct TypeDescriptor {
    type_name: &'static str,
    attributes: Vec<Attribute>,
    properties: Vec<PropertyMetadata>,
    methods: Vec<MethodMetadata>,
}

impl TypeDescriptor {
    /// The declared type's name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The attribute set declared on the type itself.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// All declared properties, in declaration order.
    pub fn properties(&self) -> &[PropertyMetadata] {
        &self.properties
    }

    /// Looks up a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// All declared methods, in declaration order.
    pub fn methods(&self) -> &[MethodMetadata] {
        &self.methods
    }

    /// Looks up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodMetadata> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Incrementally builds a [`TypeDescriptor`]. A type provider (hand-written
/// or generated by `#[derive(Subject)]`) builds one of these exactly once
/// per type, usually behind a `static` guarded by [`std::sync::Once`] or
/// [`once_cell::sync::OnceCell`] — see `subjective-macros`' generated code.
#[derive(Default)]
pub struct TypeDescriptorBuilder {
    type_name: &'static str,
    attributes: Vec<Attribute>,
    properties: Vec<PropertyMetadata>,
    methods: Vec<MethodMetadata>,
}

impl TypeDescriptorBuilder {
    /// Starts building a descriptor for `type_name`.
    pub fn new(type_name: &'static str) -> Self {
        Self { type_name, ..Default::default() }
    }

    /// Adds a type-level attribute.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Declares a property.
    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    /// Declares a method.
    pub fn method(mut self, method: MethodMetadata) -> Self {
        self.methods.push(method);
        self
    }

    /// Finishes the descriptor.
    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor {
            type_name: self.type_name,
            attributes: self.attributes,
            properties: self.properties,
            methods: self.methods,
        }
    }
}

/// A process-wide cache mapping `TypeId` to a lazily built, leaked
/// `TypeDescriptor` reference, for type providers that build their
/// descriptor dynamically rather than behind a per-type `static`.
///
/// Grounded on the teacher's `topo::slot::Token` pattern of interning
/// per-`TypeId` data behind a `Lazy<Mutex<_>>`: the first caller for a
/// given `TypeId` builds and leaks the descriptor, every later caller gets
/// the same `&'static` back. `build` may run more than once under
/// contention (two threads racing the same never-before-seen type), but
/// only one result is ever kept in the cache; the loser's leaked
/// descriptor is wasted memory, bounded by the number of distinct types
/// the process ever registers — not something that happens in a steady
/// state.
#[derive(Default)]
pub struct DescriptorCache {
    inner: parking_lot::Mutex<HashMap<TypeId, &'static TypeDescriptor>>,
}

impl DescriptorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached descriptor for `ty`, building and leaking one via
    /// `build` on first use.
    pub fn get_or_build(
        &self,
        ty: TypeId,
        build: impl FnOnce() -> TypeDescriptor,
    ) -> &'static TypeDescriptor {
        if let Some(existing) = self.inner.lock().get(&ty) {
            return existing;
        }
        let built: &'static TypeDescriptor = Box::leak(Box::new(build()));
        *self.inner.lock().entry(ty).or_insert(built)
    }
}

/// Ensures an initializer runs exactly once per call site, for the common
/// case of a hand-written `type_descriptor()` backed by a `static` built
/// the first time it's asked for. Thin wrapper over [`std::sync::Once`]
/// plus a `static mut` slot, encapsulated so call sites don't need
/// `unsafe`.
pub struct OnceDescriptor {
    once: Once,
    slot: std::cell::UnsafeCell<Option<TypeDescriptor>>,
}

// SAFETY: writes to `slot` happen only inside `Once::call_once`, which
// synchronizes-with every subsequent read; `TypeDescriptor` itself is
// `Send + Sync` (it contains no interior mutability).
unsafe impl Sync for OnceDescriptor {}

impl OnceDescriptor {
    /// Creates an uninitialized slot. Intended for use in a `static`.
    pub const fn new() -> Self {
        Self { once: Once::new(), slot: std::cell::UnsafeCell::new(None) }
    }

    /// Returns the descriptor, building it with `build` on the first call.
    pub fn get_or_init(&self, build: impl FnOnce() -> TypeDescriptor) -> &TypeDescriptor {
        self.once.call_once(|| {
            // SAFETY: `call_once` guarantees this closure runs at most once
            // and happens-before every other call's return.
            unsafe {
                *self.slot.get() = Some(build());
            }
        });
        // SAFETY: the `Once` above guarantees the slot is populated by the
        // time any caller observes `call_once` having returned.
        unsafe { (*self.slot.get()).as_ref().expect("Once guarantees initialization") }
    }
}

/// A type-erased value used where equality and a value must be compared
/// across heterogeneous property types — the `last_known_value` slot on a
/// derived property, and the `old_value`/`new_value` fields of a
/// `PropertyChange`. Per the "generic vs. boxed values" design note: the
/// interception contracts stay generic to avoid boxing on the hot path,
/// but a derived property's recorded old/new values are inherently weakly
/// typed, since the engine that compares them doesn't know `T` statically.
pub struct DynValue {
    value: Box<dyn Any + Send + Sync>,
    eq: fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool,
    fmt: fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl DynValue {
    /// Wraps `value`, capturing monomorphized equality and debug-format
    /// functions for it.
    pub fn new<T>(value: T) -> Self
    where
        T: PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        fn eq_impl<T: PartialEq + 'static>(
            a: &(dyn Any + Send + Sync),
            b: &(dyn Any + Send + Sync),
        ) -> bool {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        fn fmt_impl<T: fmt::Debug + 'static>(
            value: &(dyn Any + Send + Sync),
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            fmt::Debug::fmt(value.downcast_ref::<T>().expect("type tag matches stored type"), f)
        }
        Self { value: Box::new(value), eq: eq_impl::<T>, fmt: fmt_impl::<T> }
    }

    /// Downcasts back to `T`, returning `None` if this value was wrapped
    /// as a different type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl PartialEq for DynValue {
    fn eq(&self, other: &Self) -> bool {
        (self.eq)(&*self.value, &*other.value)
    }
}

impl fmt::Debug for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.fmt)(&*self.value, f)
    }
}
