//! A runtime for observable, interceptable subject models with automatic
//! derived-property dependency tracking.
//!
//! A *subject* is an ordinary Rust value that owns a [`subject::SubjectId`]
//! and a shared [`metadata::TypeDescriptor`]. Every property read or write
//! on a subject runs through this crate's interception chain
//! ([`interceptor`]): equality-checked, passed through any
//! context-registered validators, and — for properties declared
//! `#[subjective(derived)]` — automatically tracked against the base
//! properties their getters actually read ([`recorder`], [`derived`]), so
//! that writing a base property recomputes every derived property that
//! depends on it without either side naming the other explicitly.
//!
//! See `SPEC_FULL.md` for the full algorithm narrative; this module just
//! wires the pieces together and re-exports the public surface.

pub mod change;
pub mod context;
pub mod derived;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod metadata;
pub mod recorder;
pub mod registry;
pub mod subject;
pub mod testing;
pub mod transaction;

pub use crate::change::{Broadcast, ChangeObserver, PropertyChange, QueueSubscription};
pub use crate::context::{ContextBuilder, Markers, SubjectContext};
pub use crate::derived::{DerivedPropertyData, StoreOutcome};
pub use crate::engine::{read_property, recalculate, recompute_after_derived_setter, write_depth, write_property, SubjectLink};
pub use crate::error::{Error, Result};
pub use crate::interceptor::{
    EqualityCheck, Next, ReadContext, ReadInterceptor, WriteContext, WriteInterceptor,
};
pub use crate::lifecycle::{LifecycleEvent, LifecycleHandler};
pub use crate::metadata::{
    Attribute, MethodKind, MethodMetadata, PropertyMetadata, TypeDescriptor, TypeDescriptorBuilder,
};
pub use crate::registry::SubjectHandle;
pub use crate::subject::{PropertyReference, Subject, SubjectId};

#[cfg(feature = "derive")]
pub use subjective_macros::Subject;
