//! Subject identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A process-wide unique identifier for a subject.
///
/// Subjects are named by a stable integer rather than by a shared pointer,
/// so that the subject graph can be cyclic without anything pinning
/// anything else in memory: edges name a `SubjectId`, not an `Rc`/`Arc` to
/// the subject itself. Reference counting and detachment are explicit (see
/// [`crate::lifecycle`]) rather than derived from Rust's ownership graph,
/// matching the "stable identifiers / arena indices" rewrite note for
/// cyclic references.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubjectId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl SubjectId {
    /// Allocates a fresh id that has never been handed out before in this
    /// process.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// The canonical handle to a single property on a single subject: the pair
/// `(subject, property-name)`. Cheap to copy, safe to compare, and does
/// not own the subject it names.
///
/// This is the value stored in every [`subjective_depgraph::EdgeSet`] in
/// the runtime and the value threaded through the interception chain and
/// the dependency recorder.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PropertyReference {
    subject: SubjectId,
    property: &'static str,
}

impl PropertyReference {
    /// Builds a reference to `property` on `subject`.
    pub const fn new(subject: SubjectId, property: &'static str) -> Self {
        Self { subject, property }
    }

    /// The subject this reference names.
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// The property name this reference names.
    pub fn property(&self) -> &'static str {
        self.property
    }
}

impl fmt::Debug for PropertyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subject, self.property)
    }
}

impl fmt::Display for PropertyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Implemented by every user type that participates in the subject model,
/// by hand or via `#[derive(Subject)]` (see `subjective-macros`).
///
/// A `Subject` owns its identity and its metadata descriptor; everything
/// else (the data map, reference count, edge sets) is addressed through
/// [`SubjectId`] and lives in the runtime's shared storage rather than on
/// the subject value itself, so that the subject type stays an ordinary
/// Rust struct with no required interior mutability.
pub trait Subject: Send + Sync + 'static {
    /// This subject's stable identity.
    fn id(&self) -> SubjectId;

    /// The shared, process-wide descriptor for this subject's type.
    fn type_descriptor() -> &'static crate::metadata::TypeDescriptor
    where
        Self: Sized;

    /// This subject's current reference count: the number of distinct
    /// `(parent subject, parent property)` edges attaching it right now.
    /// Always a live read against [`crate::lifecycle`]'s table, not a value
    /// cached at attach time.
    fn ref_count(&self) -> u32 {
        crate::lifecycle::ref_count(self.id())
    }
}
