#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! Storage primitives shared by every subject in a `subjective` runtime.
//!
//! This crate holds the two pieces of shared mutable state the rest of the
//! runtime touches on every read and write:
//!
//! * [`edge_set::EdgeSet`] — a lock-free, versioned, copy-on-write set of
//!   dependency edges. The derived-property engine uses one per property to
//!   track `required_properties` and `used_by_properties`.
//! * [`data_map::DataMap`] — a type-sharded extension-data store addressed by
//!   `(property-or-none, key)`, the sole persistence point for per-subject
//!   and per-property extension state (timestamps, cached values,
//!   authorization overrides, and so on).
//!
//! Both are deliberately decoupled from any notion of "subject" or
//! "property" beyond requiring their item type be cheaply comparable —
//! storage is sharded by key the same way `dyn-cache` shards its query
//! cache by type, but the concurrency story here is lock-free rather than
//! mutex-guarded because edge sets sit on every property read and write.

pub mod data_map;
pub mod edge_set;

pub use data_map::DataKey;
pub use edge_set::EdgeSet;
