//! Derived-property engine: the central algorithm coordinating the
//! recorder, the edge sets, and the interception chain to keep computed
//! properties consistent with the base properties they read.

use crate::lifecycle;
use crate::metadata::DynValue;
use crate::recorder;
use crate::registry;
use crate::subject::PropertyReference;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use subjective_depgraph::{DataKey, DataMap, EdgeSet};

const DERIVED_DATA_KEY: &str = "subjective.derived_data";

/// Per-(subject, property) bookkeeping: a property's forward edges
/// (`required_properties`, populated only if the property is itself
/// derived), backward edges (`used_by_properties`, populated for any
/// property read by some derived getter), and — for derived properties —
/// the most recently computed value.
pub struct DerivedPropertyData {
    /// The base properties this property's getter reads. Empty for
    /// non-derived properties.
    pub required_properties: EdgeSet<PropertyReference>,
    /// The derived properties that read this property.
    pub used_by_properties: EdgeSet<PropertyReference>,
    last_known_value: RwLock<Option<DynValue>>,
}

impl DerivedPropertyData {
    fn new() -> Self {
        Self {
            required_properties: EdgeSet::new(),
            used_by_properties: EdgeSet::new(),
            last_known_value: RwLock::new(None),
        }
    }

    /// Replaces the last-known value, returning the previous one.
    pub fn replace_last_known_value(&self, value: DynValue) -> Option<DynValue> {
        self.last_known_value.write().replace(value)
    }

    /// Runs `f` against the last-known value, if one has been recorded.
    pub fn with_last_known_value<R>(&self, f: impl FnOnce(&DynValue) -> R) -> Option<R> {
        self.last_known_value.read().as_ref().map(f)
    }
}

impl fmt::Debug for DerivedPropertyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedPropertyData")
            .field("required_version", &self.required_properties.version())
            .field("required_count", &self.required_properties.count())
            .field("used_by_count", &self.used_by_properties.count())
            .field("has_last_known_value", &self.last_known_value.read().is_some())
            .finish()
    }
}

/// Returns the `DerivedPropertyData` for `property` in `data_map`,
/// creating it on first use.
pub fn data_for(data_map: &DataMap, property: &'static str) -> Arc<DerivedPropertyData> {
    data_map.get_or_insert_with(DataKey::property(property, DERIVED_DATA_KEY), || {
        Arc::new(DerivedPropertyData::new())
    })
}

/// Resolves `property_ref` to its owning subject's `DerivedPropertyData`,
/// if that subject is currently attached and registered.
pub fn data_for_ref(property_ref: PropertyReference) -> Option<Arc<DerivedPropertyData>> {
    let handle = registry::lookup(property_ref.subject())?;
    Some(data_for(handle.data_map(), property_ref.property()))
}

/// The outcome of [`store_recorded`], used by callers that want to log or
/// test which path was taken.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The recorded dependencies matched the previous set; nothing changed.
    Unchanged,
    /// The exclusive-replace path ran: `required_properties` was swapped
    /// wholesale and the differences were propagated to `used_by_properties`
    /// on each affected base.
    Replaced,
    /// A concurrent writer was already mutating the same edge set; the
    /// conservative merge path ran instead.
    Merged,
}

/// Implements `spec.md` §4.8's `store_recorded`: reconciles a derived
/// property's freshly recorded dependencies against its previously stored
/// `required_properties`, updating the backward `used_by_properties` edge
/// on every affected base.
///
/// Must be called with the derived getter's recording already finished
/// (i.e. after [`crate::recorder::finish_recording`]); it does not itself
/// start or finish a recording frame, but it does release it via
/// [`crate::recorder::clear_last`] before returning.
pub fn store_recorded(
    derived: PropertyReference,
    data: &DerivedPropertyData,
    recorded: &[PropertyReference],
) -> StoreOutcome {
    let outcome = (|| {
        let (v1, previous) = data.required_properties.snapshot();
        let v2 = data.required_properties.version();
        if v1 != v2 {
            merge_path(derived, &data.required_properties, recorded);
            return StoreOutcome::Merged;
        }
        if data.required_properties.sequence_equal(recorded) {
            return StoreOutcome::Unchanged;
        }
        if !data.required_properties.try_replace(recorded, v1) {
            merge_path(derived, &data.required_properties, recorded);
            return StoreOutcome::Merged;
        }
        for base in previous.iter().filter(|b| !recorded.contains(b)) {
            if let Some(base_data) = data_for_ref(*base) {
                base_data.used_by_properties.remove(&derived);
            }
        }
        for base in recorded.iter().filter(|b| !previous.contains(b)) {
            if let Some(base_data) = data_for_ref(*base) {
                base_data.used_by_properties.add(derived);
            }
        }
        StoreOutcome::Replaced
    })();
    recorder::clear_last();
    outcome
}

/// The conservative fallback when a concurrent writer already bumped a
/// derived property's `required_properties` version: every freshly
/// recorded base gets an `add` (idempotent, wait-free, always makes
/// progress) rather than an atomic wholesale replace. This strictly
/// over-approximates dependencies until the next successful exclusive
/// `store_recorded` prunes whatever is no longer actually read.
fn merge_path(
    derived: PropertyReference,
    required: &EdgeSet<PropertyReference>,
    recorded: &[PropertyReference],
) {
    tracing::debug!(?derived, count = recorded.len(), "derived-property merge path engaged");
    for base in recorded {
        required.add(*base);
        if let Some(base_data) = data_for_ref(*base) {
            base_data.used_by_properties.add(derived);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::SubjectId;

    fn prop(subject: SubjectId, name: &'static str) -> PropertyReference {
        PropertyReference::new(subject, name)
    }

    #[test]
    fn store_recorded_is_unchanged_when_dependencies_match() {
        let subject = SubjectId::next();
        let derived = prop(subject, "FullName");
        let data = DerivedPropertyData::new();
        let first = prop(subject, "FirstName");
        data.required_properties.add(first);

        let outcome = store_recorded(derived, &data, &[first]);
        assert_eq!(outcome, StoreOutcome::Unchanged);
        assert_eq!(data.required_properties.version(), 1);
    }

    #[test]
    fn store_recorded_replaces_and_updates_backward_edges() {
        let subject = SubjectId::next();
        let base_subject = SubjectId::next();
        registry::register(base_subject, Arc::new(crate::testing::StubHandle::default()));

        let derived = prop(subject, "Display");
        let data = DerivedPropertyData::new();
        let name = prop(base_subject, "Name");
        let nick = prop(base_subject, "Nick");
        data.required_properties.add(name);

        let outcome = store_recorded(derived, &data, &[nick]);
        assert_eq!(outcome, StoreOutcome::Replaced);
        assert!(data.required_properties.contains(&nick));
        assert!(!data.required_properties.contains(&name));

        registry::unregister(base_subject);
    }

    #[test]
    fn merge_path_is_idempotent_and_over_approximates() {
        let subject = SubjectId::next();
        let derived = prop(subject, "Sum");
        let data = DerivedPropertyData::new();
        let a = prop(subject, "A");
        merge_path(derived, &data.required_properties, &[a, a]);
        assert_eq!(data.required_properties.count(), 1);
    }
}
