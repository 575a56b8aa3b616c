//! Generic keyed status bundle.
//!
//! [`ObjectBundle`] stores one projected payload per object UID. A projection
//! function turns the watched object into the payload; when the projection is
//! unchanged the update is a no-op, so repeated watch deliveries never bump
//! the generation.
//!
//! Mutations record each touched UID's projection as of the last promotion.
//! The generation is promoted once per dispatch tick, and only when some
//! touched entry differs from that recorded value, so a change that is
//! undone within the same tick is not a mutation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use super::{Bundle, BundleError, BundleSnapshot, encode, lock};
use crate::object::WatchedObject;
use crate::version::BundleVersion;
use crate::wire::BundleEnvelope;

/// Outcome of projecting a watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projected<P> {
    /// Not an object this bundle reports on.
    Ignored,
    /// A required external lookup failed; leave prior state untouched.
    Unavailable,
    /// The object's current projection.
    Value(P),
}

/// Projection from a watched object onto a bundle payload.
pub type ProjectFn<P> = Box<dyn Fn(&WatchedObject) -> Projected<P> + Send + Sync>;

#[derive(Debug)]
pub(crate) struct ObjectBundleState<P> {
    objects: BTreeMap<String, P>,
    version: BundleVersion,
    /// uid -> projection at the last promotion, for every uid touched since.
    touched: BTreeMap<String, Option<P>>,
}

impl<P: Clone + PartialEq> ObjectBundleState<P> {
    fn touch(&mut self, uid: &str) {
        let Self {
            objects, touched, ..
        } = self;
        touched
            .entry(uid.to_string())
            .or_insert_with(|| objects.get(uid).cloned());
    }

    fn has_net_change(&self) -> bool {
        self.touched
            .iter()
            .any(|(uid, prior)| self.objects.get(uid) != prior.as_ref())
    }
}

/// Keyed collection of projected objects for one leaf hub.
pub struct ObjectBundle<P> {
    leaf_hub_name: String,
    project: ProjectFn<P>,
    state: Mutex<ObjectBundleState<P>>,
}

impl<P> std::fmt::Debug for ObjectBundle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBundle")
            .field("leaf_hub_name", &self.leaf_hub_name)
            .finish_non_exhaustive()
    }
}

impl<P> ObjectBundle<P>
where
    P: Clone + PartialEq + Serialize + Send,
{
    /// Create an empty bundle at generation 0 of `incarnation`.
    #[must_use]
    pub fn new(leaf_hub_name: impl Into<String>, incarnation: u64, project: ProjectFn<P>) -> Self {
        Self {
            leaf_hub_name: leaf_hub_name.into(),
            project,
            state: Mutex::new(ObjectBundleState {
                objects: BTreeMap::new(),
                version: BundleVersion::new(incarnation, 0),
                touched: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn leaf_hub_name(&self) -> &str {
        &self.leaf_hub_name
    }

    /// Upsert the object's projection. Returns `true` if the stored entry
    /// changed.
    pub fn upsert(&self, object: &WatchedObject) -> bool {
        let mut state = lock(&self.state);
        let value = match (self.project)(object) {
            Projected::Value(value) => value,
            Projected::Ignored => return false,
            Projected::Unavailable => {
                tracing::debug!(
                    leaf_hub = %self.leaf_hub_name,
                    uid = object.uid(),
                    "projection unavailable, keeping prior state"
                );
                return false;
            }
        };

        if state.objects.get(object.uid()) == Some(&value) {
            return false;
        }
        state.touch(object.uid());
        state.objects.insert(object.uid().to_string(), value);
        true
    }

    /// Remove the object's entry. Returns `true` if an entry was removed.
    pub fn remove(&self, object: &WatchedObject) -> bool {
        let mut state = lock(&self.state);
        if !state.objects.contains_key(object.uid()) {
            return false;
        }
        state.touch(object.uid());
        state.objects.remove(object.uid());
        true
    }

    /// Stored projection for `uid`.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<P> {
        lock(&self.state).objects.get(uid).cloned()
    }

    /// Whether a net mutation is waiting for the next tick.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        lock(&self.state).has_net_change()
    }

    /// Promote a pending mutation into a new generation and return the
    /// resulting version.
    pub fn promote(&self) -> BundleVersion {
        let mut state = lock(&self.state);
        promote_state(&mut state)
    }

    /// Promote, then run `f` over the stored objects under the same lock.
    pub(crate) fn promoted_with<R>(
        &self,
        f: impl FnOnce(BundleVersion, &BTreeMap<String, P>) -> R,
    ) -> R {
        let mut state = lock(&self.state);
        let version = promote_state(&mut state);
        f(version, &state.objects)
    }

    /// Current envelope without promoting.
    #[must_use]
    pub fn envelope(&self) -> BundleEnvelope<P> {
        let state = lock(&self.state);
        BundleEnvelope {
            objects: state.objects.values().cloned().collect(),
            leaf_hub_name: self.leaf_hub_name.clone(),
            bundle_version: state.version,
            base_bundle_version: None,
        }
    }
}

fn promote_state<P: Clone + PartialEq>(state: &mut ObjectBundleState<P>) -> BundleVersion {
    if state.has_net_change() {
        state.version.bump_generation();
    }
    state.touched.clear();
    state.version
}

impl<P> Bundle for ObjectBundle<P>
where
    P: Clone + PartialEq + Serialize + Send,
{
    fn update_object(&self, object: &WatchedObject) {
        self.upsert(object);
    }

    fn delete_object(&self, object: &WatchedObject) {
        self.remove(object);
    }

    fn bundle_version(&self) -> BundleVersion {
        lock(&self.state).version
    }

    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        let leaf_hub_name = self.leaf_hub_name.clone();
        self.promoted_with(|version, objects| {
            if !version.newer_than_opt(last_sent.as_ref()) {
                return Ok(None);
            }
            encode(&BundleEnvelope {
                objects: objects.values().cloned().collect(),
                leaf_hub_name,
                bundle_version: version,
                base_bundle_version: None,
            })
            .map(Some)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectMeta, PlacementDecision, Policy};

    fn decision(uid: &str, clusters: &[&str]) -> WatchedObject {
        WatchedObject::PlacementDecision(PlacementDecision {
            metadata: ObjectMeta {
                uid: uid.into(),
                name: format!("pd-{uid}"),
                ..ObjectMeta::default()
            },
            decisions: clusters
                .iter()
                .map(|c| crate::object::ClusterDecision {
                    cluster_name: (*c).into(),
                    reason: String::new(),
                })
                .collect(),
        })
    }

    fn cluster_list_bundle() -> ObjectBundle<Vec<String>> {
        ObjectBundle::new(
            "hub1",
            3,
            Box::new(|object| match object {
                WatchedObject::PlacementDecision(d) => Projected::Value(
                    d.decisions.iter().map(|c| c.cluster_name.clone()).collect(),
                ),
                _ => Projected::Ignored,
            }),
        )
    }

    #[test]
    fn starts_at_generation_zero() {
        let bundle = cluster_list_bundle();
        assert_eq!(bundle.bundle_version(), BundleVersion::new(3, 0));
        assert!(!bundle.is_dirty());
    }

    #[test]
    fn generation_promoted_once_per_tick() {
        let bundle = cluster_list_bundle();
        bundle.update_object(&decision("a", &["c1"]));
        bundle.update_object(&decision("b", &["c2"]));
        bundle.update_object(&decision("a", &["c1", "c3"]));

        // Version is not promoted by mutations alone.
        assert_eq!(bundle.bundle_version().generation, 0);
        assert_eq!(bundle.promote().generation, 1);
        assert_eq!(bundle.promote().generation, 1);
    }

    #[test]
    fn unchanged_projection_is_not_a_mutation() {
        let bundle = cluster_list_bundle();
        assert!(bundle.upsert(&decision("a", &["c1"])));
        bundle.promote();
        assert!(!bundle.upsert(&decision("a", &["c1"])));
        assert!(!bundle.is_dirty());
        assert_eq!(bundle.promote().generation, 1);
    }

    #[test]
    fn change_undone_within_a_tick_is_not_a_mutation() {
        let bundle = cluster_list_bundle();
        bundle.upsert(&decision("a", &["c1"]));
        let first = bundle.promote();
        assert_eq!(first.generation, 1);

        assert!(bundle.upsert(&decision("a", &["c2"])));
        assert!(bundle.is_dirty());
        assert!(bundle.upsert(&decision("a", &["c1"])));
        assert!(!bundle.is_dirty());
        assert_eq!(bundle.promote(), first);
        assert!(bundle.snapshot_since(Some(first)).expect("encode").is_none());

        // Delete then re-add with the same projection.
        assert!(bundle.remove(&decision("a", &[])));
        assert!(bundle.upsert(&decision("a", &["c1"])));
        assert_eq!(bundle.promote(), first);

        // Add then delete an object that did not exist at the last promotion.
        bundle.upsert(&decision("b", &["c3"]));
        bundle.remove(&decision("b", &[]));
        assert_eq!(bundle.promote(), first);
    }

    #[test]
    fn touched_values_reset_at_promotion() {
        let bundle = cluster_list_bundle();
        bundle.upsert(&decision("a", &["c1"]));
        bundle.promote();
        bundle.upsert(&decision("a", &["c2"]));
        assert_eq!(bundle.promote().generation, 2);

        // Returning to the value of two ticks ago is a change relative to the last one.
        bundle.upsert(&decision("a", &["c1"]));
        assert_eq!(bundle.promote().generation, 3);
    }

    #[test]
    fn ignored_and_unavailable_leave_state() {
        let bundle = ObjectBundle::<String>::new(
            "hub1",
            1,
            Box::new(|object| match object {
                WatchedObject::Policy(_) => Projected::Unavailable,
                _ => Projected::Ignored,
            }),
        );
        let policy = WatchedObject::Policy(Policy::default());
        assert!(!bundle.upsert(&policy));
        assert!(!bundle.upsert(&decision("a", &[])));
        assert!(!bundle.is_dirty());
    }

    #[test]
    fn delete_marks_dirty_only_when_present() {
        let bundle = cluster_list_bundle();
        assert!(!bundle.remove(&decision("ghost", &[])));
        assert!(!bundle.is_dirty());

        bundle.upsert(&decision("a", &["c1"]));
        bundle.promote();
        assert!(bundle.remove(&decision("a", &[])));
        assert_eq!(bundle.promote().generation, 2);
        assert!(bundle.get("a").is_none());
    }

    #[test]
    fn snapshot_since_skips_already_sent_versions() {
        let bundle = cluster_list_bundle();
        bundle.upsert(&decision("a", &["c1"]));

        let first = bundle
            .snapshot_since(None)
            .expect("encode")
            .expect("first snapshot");
        assert_eq!(first.version, BundleVersion::new(3, 1));
        assert!(
            bundle
                .snapshot_since(Some(first.version))
                .expect("encode")
                .is_none()
        );

        let envelope: BundleEnvelope<Vec<String>> =
            serde_json::from_slice(&first.payload).expect("decode");
        assert_eq!(envelope.objects, vec![vec!["c1".to_string()]]);
        assert_eq!(envelope.leaf_hub_name, "hub1");
    }
}
