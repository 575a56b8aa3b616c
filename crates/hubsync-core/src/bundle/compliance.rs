//! Clusters-per-policy, complete and delta compliance bundles.
//!
//! All three views share one [`ComplianceTracker`]. The clusters-per-policy
//! bundle holds the full state. The complete view is a cut of that state
//! listing only exceptions; the delta view accumulates per-cluster
//! transitions since the last cut and names the cut's version as its base.
//!
//! A new complete is cut when none exists yet, or when the full state moved
//! and at least `delta_switch_factor` delta generations were produced since
//! the previous cut. Cutting clears the pending transitions.
//!
//! Lock order is tracker state first, then the clusters-per-policy bundle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::object::ObjectBundle;
use super::projection::{clusters_per_policy, complete_view};
use super::{Bundle, BundleError, BundleSnapshot, encode, lock};
use crate::object::WatchedObject;
use crate::version::BundleVersion;
use crate::wire::{
    BundleEnvelope, ComplianceStatus, PolicyComplianceStatus, PolicyCompleteComplianceStatus,
};

#[derive(Debug)]
struct CompleteCut {
    version: BundleVersion,
    /// Clusters-per-policy version the cut was taken from.
    source: BundleVersion,
    objects: Vec<PolicyCompleteComplianceStatus>,
}

#[derive(Debug)]
struct HybridState {
    incarnation: u64,
    cuts: u64,
    complete: Option<CompleteCut>,
    /// policy id -> cluster -> latest status since the last cut
    transitions: BTreeMap<String, BTreeMap<String, ComplianceStatus>>,
    delta_version: BundleVersion,
    delta_dirty: bool,
    deltas_since_cut: u64,
}

#[derive(Debug)]
struct Shared {
    base: ObjectBundle<PolicyComplianceStatus>,
    state: Mutex<HybridState>,
    delta_switch_factor: u64,
}

impl Shared {
    fn update(&self, object: &WatchedObject) {
        let mut state = lock(&self.state);
        let previous = self.base.get(object.uid());
        if !self.base.upsert(object) {
            return;
        }
        let Some(current) = self.base.get(object.uid()) else {
            return;
        };

        let before: BTreeMap<&str, ComplianceStatus> = previous
            .as_ref()
            .map(|p| p.clusters().collect())
            .unwrap_or_default();
        let mut changed = false;
        for (cluster, status) in current.clusters() {
            if before.get(cluster) != Some(&status) {
                state
                    .transitions
                    .entry(current.policy_id.clone())
                    .or_default()
                    .insert(cluster.to_string(), status);
                changed = true;
            }
        }
        state.delta_dirty |= changed;
    }

    fn delete(&self, object: &WatchedObject) {
        let mut state = lock(&self.state);
        let Some(previous) = self.base.get(object.uid()) else {
            return;
        };
        if self.base.remove(object) {
            state.transitions.remove(&previous.policy_id);
        }
    }

    /// Promote the base and cut a new complete when due.
    fn maybe_cut(&self, state: &mut HybridState) {
        self.base.promoted_with(|source, objects| {
            let due = state.complete.as_ref().is_none_or(|cut| {
                cut.source != source && state.deltas_since_cut >= self.delta_switch_factor
            });
            if !due {
                return;
            }
            state.cuts = state.cuts.saturating_add(1);
            let cut = CompleteCut {
                version: BundleVersion::new(state.incarnation, state.cuts),
                source,
                objects: objects.values().map(complete_view).collect(),
            };
            tracing::debug!(
                leaf_hub = %self.base.leaf_hub_name(),
                version = %cut.version,
                source = %source,
                "cut complete compliance"
            );
            state.complete = Some(cut);
            state.transitions.clear();
            state.delta_dirty = false;
            state.deltas_since_cut = 0;
        });
    }

    fn complete_snapshot(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        let mut state = lock(&self.state);
        self.maybe_cut(&mut state);
        let Some(cut) = state.complete.as_ref() else {
            return Ok(None);
        };
        if !cut.version.newer_than_opt(last_sent.as_ref()) {
            return Ok(None);
        }
        encode(&BundleEnvelope {
            objects: cut.objects.clone(),
            leaf_hub_name: self.base.leaf_hub_name().to_string(),
            bundle_version: cut.version,
            base_bundle_version: None,
        })
        .map(Some)
    }

    fn delta_snapshot(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        let mut state = lock(&self.state);
        let Some(base_version) = state.complete.as_ref().map(|cut| cut.version) else {
            return Ok(None);
        };
        if state.delta_dirty {
            state.delta_version.bump_generation();
            state.delta_dirty = false;
            state.deltas_since_cut = state.deltas_since_cut.saturating_add(1);
        }
        if state.transitions.is_empty() || !state.delta_version.newer_than_opt(last_sent.as_ref())
        {
            return Ok(None);
        }
        encode(&BundleEnvelope {
            objects: state
                .transitions
                .iter()
                .map(|(policy_id, clusters)| transitions_status(policy_id, clusters))
                .collect(),
            leaf_hub_name: self.base.leaf_hub_name().to_string(),
            bundle_version: state.delta_version,
            base_bundle_version: Some(base_version),
        })
        .map(Some)
    }
}

fn transitions_status(
    policy_id: &str,
    clusters: &BTreeMap<String, ComplianceStatus>,
) -> PolicyComplianceStatus {
    let mut status = PolicyComplianceStatus {
        policy_id: policy_id.to_string(),
        ..PolicyComplianceStatus::default()
    };
    for (cluster, state) in clusters {
        let list = match state {
            ComplianceStatus::Compliant => &mut status.compliant_clusters,
            ComplianceStatus::NonCompliant => &mut status.non_compliant_clusters,
            ComplianceStatus::Unknown => &mut status.unknown_compliance_clusters,
        };
        list.push(cluster.clone());
    }
    status
}

/// Owner of the shared compliance state; hands out the three bundle views.
#[derive(Debug, Clone)]
pub struct ComplianceTracker {
    shared: Arc<Shared>,
}

impl ComplianceTracker {
    #[must_use]
    pub fn new(leaf_hub_name: &str, incarnation: u64, delta_switch_factor: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                base: ObjectBundle::new(leaf_hub_name, incarnation, clusters_per_policy()),
                state: Mutex::new(HybridState {
                    incarnation,
                    cuts: 0,
                    complete: None,
                    transitions: BTreeMap::new(),
                    delta_version: BundleVersion::new(incarnation, 0),
                    delta_dirty: false,
                    deltas_since_cut: 0,
                }),
                delta_switch_factor,
            }),
        }
    }

    /// Full per-cluster compliance bundle.
    #[must_use]
    pub fn clusters_per_policy(&self) -> Arc<dyn Bundle> {
        Arc::new(ClustersPerPolicyView(Arc::clone(&self.shared)))
    }

    /// Exceptions-only complete bundle.
    #[must_use]
    pub fn complete(&self) -> Arc<dyn Bundle> {
        Arc::new(CompleteView(Arc::clone(&self.shared)))
    }

    /// Transitions since the last complete cut.
    #[must_use]
    pub fn delta(&self) -> Arc<dyn Bundle> {
        Arc::new(DeltaView(Arc::clone(&self.shared)))
    }

    /// Feed a watched object to all three views.
    pub fn update_object(&self, object: &WatchedObject) {
        self.shared.update(object);
    }

    pub fn delete_object(&self, object: &WatchedObject) {
        self.shared.delete(object);
    }
}

// Each view forwards mutations to the shared state. A second delivery of the
// same object through another view projects identically and is a no-op.

struct ClustersPerPolicyView(Arc<Shared>);
struct CompleteView(Arc<Shared>);
struct DeltaView(Arc<Shared>);

impl Bundle for ClustersPerPolicyView {
    fn update_object(&self, object: &WatchedObject) {
        self.0.update(object);
    }

    fn delete_object(&self, object: &WatchedObject) {
        self.0.delete(object);
    }

    fn bundle_version(&self) -> BundleVersion {
        self.0.base.bundle_version()
    }

    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        let _state = lock(&self.0.state);
        self.0.base.snapshot_since(last_sent)
    }
}

impl Bundle for CompleteView {
    fn update_object(&self, object: &WatchedObject) {
        self.0.update(object);
    }

    fn delete_object(&self, object: &WatchedObject) {
        self.0.delete(object);
    }

    fn bundle_version(&self) -> BundleVersion {
        lock(&self.0.state)
            .complete
            .as_ref()
            .map_or_else(BundleVersion::default, |cut| cut.version)
    }

    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        self.0.complete_snapshot(last_sent)
    }
}

impl Bundle for DeltaView {
    fn update_object(&self, object: &WatchedObject) {
        self.0.update(object);
    }

    fn delete_object(&self, object: &WatchedObject) {
        self.0.delete(object);
    }

    fn bundle_version(&self) -> BundleVersion {
        lock(&self.0.state).delta_version
    }

    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        self.0.delta_snapshot(last_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClusterComplianceStatus, ObjectMeta, Policy, PolicyStatus};

    fn policy(uid: &str, states: &[(&str, &str)]) -> WatchedObject {
        WatchedObject::Policy(Policy {
            metadata: ObjectMeta {
                uid: uid.into(),
                name: uid.into(),
                ..ObjectMeta::default()
            },
            status: PolicyStatus {
                status: states
                    .iter()
                    .map(|(c, s)| ClusterComplianceStatus {
                        cluster_name: (*c).into(),
                        compliant: (*s).into(),
                    })
                    .collect(),
                details: None,
            },
            ..Policy::default()
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(snapshot: &BundleSnapshot) -> BundleEnvelope<T> {
        serde_json::from_slice(&snapshot.payload).expect("decode")
    }

    #[test]
    fn first_complete_lists_exceptions_only() {
        let tracker = ComplianceTracker::new("hub1", 1, 3);
        tracker.update_object(&policy(
            "p1",
            &[("c1", "Compliant"), ("c2", "NonCompliant"), ("c3", "")],
        ));

        let snapshot = tracker
            .complete()
            .snapshot_since(None)
            .expect("encode")
            .expect("complete");
        let envelope: BundleEnvelope<PolicyCompleteComplianceStatus> = decode(&snapshot);
        assert_eq!(envelope.bundle_version, BundleVersion::new(1, 1));
        let p1 = &envelope.objects[0];
        assert_eq!(p1.non_compliant_clusters, vec!["c2"]);
        assert_eq!(p1.unknown_compliance_clusters, vec!["c3"]);
        assert_eq!(p1.applied_clusters, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn no_delta_before_first_cut() {
        let tracker = ComplianceTracker::new("hub1", 1, 3);
        tracker.update_object(&policy("p1", &[("c1", "Compliant")]));
        assert!(
            tracker
                .delta()
                .snapshot_since(None)
                .expect("encode")
                .is_none()
        );
    }

    #[test]
    fn delta_carries_cumulative_transitions_and_base() {
        let tracker = ComplianceTracker::new("hub1", 1, 10);
        let complete = tracker.complete();
        let delta = tracker.delta();

        tracker.update_object(&policy("p1", &[("c1", "Compliant"), ("c2", "Compliant")]));
        let cut = complete
            .snapshot_since(None)
            .expect("encode")
            .expect("complete");

        tracker.update_object(&policy("p1", &[("c1", "NonCompliant"), ("c2", "Compliant")]));
        let first = delta.snapshot_since(None).expect("encode").expect("delta");
        let envelope: BundleEnvelope<PolicyComplianceStatus> = decode(&first);
        assert_eq!(envelope.base_bundle_version, Some(cut.version));
        assert_eq!(envelope.objects[0].non_compliant_clusters, vec!["c1"]);
        assert!(envelope.objects[0].compliant_clusters.is_empty());

        tracker.update_object(&policy("p1", &[("c1", "NonCompliant"), ("c2", "")]));
        let second = delta
            .snapshot_since(Some(first.version))
            .expect("encode")
            .expect("delta");
        let envelope: BundleEnvelope<PolicyComplianceStatus> = decode(&second);
        assert!(second.version.newer_than(&first.version));
        assert_eq!(envelope.objects[0].non_compliant_clusters, vec!["c1"]);
        assert_eq!(envelope.objects[0].unknown_compliance_clusters, vec!["c2"]);

        // Without further transitions nothing new is produced.
        assert!(
            delta
                .snapshot_since(Some(second.version))
                .expect("encode")
                .is_none()
        );
    }

    #[test]
    fn switch_factor_triggers_new_cut() {
        let tracker = ComplianceTracker::new("hub1", 1, 2);
        let complete = tracker.complete();
        let delta = tracker.delta();

        tracker.update_object(&policy("p1", &[("c1", "Compliant")]));
        let first_cut = complete.snapshot_since(None).expect("encode").expect("cut");

        let mut last_delta = None;
        for state in ["NonCompliant", "Compliant"] {
            tracker.update_object(&policy("p1", &[("c1", state)]));
            assert!(
                complete
                    .snapshot_since(Some(first_cut.version))
                    .expect("encode")
                    .is_none()
            );
            last_delta = delta.snapshot_since(last_delta).expect("encode").map(|s| s.version);
        }

        tracker.update_object(&policy("p1", &[("c1", "NonCompliant")]));
        let second_cut = complete
            .snapshot_since(Some(first_cut.version))
            .expect("encode")
            .expect("second cut");
        assert_eq!(second_cut.version, BundleVersion::new(1, 2));

        // The cut absorbed pending transitions.
        assert!(delta.snapshot_since(last_delta).expect("encode").is_none());
    }

    #[test]
    fn views_share_mutations_without_double_counting() {
        let tracker = ComplianceTracker::new("hub1", 1, 3);
        let cpp = tracker.clusters_per_policy();
        let object = policy("p1", &[("c1", "Compliant")]);
        cpp.update_object(&object);
        tracker.complete().update_object(&object);
        tracker.delta().update_object(&object);

        let snapshot = cpp.snapshot_since(None).expect("encode").expect("cpp");
        assert_eq!(snapshot.version, BundleVersion::new(1, 1));
    }

    #[test]
    fn delete_drops_pending_transitions() {
        let tracker = ComplianceTracker::new("hub1", 1, 3);
        let object = policy("p1", &[("c1", "Compliant")]);
        tracker.update_object(&object);
        tracker.complete().snapshot_since(None).expect("encode");

        tracker.update_object(&policy("p1", &[("c1", "NonCompliant")]));
        tracker.delete_object(&object);
        assert!(
            tracker
                .delta()
                .snapshot_since(None)
                .expect("encode")
                .is_none()
        );
    }
}
