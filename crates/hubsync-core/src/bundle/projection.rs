//! Projections that turn watched objects into bundle payloads.
//!
//! Each constructor returns a [`ProjectFn`] ready to hand to
//! [`ObjectBundle::new`](super::object::ObjectBundle::new).

use serde_json::json;

use super::object::{ObjectBundle, ProjectFn, Projected};
use crate::object::{Policy, ROOT_POLICY_LABEL, WatchedObject};
use crate::wire::{
    ComplianceStatus, MinimalPolicyComplianceStatus, PolicyComplianceStatus,
    PolicyCompleteComplianceStatus, StatusObject,
};

/// Root policies are the ones not stamped with a root-policy label.
fn root_policy(object: &WatchedObject) -> Option<&Policy> {
    object
        .as_policy()
        .filter(|p| p.metadata.label(ROOT_POLICY_LABEL).is_none())
}

// ---------------------------------------------------------------------------
// Generic object sync
// ---------------------------------------------------------------------------

/// Placement decisions, carried whole.
#[must_use]
pub fn placement_decisions() -> ProjectFn<StatusObject> {
    Box::new(|object| match object {
        WatchedObject::PlacementDecision(decision) => match serde_json::to_value(decision) {
            Ok(payload) => Projected::Value(StatusObject {
                id: decision.metadata.uid.clone(),
                payload,
            }),
            Err(err) => {
                tracing::warn!(uid = %decision.metadata.uid, error = %err, "placement decision not serializable");
                Projected::Ignored
            }
        },
        _ => Projected::Ignored,
    })
}

/// Policies authored on the leaf hub itself. Status is stripped; only the
/// identity and the spec fields travel.
#[must_use]
pub fn local_spec_policies() -> ProjectFn<StatusObject> {
    Box::new(|object| {
        root_policy(object).map_or(Projected::Ignored, |policy| {
            Projected::Value(StatusObject {
                id: policy.metadata.uid.clone(),
                payload: json!({
                    "name": policy.metadata.name,
                    "namespace": policy.metadata.namespace,
                    "labels": policy.metadata.labels,
                    "remediationAction": policy.remediation_action,
                }),
            })
        })
    })
}

// ---------------------------------------------------------------------------
// Compliance
// ---------------------------------------------------------------------------

/// Full per-cluster compliance lists of a root policy, each list sorted.
#[must_use]
pub fn clusters_per_policy() -> ProjectFn<PolicyComplianceStatus> {
    Box::new(|object| {
        root_policy(object).map_or(Projected::Ignored, |policy| {
            Projected::Value(policy_compliance(policy))
        })
    })
}

/// Build the full compliance status of one root policy.
#[must_use]
pub fn policy_compliance(policy: &Policy) -> PolicyComplianceStatus {
    let mut status = PolicyComplianceStatus {
        policy_id: policy.metadata.uid.clone(),
        ..PolicyComplianceStatus::default()
    };
    for entry in &policy.status.status {
        let list = match ComplianceStatus::from_policy_state(&entry.compliant) {
            ComplianceStatus::Compliant => &mut status.compliant_clusters,
            ComplianceStatus::NonCompliant => &mut status.non_compliant_clusters,
            ComplianceStatus::Unknown => &mut status.unknown_compliance_clusters,
        };
        list.push(entry.cluster_name.clone());
    }
    status.compliant_clusters.sort();
    status.non_compliant_clusters.sort();
    status.unknown_compliance_clusters.sort();
    status
}

/// Exceptions-only view of a full status.
#[must_use]
pub fn complete_view(status: &PolicyComplianceStatus) -> PolicyCompleteComplianceStatus {
    let mut applied_clusters: Vec<String> =
        status.clusters().map(|(cluster, _)| cluster.to_string()).collect();
    applied_clusters.sort();
    PolicyCompleteComplianceStatus {
        policy_id: status.policy_id.clone(),
        non_compliant_clusters: status.non_compliant_clusters.clone(),
        unknown_compliance_clusters: status.unknown_compliance_clusters.clone(),
        applied_clusters,
    }
}

/// Counts-only compliance of a root policy.
#[must_use]
pub fn minimal_compliance() -> ProjectFn<MinimalPolicyComplianceStatus> {
    Box::new(|object| {
        root_policy(object).map_or(Projected::Ignored, |policy| {
            let non_compliant = policy
                .status
                .status
                .iter()
                .filter(|s| {
                    ComplianceStatus::from_policy_state(&s.compliant)
                        == ComplianceStatus::NonCompliant
                })
                .count();
            Projected::Value(MinimalPolicyComplianceStatus {
                policy_id: policy.metadata.uid.clone(),
                remediation_action: policy.remediation_action,
                applied_clusters: saturating_u32(policy.status.status.len()),
                non_compliant_clusters: saturating_u32(non_compliant),
            })
        })
    })
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

#[must_use]
pub fn placement_decisions_bundle(
    leaf_hub_name: &str,
    incarnation: u64,
) -> ObjectBundle<StatusObject> {
    ObjectBundle::new(leaf_hub_name, incarnation, placement_decisions())
}

#[must_use]
pub fn local_spec_policies_bundle(
    leaf_hub_name: &str,
    incarnation: u64,
) -> ObjectBundle<StatusObject> {
    ObjectBundle::new(leaf_hub_name, incarnation, local_spec_policies())
}

#[must_use]
pub fn minimal_compliance_bundle(
    leaf_hub_name: &str,
    incarnation: u64,
) -> ObjectBundle<MinimalPolicyComplianceStatus> {
    ObjectBundle::new(leaf_hub_name, incarnation, minimal_compliance())
}
