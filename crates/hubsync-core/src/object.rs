//! Objects handed to bundles by the watch collaborator.
//!
//! The watch side deals in many object kinds; bundles are each closed over a
//! single payload shape. [`WatchedObject`] is the tagged union at that
//! boundary, and every bundle picks out the variant it understands.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label on a replicated policy naming its root policy (`namespace.name`).
pub const ROOT_POLICY_LABEL: &str = "policy.open-cluster-management.io/root-policy";
/// Label on a replicated policy naming the managed cluster it targets.
pub const CLUSTER_NAME_LABEL: &str = "policy.open-cluster-management.io/cluster-name";

/// Identity and labels shared by all watched objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Stable object UID, the identity key inside bundles.
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A governance policy as observed on a leaf hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub remediation_action: RemediationAction,
    #[serde(default)]
    pub status: PolicyStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    #[default]
    Inform,
    Enforce,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatus {
    /// Per-cluster compliance, populated on root policies.
    #[serde(default)]
    pub status: Vec<ClusterComplianceStatus>,
    /// Template details with compliance history, populated on replicated policies.
    #[serde(default)]
    pub details: Option<Vec<DetailStatus>>,
}

/// One cluster's compliance as reported in a root policy status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterComplianceStatus {
    pub cluster_name: String,
    /// Free-form state as written by the policy framework (`Compliant`,
    /// `NonCompliant`, or empty while pending).
    #[serde(default)]
    pub compliant: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailStatus {
    #[serde(default)]
    pub compliance_state: String,
    #[serde(default)]
    pub history: Option<Vec<ComplianceHistory>>,
}

/// One entry of a template's compliance history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceHistory {
    pub event_name: String,
    pub last_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// Placement decision: which clusters a placement selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub decisions: Vec<ClusterDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDecision {
    pub cluster_name: String,
    #[serde(default)]
    pub reason: String,
}

/// Any other object, carried as raw JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstructuredObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Tagged union of everything the watch side can hand a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WatchedObject {
    Policy(Policy),
    PlacementDecision(PlacementDecision),
    Unstructured(UnstructuredObject),
}

impl WatchedObject {
    #[must_use]
    pub const fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Policy(p) => &p.metadata,
            Self::PlacementDecision(d) => &d.metadata,
            Self::Unstructured(u) => &u.metadata,
        }
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.meta().uid
    }

    #[must_use]
    pub const fn as_policy(&self) -> Option<&Policy> {
        match self {
            Self::Policy(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Policy(_) => "Policy",
            Self::PlacementDecision(_) => "PlacementDecision",
            Self::Unstructured(u) => u.kind.as_str(),
        }
    }
}
