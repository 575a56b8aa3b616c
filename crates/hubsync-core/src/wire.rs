//! Payload shapes shared by producers and the consumer.
//!
//! Every bundle travels as a [`BundleEnvelope`] whose `objects` are one of the
//! payload structs below. Field names are camelCase on the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::RemediationAction;
use crate::version::BundleVersion;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Logical message kind; the suffix of a transport key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Generic object sync of placement decisions.
    PlacementDecisions,
    /// Generic object sync of policies created locally on the leaf hub.
    LocalSpecPolicies,
    /// Full per-cluster compliance for every policy.
    ClustersPerPolicy,
    /// Exceptions-only compliance snapshot.
    PolicyCompleteCompliance,
    /// Cluster transitions since the last complete snapshot.
    PolicyDeltaCompliance,
    /// Counts-only compliance.
    MinimalPolicyCompliance,
    /// Deduplicated compliance history of replicated policies.
    PolicyHistoryEvents,
    /// Deduplicated compliance history of root policies.
    RootPolicyEvents,
}

/// Error returned when parsing an unknown message kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageKind {
    pub raw: String,
}

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind '{}'", self.raw)
    }
}

impl std::error::Error for UnknownMessageKind {}

impl MessageKind {
    pub const ALL: [Self; 8] = [
        Self::PlacementDecisions,
        Self::LocalSpecPolicies,
        Self::ClustersPerPolicy,
        Self::PolicyCompleteCompliance,
        Self::PolicyDeltaCompliance,
        Self::MinimalPolicyCompliance,
        Self::PolicyHistoryEvents,
        Self::RootPolicyEvents,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlacementDecisions => "PlacementDecisions",
            Self::LocalSpecPolicies => "LocalSpecPolicies",
            Self::ClustersPerPolicy => "ClustersPerPolicy",
            Self::PolicyCompleteCompliance => "PolicyCompleteCompliance",
            Self::PolicyDeltaCompliance => "PolicyDeltaCompliance",
            Self::MinimalPolicyCompliance => "MinimalPolicyCompliance",
            Self::PolicyHistoryEvents => "PolicyHistoryEvents",
            Self::RootPolicyEvents => "RootPolicyEvents",
        }
    }

    /// Transport key for this kind on a given leaf hub.
    #[must_use]
    pub fn transport_key(self, leaf_hub_name: &str) -> String {
        format!("{leaf_hub_name}.{}", self.as_str())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageKind { raw: s.to_string() })
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The serialized form of every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEnvelope<T> {
    pub objects: Vec<T>,
    pub leaf_hub_name: String,
    pub bundle_version: BundleVersion,
    /// Present only on delta bundles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_bundle_version: Option<BundleVersion>,
}

// ---------------------------------------------------------------------------
// Compliance enums
// ---------------------------------------------------------------------------

/// Stored compliance state of one cluster for one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    Unknown,
}

impl ComplianceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::NonCompliant => "non_compliant",
            Self::Unknown => "unknown",
        }
    }

    /// Map a policy framework state (`Compliant`, `NonCompliant`, anything
    /// else) onto the stored enum.
    #[must_use]
    pub fn from_policy_state(state: &str) -> Self {
        match state {
            "Compliant" => Self::Compliant,
            "NonCompliant" => Self::NonCompliant,
            _ => Self::Unknown,
        }
    }

    /// Parse the stored column value.
    #[must_use]
    pub fn from_column(raw: &str) -> Option<Self> {
        match raw {
            "compliant" => Some(Self::Compliant),
            "non_compliant" => Some(Self::NonCompliant),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity error column of a compliance row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterError {
    Disconnected,
    #[default]
    None,
}

impl ClusterError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::None => "none",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Full per-cluster compliance of one policy (clusters-per-policy and delta).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyComplianceStatus {
    pub policy_id: String,
    #[serde(default)]
    pub compliant_clusters: Vec<String>,
    #[serde(default)]
    pub non_compliant_clusters: Vec<String>,
    #[serde(default)]
    pub unknown_compliance_clusters: Vec<String>,
}

impl PolicyComplianceStatus {
    /// Iterate `(cluster, status)` over all three lists.
    pub fn clusters(&self) -> impl Iterator<Item = (&str, ComplianceStatus)> {
        tagged(&self.compliant_clusters, ComplianceStatus::Compliant)
            .chain(tagged(
                &self.non_compliant_clusters,
                ComplianceStatus::NonCompliant,
            ))
            .chain(tagged(
                &self.unknown_compliance_clusters,
                ComplianceStatus::Unknown,
            ))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compliant_clusters.is_empty()
            && self.non_compliant_clusters.is_empty()
            && self.unknown_compliance_clusters.is_empty()
    }
}

fn tagged(
    clusters: &[String],
    status: ComplianceStatus,
) -> impl Iterator<Item = (&str, ComplianceStatus)> {
    clusters.iter().map(move |c| (c.as_str(), status))
}

/// Exceptions-only compliance of one policy.
///
/// Clusters in `applied_clusters` that are not listed as non-compliant or
/// unknown are compliant by omission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCompleteComplianceStatus {
    pub policy_id: String,
    #[serde(default)]
    pub non_compliant_clusters: Vec<String>,
    #[serde(default)]
    pub unknown_compliance_clusters: Vec<String>,
    #[serde(default)]
    pub applied_clusters: Vec<String>,
}

/// Counts-only compliance of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalPolicyComplianceStatus {
    pub policy_id: String,
    #[serde(default)]
    pub remediation_action: RemediationAction,
    pub applied_clusters: u32,
    pub non_compliant_clusters: u32,
}

/// One deduplicated compliance history entry.
///
/// `cluster_id` is set on replicated-policy events and absent on root-policy
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvent {
    pub event_name: String,
    pub policy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub count: u32,
    #[serde(default)]
    pub compliance: String,
    pub created_at: DateTime<Utc>,
}

/// Raw object carried by generic object sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusObject {
    pub id: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_roundtrips_through_str() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>(), Ok(kind));
        }
        assert!("Nope".parse::<MessageKind>().is_err());
    }

    #[test]
    fn transport_key_format() {
        assert_eq!(
            MessageKind::PolicyDeltaCompliance.transport_key("hub1"),
            "hub1.PolicyDeltaCompliance"
        );
    }

    #[test]
    fn envelope_omits_base_version_unless_delta() {
        let envelope: BundleEnvelope<PolicyComplianceStatus> = BundleEnvelope {
            objects: vec![],
            leaf_hub_name: "hub1".into(),
            bundle_version: BundleVersion::new(1, 2),
            base_bundle_version: None,
        };
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert!(json.get("baseBundleVersion").is_none());
        assert_eq!(json["leafHubName"], "hub1");
        assert_eq!(json["bundleVersion"]["generation"], 2);
    }

    #[test]
    fn policy_state_mapping() {
        assert_eq!(
            ComplianceStatus::from_policy_state("Compliant"),
            ComplianceStatus::Compliant
        );
        assert_eq!(
            ComplianceStatus::from_policy_state("NonCompliant"),
            ComplianceStatus::NonCompliant
        );
        assert_eq!(
            ComplianceStatus::from_policy_state(""),
            ComplianceStatus::Unknown
        );
    }

    #[test]
    fn clusters_iterates_all_lists() {
        let status = PolicyComplianceStatus {
            policy_id: "p".into(),
            compliant_clusters: vec!["a".into()],
            non_compliant_clusters: vec!["b".into()],
            unknown_compliance_clusters: vec!["c".into()],
        };
        let all: Vec<_> = status.clusters().collect();
        assert_eq!(
            all,
            vec![
                ("a", ComplianceStatus::Compliant),
                ("b", ComplianceStatus::NonCompliant),
                ("c", ComplianceStatus::Unknown),
            ]
        );
    }
}
