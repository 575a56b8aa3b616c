//! Bundle → SQLite merge engine.
//!
//! The [`MergeEngine`] applies one decoded [`StatusBundle`] inside one
//! `BEGIN IMMEDIATE` transaction: read the scope version, decide, write rows,
//! write the new scope version, commit. A scope is `(leaf hub, message kind)`.
//!
//! # Staleness
//!
//! A bundle is applied only when its version is strictly newer than the
//! scope's stored version. Redelivery of the same version is therefore
//! dropped, and the store ends up exactly as after the first delivery.
//!
//! # Delta base
//!
//! A delta is applied only when the stored complete version of the same hub
//! equals its `base_bundle_version`. Deltas that arrive before their base, or
//! after a newer complete, are dropped and wait for the next complete.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};

use crate::db::{Store, now_us};
use crate::error::ErrorCode;
use crate::version::BundleVersion;
use crate::wire::{
    BundleEnvelope, ClusterError, ComplianceStatus, MessageKind, MinimalPolicyComplianceStatus,
    PolicyComplianceStatus, PolicyCompleteComplianceStatus, PolicyEvent, StatusObject,
};

// ---------------------------------------------------------------------------
// Decoded bundles
// ---------------------------------------------------------------------------

/// A decoded status bundle, ready to merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusBundle {
    ClustersPerPolicy(BundleEnvelope<PolicyComplianceStatus>),
    Complete(BundleEnvelope<PolicyCompleteComplianceStatus>),
    Delta(BundleEnvelope<PolicyComplianceStatus>),
    Minimal(BundleEnvelope<MinimalPolicyComplianceStatus>),
    PolicyEvents(BundleEnvelope<PolicyEvent>),
    RootPolicyEvents(BundleEnvelope<PolicyEvent>),
    /// Generic object sync; `kind` names the scope.
    Objects {
        kind: MessageKind,
        envelope: BundleEnvelope<StatusObject>,
    },
}

impl StatusBundle {
    /// Decode a payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the payload does not match the kind's shape.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::ClustersPerPolicy => Self::ClustersPerPolicy(serde_json::from_slice(payload)?),
            MessageKind::PolicyCompleteCompliance => Self::Complete(serde_json::from_slice(payload)?),
            MessageKind::PolicyDeltaCompliance => Self::Delta(serde_json::from_slice(payload)?),
            MessageKind::MinimalPolicyCompliance => Self::Minimal(serde_json::from_slice(payload)?),
            MessageKind::PolicyHistoryEvents => Self::PolicyEvents(serde_json::from_slice(payload)?),
            MessageKind::RootPolicyEvents => Self::RootPolicyEvents(serde_json::from_slice(payload)?),
            MessageKind::PlacementDecisions | MessageKind::LocalSpecPolicies => Self::Objects {
                kind,
                envelope: serde_json::from_slice(payload)?,
            },
        })
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::ClustersPerPolicy(_) => MessageKind::ClustersPerPolicy,
            Self::Complete(_) => MessageKind::PolicyCompleteCompliance,
            Self::Delta(_) => MessageKind::PolicyDeltaCompliance,
            Self::Minimal(_) => MessageKind::MinimalPolicyCompliance,
            Self::PolicyEvents(_) => MessageKind::PolicyHistoryEvents,
            Self::RootPolicyEvents(_) => MessageKind::RootPolicyEvents,
            Self::Objects { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn leaf_hub_name(&self) -> &str {
        match self {
            Self::ClustersPerPolicy(e) | Self::Delta(e) => &e.leaf_hub_name,
            Self::Complete(e) => &e.leaf_hub_name,
            Self::Minimal(e) => &e.leaf_hub_name,
            Self::PolicyEvents(e) | Self::RootPolicyEvents(e) => &e.leaf_hub_name,
            Self::Objects { envelope, .. } => &envelope.leaf_hub_name,
        }
    }

    #[must_use]
    pub const fn version(&self) -> BundleVersion {
        match self {
            Self::ClustersPerPolicy(e) | Self::Delta(e) => e.bundle_version,
            Self::Complete(e) => e.bundle_version,
            Self::Minimal(e) => e.bundle_version,
            Self::PolicyEvents(e) | Self::RootPolicyEvents(e) => e.bundle_version,
            Self::Objects { envelope, .. } => envelope.bundle_version,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// What happened to one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Rows were written and the scope version advanced.
    Applied { rows: usize },
    /// Not newer than the stored scope version; storage unchanged.
    Stale {
        incoming: BundleVersion,
        stored: BundleVersion,
    },
    /// Delta base does not match the stored complete; storage unchanged.
    BaseMismatch {
        expected: Option<BundleVersion>,
        stored: Option<BundleVersion>,
    },
}

impl ApplyOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Errors raised while merging a bundle.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("store error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("failed to encode status object payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MergeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(_) => ErrorCode::StorageWriteFailed,
            Self::Encode(_) => ErrorCode::PayloadEncodeFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// MergeEngine
// ---------------------------------------------------------------------------

/// Applies decoded bundles to the store tables.
pub struct MergeEngine<'conn> {
    conn: &'conn Connection,
}

impl<'conn> MergeEngine<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Apply one bundle atomically.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError`] if any statement fails; the transaction is
    /// rolled back and the scope version is left untouched.
    pub fn apply(&self, bundle: &StatusBundle) -> Result<ApplyOutcome, MergeError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match self.apply_inner(bundle) {
            Ok(outcome) => {
                self.conn.execute_batch("COMMIT")?;
                log_outcome(bundle, outcome);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "rollback after failed merge");
                }
                Err(err)
            }
        }
    }

    fn apply_inner(&self, bundle: &StatusBundle) -> Result<ApplyOutcome, MergeError> {
        let hub = bundle.leaf_hub_name();
        let kind = bundle.kind();
        let incoming = bundle.version();

        if let StatusBundle::Delta(envelope) = bundle {
            let stored_complete = self.stored_version(hub, MessageKind::PolicyCompleteCompliance)?;
            if envelope.base_bundle_version.is_none()
                || stored_complete != envelope.base_bundle_version
            {
                return Ok(ApplyOutcome::BaseMismatch {
                    expected: envelope.base_bundle_version,
                    stored: stored_complete,
                });
            }
        }

        if let Some(stored) = self.stored_version(hub, kind)? {
            if !incoming.newer_than(&stored) {
                return Ok(ApplyOutcome::Stale { incoming, stored });
            }
        }

        let rows = match bundle {
            StatusBundle::ClustersPerPolicy(e) => self.apply_clusters_per_policy(e)?,
            StatusBundle::Complete(e) => self.apply_complete(e)?,
            StatusBundle::Delta(e) => self.apply_delta(e)?,
            StatusBundle::Minimal(e) => self.apply_minimal(e)?,
            StatusBundle::PolicyEvents(e) => self.apply_policy_events(e)?,
            StatusBundle::RootPolicyEvents(e) => self.apply_root_policy_events(e)?,
            StatusBundle::Objects { kind, envelope } => self.apply_objects(*kind, envelope)?,
        };
        self.record_version(hub, kind, incoming)?;
        Ok(ApplyOutcome::Applied { rows })
    }

    // -----------------------------------------------------------------------
    // Scope versions
    // -----------------------------------------------------------------------

    fn stored_version(
        &self,
        hub: &str,
        kind: MessageKind,
    ) -> rusqlite::Result<Option<BundleVersion>> {
        stored_version(self.conn, hub, kind)
    }

    fn record_version(
        &self,
        hub: &str,
        kind: MessageKind,
        version: BundleVersion,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO bundle_versions (leaf_hub_name, message_kind, incarnation, generation, applied_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(leaf_hub_name, message_kind) DO UPDATE SET
                incarnation = excluded.incarnation,
                generation = excluded.generation,
                applied_at_us = excluded.applied_at_us",
            params![
                hub,
                kind.as_str(),
                to_sql(version.incarnation)?,
                to_sql(version.generation)?,
                now_us()
            ],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compliance
    // -----------------------------------------------------------------------

    fn upsert_compliance(
        &self,
        policy_id: &str,
        cluster: &str,
        hub: &str,
        status: ComplianceStatus,
    ) -> rusqlite::Result<usize> {
        self.conn.execute(
            "INSERT INTO compliance (policy_id, cluster_name, leaf_hub_name, compliance, error, updated_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(policy_id, cluster_name, leaf_hub_name) DO UPDATE SET
                compliance = excluded.compliance,
                updated_at_us = excluded.updated_at_us",
            params![
                policy_id,
                cluster,
                hub,
                status.as_str(),
                ClusterError::None.as_str(),
                now_us()
            ],
        )
    }

    fn stored_clusters(&self, policy_id: &str, hub: &str) -> rusqlite::Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT cluster_name FROM compliance WHERE policy_id = ?1 AND leaf_hub_name = ?2",
        )?;
        let rows = stmt.query_map(params![policy_id, hub], |row| row.get(0))?;
        rows.collect()
    }

    fn stored_policies(&self, hub: &str) -> rusqlite::Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT policy_id FROM compliance WHERE leaf_hub_name = ?1")?;
        let rows = stmt.query_map(params![hub], |row| row.get(0))?;
        rows.collect()
    }

    /// Full statement of the hub's compliance: listed rows are upserted,
    /// everything else of the hub is deleted.
    fn apply_clusters_per_policy(
        &self,
        envelope: &BundleEnvelope<PolicyComplianceStatus>,
    ) -> rusqlite::Result<usize> {
        let hub = envelope.leaf_hub_name.as_str();
        let mut rows = 0;
        let mut listed_policies = BTreeSet::new();

        for policy in &envelope.objects {
            listed_policies.insert(policy.policy_id.as_str());
            let mut listed = BTreeSet::new();
            for (cluster, status) in policy.clusters() {
                listed.insert(cluster);
                rows += self.upsert_compliance(&policy.policy_id, cluster, hub, status)?;
            }
            for stale in self.stored_clusters(&policy.policy_id, hub)? {
                if !listed.contains(stale.as_str()) {
                    rows += self.conn.execute(
                        "DELETE FROM compliance WHERE policy_id = ?1 AND cluster_name = ?2 AND leaf_hub_name = ?3",
                        params![policy.policy_id, stale, hub],
                    )?;
                }
            }
        }

        for stale in self.stored_policies(hub)? {
            if !listed_policies.contains(stale.as_str()) {
                rows += self.conn.execute(
                    "DELETE FROM compliance WHERE policy_id = ?1 AND leaf_hub_name = ?2",
                    params![stale, hub],
                )?;
            }
        }
        Ok(rows)
    }

    /// Exceptions-only snapshot: every in-scope cluster not listed is
    /// compliant. In scope means applied, listed, or already stored.
    fn apply_complete(
        &self,
        envelope: &BundleEnvelope<PolicyCompleteComplianceStatus>,
    ) -> rusqlite::Result<usize> {
        let hub = envelope.leaf_hub_name.as_str();
        let mut rows = 0;

        for policy in &envelope.objects {
            let non_compliant: BTreeSet<&str> =
                policy.non_compliant_clusters.iter().map(String::as_str).collect();
            let unknown: BTreeSet<&str> = policy
                .unknown_compliance_clusters
                .iter()
                .map(String::as_str)
                .collect();

            let stored = self.stored_clusters(&policy.policy_id, hub)?;
            let scope: BTreeSet<&str> = policy
                .applied_clusters
                .iter()
                .map(String::as_str)
                .chain(non_compliant.iter().copied())
                .chain(unknown.iter().copied())
                .chain(stored.iter().map(String::as_str))
                .collect();

            for cluster in scope {
                let status = if non_compliant.contains(cluster) {
                    ComplianceStatus::NonCompliant
                } else if unknown.contains(cluster) {
                    ComplianceStatus::Unknown
                } else {
                    ComplianceStatus::Compliant
                };
                rows += self.upsert_compliance(&policy.policy_id, cluster, hub, status)?;
            }
        }
        Ok(rows)
    }

    /// Listed clusters only; unlisted rows keep their value.
    fn apply_delta(
        &self,
        envelope: &BundleEnvelope<PolicyComplianceStatus>,
    ) -> rusqlite::Result<usize> {
        let hub = envelope.leaf_hub_name.as_str();
        let mut rows = 0;
        for policy in &envelope.objects {
            for (cluster, status) in policy.clusters() {
                rows += self.upsert_compliance(&policy.policy_id, cluster, hub, status)?;
            }
        }
        Ok(rows)
    }

    fn apply_minimal(
        &self,
        envelope: &BundleEnvelope<MinimalPolicyComplianceStatus>,
    ) -> Result<usize, MergeError> {
        let mut rows = 0;
        for policy in &envelope.objects {
            let remediation = serde_json::to_value(policy.remediation_action)?;
            rows += self.conn.execute(
                "INSERT INTO aggregated_compliance
                    (policy_id, leaf_hub_name, remediation_action, applied_clusters, non_compliant_clusters, updated_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(policy_id, leaf_hub_name) DO UPDATE SET
                    remediation_action = excluded.remediation_action,
                    applied_clusters = excluded.applied_clusters,
                    non_compliant_clusters = excluded.non_compliant_clusters,
                    updated_at_us = excluded.updated_at_us",
                params![
                    policy.policy_id,
                    envelope.leaf_hub_name,
                    remediation.as_str().unwrap_or("inform"),
                    policy.applied_clusters,
                    policy.non_compliant_clusters,
                    now_us()
                ],
            )?;
        }
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn apply_policy_events(&self, envelope: &BundleEnvelope<PolicyEvent>) -> rusqlite::Result<usize> {
        let mut rows = 0;
        for event in &envelope.objects {
            let Some(cluster_id) = event.cluster_id.as_deref() else {
                tracing::warn!(
                    leaf_hub = %envelope.leaf_hub_name,
                    event = %event.event_name,
                    "cluster policy event without cluster id"
                );
                continue;
            };
            // SQLite evaluates every SET expression against the old row.
            rows += self.conn.execute(
                "INSERT INTO local_policy_events
                    (event_name, policy_id, cluster_id, leaf_hub_name, message, reason, count, compliance, created_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(event_name, policy_id, cluster_id) DO UPDATE SET
                    leaf_hub_name = excluded.leaf_hub_name,
                    count = MAX(count, excluded.count),
                    message = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.message ELSE message END,
                    reason = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.reason ELSE reason END,
                    compliance = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.compliance ELSE compliance END,
                    created_at_us = MAX(created_at_us, excluded.created_at_us)",
                params![
                    event.event_name,
                    event.policy_id,
                    cluster_id,
                    envelope.leaf_hub_name,
                    event.message,
                    event.reason,
                    event.count,
                    event.compliance,
                    event.created_at.timestamp_micros()
                ],
            )?;
        }
        Ok(rows)
    }

    fn apply_root_policy_events(
        &self,
        envelope: &BundleEnvelope<PolicyEvent>,
    ) -> rusqlite::Result<usize> {
        let mut rows = 0;
        for event in &envelope.objects {
            rows += self.conn.execute(
                "INSERT INTO local_root_policy_events
                    (event_name, policy_id, leaf_hub_name, message, reason, count, compliance, created_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(event_name, policy_id) DO UPDATE SET
                    leaf_hub_name = excluded.leaf_hub_name,
                    count = MAX(count, excluded.count),
                    message = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.message ELSE message END,
                    reason = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.reason ELSE reason END,
                    compliance = CASE WHEN excluded.created_at_us > created_at_us THEN excluded.compliance ELSE compliance END,
                    created_at_us = MAX(created_at_us, excluded.created_at_us)",
                params![
                    event.event_name,
                    event.policy_id,
                    envelope.leaf_hub_name,
                    event.message,
                    event.reason,
                    event.count,
                    event.compliance,
                    event.created_at.timestamp_micros()
                ],
            )?;
        }
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Generic objects
    // -----------------------------------------------------------------------

    fn apply_objects(
        &self,
        kind: MessageKind,
        envelope: &BundleEnvelope<StatusObject>,
    ) -> Result<usize, MergeError> {
        let hub = envelope.leaf_hub_name.as_str();
        let mut rows = 0;
        let mut listed = BTreeSet::new();

        for object in &envelope.objects {
            listed.insert(object.id.as_str());
            rows += self.conn.execute(
                "INSERT INTO status_objects (leaf_hub_name, message_kind, object_id, payload, updated_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(leaf_hub_name, message_kind, object_id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at_us = excluded.updated_at_us",
                params![
                    hub,
                    kind.as_str(),
                    object.id,
                    serde_json::to_string(&object.payload)?,
                    now_us()
                ],
            )?;
        }

        let stored: Vec<String> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT object_id FROM status_objects WHERE leaf_hub_name = ?1 AND message_kind = ?2",
            )?;
            let ids = stmt.query_map(params![hub, kind.as_str()], |row| row.get(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };
        for id in stored {
            if !listed.contains(id.as_str()) {
                rows += self.conn.execute(
                    "DELETE FROM status_objects WHERE leaf_hub_name = ?1 AND message_kind = ?2 AND object_id = ?3",
                    params![hub, kind.as_str(), id],
                )?;
            }
        }
        Ok(rows)
    }
}

fn log_outcome(bundle: &StatusBundle, outcome: ApplyOutcome) {
    let hub = bundle.leaf_hub_name();
    let kind = bundle.kind();
    match outcome {
        ApplyOutcome::Applied { rows } => {
            tracing::debug!(leaf_hub = %hub, %kind, version = %bundle.version(), rows, "bundle applied");
        }
        ApplyOutcome::Stale { incoming, stored } => {
            tracing::debug!(
                leaf_hub = %hub,
                %kind,
                version = %incoming,
                stored = %stored,
                code = ErrorCode::StaleBundle.code(),
                "dropping stale bundle"
            );
        }
        ApplyOutcome::BaseMismatch { expected, stored } => {
            tracing::info!(
                leaf_hub = %hub,
                %kind,
                version = %bundle.version(),
                base = ?expected,
                stored = ?stored,
                code = ErrorCode::BaseVersionMismatch.code(),
                "dropping delta with mismatched base"
            );
        }
    }
}

/// Last applied version of a scope.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn stored_version(
    conn: &Connection,
    hub: &str,
    kind: MessageKind,
) -> rusqlite::Result<Option<BundleVersion>> {
    conn.query_row(
        "SELECT incarnation, generation FROM bundle_versions
         WHERE leaf_hub_name = ?1 AND message_kind = ?2",
        params![hub, kind.as_str()],
        |row| {
            Ok(BundleVersion::new(
                from_sql(0, row.get(0)?)?,
                from_sql(1, row.get(1)?)?,
            ))
        },
    )
    .optional()
}

/// Version counters are stored as INTEGER; values above `i64::MAX` are rejected.
fn to_sql(n: u64) -> rusqlite::Result<i64> {
    i64::try_from(n).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

pub(crate) fn from_sql(column: usize, n: i64) -> rusqlite::Result<u64> {
    u64::try_from(n).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(column, n))
}

impl Store {
    /// Apply one bundle under the store's write lock.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError`] if the merge transaction fails.
    pub fn apply(&self, bundle: &StatusBundle) -> Result<ApplyOutcome, MergeError> {
        let conn = self.conn();
        MergeEngine::new(&conn).apply(bundle)
    }
}
