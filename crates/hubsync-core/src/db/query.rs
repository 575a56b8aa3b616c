//! Read helpers for the consumer store.
//!
//! All functions take a shared `&Connection` and return typed rows, never raw
//! SQLite rows. Results are ordered by their primary key.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::merge;
use crate::version::BundleVersion;
use crate::wire::{ClusterError, ComplianceStatus, MessageKind};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A row of the `compliance` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceRow {
    pub policy_id: String,
    pub cluster_name: String,
    pub leaf_hub_name: String,
    pub compliance: ComplianceStatus,
    pub error: ClusterError,
}

/// A row of the `aggregated_compliance` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedRow {
    pub policy_id: String,
    pub leaf_hub_name: String,
    pub remediation_action: String,
    pub applied_clusters: u32,
    pub non_compliant_clusters: u32,
}

/// A stored policy event. `cluster_id` is `None` for root-policy events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub event_name: String,
    pub policy_id: String,
    pub cluster_id: Option<String>,
    pub leaf_hub_name: String,
    pub message: String,
    pub reason: String,
    pub count: u32,
    pub compliance: String,
    pub created_at_us: i64,
}

/// A generic status object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusObjectRow {
    pub leaf_hub_name: String,
    pub message_kind: String,
    pub object_id: String,
    pub payload: serde_json::Value,
}

/// The applied version of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeVersionRow {
    pub leaf_hub_name: String,
    pub message_kind: String,
    pub version: BundleVersion,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// List compliance rows, optionally for one leaf hub.
///
/// # Errors
///
/// Returns an error if the query fails or a stored value is out of range.
pub fn list_compliance(conn: &Connection, hub: Option<&str>) -> Result<Vec<ComplianceRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT policy_id, cluster_name, leaf_hub_name, compliance, error
             FROM compliance
             WHERE ?1 IS NULL OR leaf_hub_name = ?1
             ORDER BY leaf_hub_name, policy_id, cluster_name",
        )
        .context("prepare list_compliance")?;
    let raw = stmt
        .query_map(params![hub], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .context("execute list_compliance")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read compliance rows")?;

    raw.into_iter()
        .map(|(policy_id, cluster_name, leaf_hub_name, compliance, error)| {
            let Some(compliance) = ComplianceStatus::from_column(&compliance) else {
                bail!("unexpected compliance value '{compliance}'");
            };
            let error = if error == ClusterError::Disconnected.as_str() {
                ClusterError::Disconnected
            } else {
                ClusterError::None
            };
            Ok(ComplianceRow {
                policy_id,
                cluster_name,
                leaf_hub_name,
                compliance,
                error,
            })
        })
        .collect()
}

/// List aggregated compliance rows, optionally for one leaf hub.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_aggregated(conn: &Connection, hub: Option<&str>) -> Result<Vec<AggregatedRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT policy_id, leaf_hub_name, remediation_action, applied_clusters, non_compliant_clusters
             FROM aggregated_compliance
             WHERE ?1 IS NULL OR leaf_hub_name = ?1
             ORDER BY leaf_hub_name, policy_id",
        )
        .context("prepare list_aggregated")?;
    let rows = stmt
        .query_map(params![hub], |row| {
            Ok(AggregatedRow {
                policy_id: row.get(0)?,
                leaf_hub_name: row.get(1)?,
                remediation_action: row.get(2)?,
                applied_clusters: row.get(3)?,
                non_compliant_clusters: row.get(4)?,
            })
        })
        .context("execute list_aggregated")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read aggregated rows")
}

/// List cluster-scoped policy events for one policy, or all when `None`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_policy_events(conn: &Connection, policy_id: Option<&str>) -> Result<Vec<EventRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_name, policy_id, cluster_id, leaf_hub_name, message, reason, count, compliance, created_at_us
             FROM local_policy_events
             WHERE ?1 IS NULL OR policy_id = ?1
             ORDER BY event_name, policy_id, cluster_id",
        )
        .context("prepare list_policy_events")?;
    let rows = stmt
        .query_map(params![policy_id], |row| {
            Ok(EventRow {
                event_name: row.get(0)?,
                policy_id: row.get(1)?,
                cluster_id: Some(row.get(2)?),
                leaf_hub_name: row.get(3)?,
                message: row.get(4)?,
                reason: row.get(5)?,
                count: row.get(6)?,
                compliance: row.get(7)?,
                created_at_us: row.get(8)?,
            })
        })
        .context("execute list_policy_events")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read policy event rows")
}

/// List root-policy events for one policy, or all when `None`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_root_policy_events(
    conn: &Connection,
    policy_id: Option<&str>,
) -> Result<Vec<EventRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_name, policy_id, leaf_hub_name, message, reason, count, compliance, created_at_us
             FROM local_root_policy_events
             WHERE ?1 IS NULL OR policy_id = ?1
             ORDER BY event_name, policy_id",
        )
        .context("prepare list_root_policy_events")?;
    let rows = stmt
        .query_map(params![policy_id], |row| {
            Ok(EventRow {
                event_name: row.get(0)?,
                policy_id: row.get(1)?,
                cluster_id: None,
                leaf_hub_name: row.get(2)?,
                message: row.get(3)?,
                reason: row.get(4)?,
                count: row.get(5)?,
                compliance: row.get(6)?,
                created_at_us: row.get(7)?,
            })
        })
        .context("execute list_root_policy_events")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read root policy event rows")
}

/// List generic status objects of one hub and kind.
///
/// # Errors
///
/// Returns an error if the query fails or a payload is not valid JSON.
pub fn list_status_objects(
    conn: &Connection,
    hub: &str,
    kind: MessageKind,
) -> Result<Vec<StatusObjectRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT object_id, payload
             FROM status_objects
             WHERE leaf_hub_name = ?1 AND message_kind = ?2
             ORDER BY object_id",
        )
        .context("prepare list_status_objects")?;
    let raw = stmt
        .query_map(params![hub, kind.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("execute list_status_objects")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read status object rows")?;

    raw.into_iter()
        .map(|(object_id, payload)| {
            let payload = serde_json::from_str(&payload)
                .with_context(|| format!("parse payload of status object {object_id}"))?;
            Ok(StatusObjectRow {
                leaf_hub_name: hub.to_string(),
                message_kind: kind.as_str().to_string(),
                object_id,
                payload,
            })
        })
        .collect()
}

/// List every applied scope version.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_scope_versions(conn: &Connection) -> Result<Vec<ScopeVersionRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT leaf_hub_name, message_kind, incarnation, generation
             FROM bundle_versions
             ORDER BY leaf_hub_name, message_kind",
        )
        .context("prepare list_scope_versions")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ScopeVersionRow {
                leaf_hub_name: row.get(0)?,
                message_kind: row.get(1)?,
                version: BundleVersion::new(
                    merge::from_sql(2, row.get(2)?)?,
                    merge::from_sql(3, row.get(3)?)?,
                ),
            })
        })
        .context("execute list_scope_versions")?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("read scope version rows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;

    fn test_db() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        migrations::migrate(&mut conn).expect("migrate");
        conn
    }

    #[test]
    fn list_compliance_filters_by_hub() {
        let conn = test_db();
        conn.execute_batch(
            "INSERT INTO compliance VALUES ('p1', 'c1', 'hub1', 'compliant', 'none', 0);
             INSERT INTO compliance VALUES ('p1', 'c1', 'hub2', 'non_compliant', 'disconnected', 0);",
        )
        .expect("seed");

        assert_eq!(list_compliance(&conn, None).expect("all").len(), 2);
        let hub2 = list_compliance(&conn, Some("hub2")).expect("hub2");
        assert_eq!(hub2.len(), 1);
        assert_eq!(hub2[0].compliance, ComplianceStatus::NonCompliant);
        assert_eq!(hub2[0].error, ClusterError::Disconnected);
    }

    #[test]
    fn event_listings_distinguish_scopes() {
        let conn = test_db();
        conn.execute_batch(
            "INSERT INTO local_policy_events VALUES ('e1', 'p1', 'cl1', 'hub1', 'm', 'r', 2, 'Compliant', 10);
             INSERT INTO local_root_policy_events VALUES ('e2', 'p1', 'hub1', 'm', 'r', 1, 'NonCompliant', 20);",
        )
        .expect("seed");

        let cluster = list_policy_events(&conn, Some("p1")).expect("cluster events");
        assert_eq!(cluster[0].cluster_id.as_deref(), Some("cl1"));
        assert_eq!(cluster[0].count, 2);

        let root = list_root_policy_events(&conn, None).expect("root events");
        assert!(root[0].cluster_id.is_none());
        assert!(list_policy_events(&conn, Some("other")).expect("empty").is_empty());
    }

    #[test]
    fn status_objects_parse_payloads() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO status_objects VALUES ('hub1', 'PlacementDecisions', 'o1', ?1, 0)",
            [r#"{"a":1}"#],
        )
        .expect("seed");
        let rows =
            list_status_objects(&conn, "hub1", MessageKind::PlacementDecisions).expect("list");
        assert_eq!(rows[0].payload["a"], 1);
        assert!(
            list_status_objects(&conn, "hub1", MessageKind::LocalSpecPolicies)
                .expect("list")
                .is_empty()
        );
    }
}
