//! Canonical SQLite schema for the consumer store.
//!
//! - `compliance` keeps one row per `(policy, cluster, leaf hub)`
//! - `aggregated_compliance` keeps per-policy counts under minimal aggregation
//! - `local_policy_events` / `local_root_policy_events` keep deduplicated
//!   compliance history
//! - `status_objects` keeps generic object sync payloads
//! - `bundle_versions` records the last applied version per bundle scope
//! - `store_meta` tracks the schema version

/// Migration v1: state tables, applied versions and store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS compliance (
    policy_id TEXT NOT NULL,
    cluster_name TEXT NOT NULL,
    leaf_hub_name TEXT NOT NULL,
    compliance TEXT NOT NULL CHECK (compliance IN ('compliant', 'non_compliant', 'unknown')),
    error TEXT NOT NULL DEFAULT 'none' CHECK (error IN ('disconnected', 'none')),
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (policy_id, cluster_name, leaf_hub_name)
);

CREATE TABLE IF NOT EXISTS aggregated_compliance (
    policy_id TEXT NOT NULL,
    leaf_hub_name TEXT NOT NULL,
    remediation_action TEXT NOT NULL DEFAULT 'inform',
    applied_clusters INTEGER NOT NULL CHECK (applied_clusters >= 0),
    non_compliant_clusters INTEGER NOT NULL CHECK (non_compliant_clusters >= 0),
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (policy_id, leaf_hub_name)
);

CREATE TABLE IF NOT EXISTS local_policy_events (
    event_name TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    cluster_id TEXT NOT NULL,
    leaf_hub_name TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL CHECK (count >= 0),
    compliance TEXT NOT NULL DEFAULT '',
    created_at_us INTEGER NOT NULL,
    PRIMARY KEY (event_name, policy_id, cluster_id)
);

CREATE TABLE IF NOT EXISTS local_root_policy_events (
    event_name TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    leaf_hub_name TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL CHECK (count >= 0),
    compliance TEXT NOT NULL DEFAULT '',
    created_at_us INTEGER NOT NULL,
    PRIMARY KEY (event_name, policy_id)
);

CREATE TABLE IF NOT EXISTS status_objects (
    leaf_hub_name TEXT NOT NULL,
    message_kind TEXT NOT NULL,
    object_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at_us INTEGER NOT NULL,
    PRIMARY KEY (leaf_hub_name, message_kind, object_id)
);

CREATE TABLE IF NOT EXISTS bundle_versions (
    leaf_hub_name TEXT NOT NULL,
    message_kind TEXT NOT NULL,
    incarnation INTEGER NOT NULL CHECK (incarnation >= 0),
    generation INTEGER NOT NULL CHECK (generation >= 0),
    applied_at_us INTEGER NOT NULL,
    PRIMARY KEY (leaf_hub_name, message_kind)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_reconcile_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, last_reconcile_at_us)
VALUES (1, 1, 0);
";

/// Migration v2: read-path indexes.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_compliance_hub_policy
    ON compliance(leaf_hub_name, policy_id);

CREATE INDEX IF NOT EXISTS idx_aggregated_hub
    ON aggregated_compliance(leaf_hub_name);

CREATE INDEX IF NOT EXISTS idx_policy_events_policy_created
    ON local_policy_events(policy_id, created_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_root_policy_events_policy_created
    ON local_root_policy_events(policy_id, created_at_us DESC);

UPDATE store_meta
SET schema_version = 2
WHERE id = 1;
";

/// Indexes expected by merge and list query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_compliance_hub_policy",
    "idx_aggregated_hub",
    "idx_policy_events_policy_created",
    "idx_root_policy_events_policy_created",
];
