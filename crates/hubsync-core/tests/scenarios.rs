//! Merge and event-dedup scenarios, run against an in-memory store.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use hubsync_core::bundle::Bundle;
use hubsync_core::bundle::events::{EventScope, PolicyEventBundle, StaticResolver};
use hubsync_core::db::{Store, query};
use hubsync_core::merge::{ApplyOutcome, StatusBundle};
use hubsync_core::object::{
    CLUSTER_NAME_LABEL, ComplianceHistory, DetailStatus, ObjectMeta, Policy, PolicyStatus,
    ROOT_POLICY_LABEL, WatchedObject,
};
use hubsync_core::version::BundleVersion;
use hubsync_core::wire::{
    BundleEnvelope, ComplianceStatus, MinimalPolicyComplianceStatus, PolicyComplianceStatus,
    PolicyCompleteComplianceStatus, PolicyEvent,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const HUB: &str = "hub1";

fn envelope<T>(objects: Vec<T>, version: BundleVersion) -> BundleEnvelope<T> {
    BundleEnvelope {
        objects,
        leaf_hub_name: HUB.into(),
        bundle_version: version,
        base_bundle_version: None,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn complete_v1() -> StatusBundle {
    StatusBundle::Complete(envelope(
        vec![PolicyCompleteComplianceStatus {
            policy_id: "P".into(),
            non_compliant_clusters: strings(&["c1"]),
            unknown_compliance_clusters: strings(&["c3"]),
            applied_clusters: strings(&["c1", "c2", "c3"]),
        }],
        BundleVersion::new(1, 1),
    ))
}

fn delta(base: BundleVersion, generation: u64) -> StatusBundle {
    let mut envelope = envelope(
        vec![PolicyComplianceStatus {
            policy_id: "P".into(),
            compliant_clusters: strings(&["c1"]),
            non_compliant_clusters: strings(&["c3"]),
            unknown_compliance_clusters: Vec::new(),
        }],
        BundleVersion::new(1, generation),
    );
    envelope.base_bundle_version = Some(base);
    StatusBundle::Delta(envelope)
}

fn rows(store: &Store) -> Vec<(String, String, ComplianceStatus)> {
    query::list_compliance(&store.conn(), Some(HUB))
        .expect("list compliance")
        .into_iter()
        .map(|r| (r.policy_id, r.cluster_name, r.compliance))
        .collect()
}

fn row(cluster: &str, status: ComplianceStatus) -> (String, String, ComplianceStatus) {
    ("P".into(), cluster.into(), status)
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn replicated(history: &[(&str, i64)]) -> WatchedObject {
    WatchedObject::Policy(Policy {
        metadata: ObjectMeta {
            uid: "rp1".into(),
            name: "default.root".into(),
            namespace: "cluster-a".into(),
            labels: [
                (ROOT_POLICY_LABEL.to_string(), "default.root".to_string()),
                (CLUSTER_NAME_LABEL.to_string(), "cluster-a".to_string()),
            ]
            .into_iter()
            .collect(),
        },
        status: PolicyStatus {
            status: Vec::new(),
            details: Some(vec![DetailStatus {
                compliance_state: "Compliant".into(),
                history: Some(
                    history
                        .iter()
                        .map(|(name, ts)| ComplianceHistory {
                            event_name: (*name).to_string(),
                            last_timestamp: at(*ts),
                            message: format!("Compliant; {name}"),
                        })
                        .collect(),
                ),
            }]),
        },
        ..Policy::default()
    })
}

fn event_bundle() -> PolicyEventBundle {
    let resolver = StaticResolver::new()
        .with_policy("default.root", "policy-1")
        .with_cluster("cluster-a", "cluster-id-a");
    PolicyEventBundle::new(
        HUB,
        1,
        EventScope::Cluster,
        Arc::new(resolver),
        r"(\w+);",
    )
    .expect("event bundle")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn complete_fills_in_compliant_by_omission() {
    let store = Store::open_in_memory().expect("store");
    let outcome = store.apply(&complete_v1()).expect("apply complete");
    assert!(outcome.is_applied());
    assert_eq!(
        rows(&store),
        vec![
            row("c1", ComplianceStatus::NonCompliant),
            row("c2", ComplianceStatus::Compliant),
            row("c3", ComplianceStatus::Unknown),
        ]
    );
}

#[test]
fn delta_touches_only_listed_clusters() {
    let store = Store::open_in_memory().expect("store");
    store.apply(&complete_v1()).expect("apply complete");

    let outcome = store
        .apply(&delta(BundleVersion::new(1, 1), 1))
        .expect("apply delta");
    assert!(outcome.is_applied());
    assert_eq!(
        rows(&store),
        vec![
            row("c1", ComplianceStatus::Compliant),
            row("c2", ComplianceStatus::Compliant),
            row("c3", ComplianceStatus::NonCompliant),
        ]
    );
}

#[test]
fn delta_on_an_outdated_base_is_dropped() {
    let store = Store::open_in_memory().expect("store");
    store.apply(&complete_v1()).expect("apply complete v1");
    let mut newer = complete_v1();
    if let StatusBundle::Complete(envelope) = &mut newer {
        envelope.bundle_version = BundleVersion::new(1, 2);
    }
    store.apply(&newer).expect("apply complete v2");
    let before = rows(&store);

    let outcome = store
        .apply(&delta(BundleVersion::new(1, 1), 1))
        .expect("apply delta");
    assert_eq!(
        outcome,
        ApplyOutcome::BaseMismatch {
            expected: Some(BundleVersion::new(1, 1)),
            stored: Some(BundleVersion::new(1, 2)),
        }
    );
    assert_eq!(rows(&store), before);
}

#[test]
fn minimal_upserts_keep_one_row() {
    let store = Store::open_in_memory().expect("store");
    for (generation, non_compliant) in [(1, 1), (2, 2)] {
        let bundle = StatusBundle::Minimal(envelope(
            vec![MinimalPolicyComplianceStatus {
                policy_id: "P".into(),
                remediation_action: hubsync_core::object::RemediationAction::Inform,
                applied_clusters: 3,
                non_compliant_clusters: non_compliant,
            }],
            BundleVersion::new(1, generation),
        ));
        assert!(store.apply(&bundle).expect("apply minimal").is_applied());
    }

    let aggregated = query::list_aggregated(&store.conn(), Some(HUB)).expect("list");
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0].applied_clusters, 3);
    assert_eq!(aggregated[0].non_compliant_clusters, 2);
}

#[test]
fn upstream_removal_prunes_events() {
    let bundle = event_bundle();
    bundle.update_object(&replicated(&[("e1", 10), ("e2", 20)]));
    let first = bundle.snapshot_since(None).expect("snapshot").expect("first send");
    let names: Vec<_> = bundle
        .events_for("rp1")
        .into_iter()
        .map(|e| e.event_name)
        .collect();
    assert_eq!(names, vec!["e1", "e2"]);

    bundle.update_object(&replicated(&[("e1", 10)]));
    let second = bundle
        .snapshot_since(Some(first.version))
        .expect("snapshot")
        .expect("pruning is a change");
    let envelope: BundleEnvelope<PolicyEvent> =
        serde_json::from_slice(&second.payload).expect("decode");
    assert_eq!(envelope.objects.len(), 1);
    assert_eq!(envelope.objects[0].event_name, "e1");
    assert_eq!(envelope.objects[0].count, 1);
    assert_eq!(envelope.objects[0].policy_id, "policy-1");
    assert_eq!(envelope.objects[0].cluster_id.as_deref(), Some("cluster-id-a"));
}

#[test]
fn clusters_per_policy_replaces_the_hub_state() {
    let store = Store::open_in_memory().expect("store");
    let cpp = |generation, policies: Vec<PolicyComplianceStatus>| {
        StatusBundle::ClustersPerPolicy(envelope(policies, BundleVersion::new(1, generation)))
    };
    let status = |policy: &str, compliant: &[&str]| PolicyComplianceStatus {
        policy_id: policy.into(),
        compliant_clusters: strings(compliant),
        ..PolicyComplianceStatus::default()
    };

    store
        .apply(&cpp(1, vec![status("P", &["c1", "c2"]), status("Q", &["c1"])]))
        .expect("apply v1");
    store.apply(&cpp(2, vec![status("P", &["c2"])])).expect("apply v2");

    assert_eq!(rows(&store), vec![row("c2", ComplianceStatus::Compliant)]);
}
