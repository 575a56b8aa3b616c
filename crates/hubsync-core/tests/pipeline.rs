//! End-to-end: watched objects through the producer bundles, the transport,
//! the consumer registry and into a file-backed store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use hubsync_core::bundle::events::StaticResolver;
use hubsync_core::config::{EventsConfig, ProducerConfig};
use hubsync_core::db::{Store, query};
use hubsync_core::dispatch::Dispatcher;
use hubsync_core::incarnation::next_incarnation;
use hubsync_core::merge::ApplyOutcome;
use hubsync_core::object::{
    CLUSTER_NAME_LABEL, ClusterComplianceStatus, ClusterDecision, ComplianceHistory,
    DetailStatus, ObjectMeta, PlacementDecision, Policy, PolicyStatus, ROOT_POLICY_LABEL,
    WatchedObject,
};
use hubsync_core::producer::LeafHubBundles;
use hubsync_core::registry::{
    AggregationLevel, ConsumerRegistry, DispatchOutcome, SharedAggregationLevel,
};
use hubsync_core::transport::InMemoryProducer;
use hubsync_core::wire::{ComplianceStatus, MessageKind};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Pipeline {
    dir: tempfile::TempDir,
    bundles: LeafHubBundles,
    dispatcher: Dispatcher,
    producer: InMemoryProducer,
    registry: ConsumerRegistry,
    store: Store,
}

impl Pipeline {
    /// Producer and consumer wired for `kinds` only.
    fn new(level: AggregationLevel, kinds: &[MessageKind]) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let producer_config = ProducerConfig {
            incarnation_path: dir.path().join("incarnation"),
            ..ProducerConfig::default()
        };
        let incarnation =
            next_incarnation(&producer_config.incarnation_path).expect("claim incarnation");
        let bundles = LeafHubBundles::new(
            &producer_config,
            &EventsConfig::default(),
            incarnation,
            Arc::new(
                StaticResolver::new()
                    .with_policy("default.p1", "p1")
                    .with_cluster("c1", "cluster-1"),
            ),
        )
        .expect("bundles");
        let level = SharedAggregationLevel::new(level);
        let dispatcher = bundles.dispatcher(&level);

        let mut registry = ConsumerRegistry::new();
        for kind in kinds {
            registry.register_when(*kind, Box::new(|| true));
        }
        let store = Store::open(&dir.path().join("store.sqlite3")).expect("open store");

        Self {
            dir,
            bundles,
            dispatcher,
            producer: InMemoryProducer::new(),
            registry,
            store,
        }
    }

    /// One tick, then deliver everything in send order.
    fn sync(&mut self) -> Vec<DispatchOutcome> {
        self.dispatcher.tick(&self.producer);
        self.producer
            .drain()
            .iter()
            .map(|message| {
                self.registry
                    .dispatch(message, &self.store)
                    .expect("dispatch")
            })
            .collect()
    }

    fn compliance(&self) -> Vec<(String, String, ComplianceStatus)> {
        query::list_compliance(&self.store.conn(), Some("hub1"))
            .expect("list compliance")
            .into_iter()
            .map(|r| (r.policy_id, r.cluster_name, r.compliance))
            .collect()
    }
}

fn root_policy(uid: &str, clusters: &[(&str, &str)]) -> WatchedObject {
    WatchedObject::Policy(Policy {
        metadata: ObjectMeta {
            uid: uid.into(),
            name: uid.into(),
            namespace: "default".into(),
            ..ObjectMeta::default()
        },
        status: PolicyStatus {
            status: clusters
                .iter()
                .map(|(cluster, state)| ClusterComplianceStatus {
                    cluster_name: (*cluster).to_string(),
                    compliant: (*state).to_string(),
                })
                .collect(),
            details: None,
        },
        ..Policy::default()
    })
}

fn replicated_policy(history: &[(&str, i64, &str)]) -> WatchedObject {
    let mut metadata = ObjectMeta {
        uid: "rp1".into(),
        name: "default.p1".into(),
        namespace: "c1".into(),
        ..ObjectMeta::default()
    };
    metadata
        .labels
        .insert(ROOT_POLICY_LABEL.into(), "default.p1".into());
    metadata.labels.insert(CLUSTER_NAME_LABEL.into(), "c1".into());
    WatchedObject::Policy(Policy {
        metadata,
        status: PolicyStatus {
            status: Vec::new(),
            details: Some(vec![DetailStatus {
                compliance_state: "NonCompliant".into(),
                history: Some(
                    history
                        .iter()
                        .map(|(name, secs, message)| ComplianceHistory {
                            event_name: (*name).to_string(),
                            last_timestamp: Utc
                                .timestamp_opt(*secs, 0)
                                .single()
                                .expect("timestamp"),
                            message: (*message).to_string(),
                        })
                        .collect(),
                ),
            }]),
        },
        ..Policy::default()
    })
}

fn placement(uid: &str, clusters: &[&str]) -> WatchedObject {
    WatchedObject::PlacementDecision(PlacementDecision {
        metadata: ObjectMeta {
            uid: uid.into(),
            name: uid.into(),
            namespace: "default".into(),
            ..ObjectMeta::default()
        },
        decisions: clusters
            .iter()
            .map(|c| ClusterDecision {
                cluster_name: (*c).to_string(),
                reason: String::new(),
            })
            .collect(),
    })
}

fn row(policy: &str, cluster: &str, status: ComplianceStatus) -> (String, String, ComplianceStatus) {
    (policy.into(), cluster.into(), status)
}

fn applied(outcomes: &[DispatchOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Merged(ApplyOutcome::Applied { .. })))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn clusters_per_policy_tracks_membership() {
    let mut pipeline = Pipeline::new(
        AggregationLevel::Full,
        &[MessageKind::ClustersPerPolicy, MessageKind::PlacementDecisions],
    );
    pipeline
        .bundles
        .update_object(&root_policy("p1", &[("c1", "Compliant"), ("c2", "NonCompliant")]));
    pipeline.bundles.update_object(&root_policy("p2", &[("c1", "")]));
    pipeline.bundles.update_object(&placement("pd1", &["c1", "c2"]));
    pipeline.sync();

    assert_eq!(
        pipeline.compliance(),
        vec![
            row("p1", "c1", ComplianceStatus::Compliant),
            row("p1", "c2", ComplianceStatus::NonCompliant),
            row("p2", "c1", ComplianceStatus::Unknown),
        ]
    );
    let placements = query::list_status_objects(
        &pipeline.store.conn(),
        "hub1",
        MessageKind::PlacementDecisions,
    )
    .expect("placements");
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].object_id, "pd1");

    // Cluster c2 leaves p1, p2 is deleted, and the placement goes away.
    pipeline
        .bundles
        .update_object(&root_policy("p1", &[("c1", "Compliant")]));
    pipeline.bundles.delete_object(&root_policy("p2", &[]));
    pipeline.bundles.delete_object(&placement("pd1", &[]));
    let outcomes = pipeline.sync();
    assert_eq!(applied(&outcomes), 2);

    assert_eq!(
        pipeline.compliance(),
        vec![row("p1", "c1", ComplianceStatus::Compliant)]
    );
    assert!(
        query::list_status_objects(&pipeline.store.conn(), "hub1", MessageKind::PlacementDecisions)
            .expect("placements")
            .is_empty()
    );
}

#[test]
fn idle_ticks_after_convergence_send_nothing() {
    let mut pipeline = Pipeline::new(AggregationLevel::Full, &[MessageKind::ClustersPerPolicy]);
    pipeline
        .bundles
        .update_object(&root_policy("p1", &[("c1", "Compliant")]));
    pipeline.sync();
    pipeline.sync();

    assert!(pipeline.sync().is_empty());
    let versions = query::list_scope_versions(&pipeline.store.conn()).expect("versions");
    let cpp = versions
        .iter()
        .find(|v| v.message_kind == MessageKind::ClustersPerPolicy.as_str())
        .expect("clusters-per-policy version");
    assert_eq!(
        Some(cpp.version),
        pipeline.dispatcher.last_sent(MessageKind::ClustersPerPolicy)
    );
}

#[test]
fn complete_and_delta_follow_status_changes() {
    let mut pipeline = Pipeline::new(
        AggregationLevel::Full,
        &[
            MessageKind::PolicyCompleteCompliance,
            MessageKind::PolicyDeltaCompliance,
        ],
    );
    pipeline.bundles.update_object(&root_policy(
        "p1",
        &[("c1", "Compliant"), ("c2", "Compliant"), ("c3", "")],
    ));
    pipeline.sync();
    assert_eq!(
        pipeline.compliance(),
        vec![
            row("p1", "c1", ComplianceStatus::Compliant),
            row("p1", "c2", ComplianceStatus::Compliant),
            row("p1", "c3", ComplianceStatus::Unknown),
        ]
    );

    pipeline.bundles.update_object(&root_policy(
        "p1",
        &[("c1", "NonCompliant"), ("c2", "Compliant"), ("c3", "Compliant")],
    ));
    let outcomes = pipeline.sync();
    assert_eq!(applied(&outcomes), 1, "only the delta carries the change");
    assert_eq!(
        pipeline.compliance(),
        vec![
            row("p1", "c1", ComplianceStatus::NonCompliant),
            row("p1", "c2", ComplianceStatus::Compliant),
            row("p1", "c3", ComplianceStatus::Compliant),
        ]
    );
}

#[test]
fn minimal_level_sends_only_aggregates() {
    let mut pipeline = Pipeline::new(
        AggregationLevel::Minimal,
        &[
            MessageKind::ClustersPerPolicy,
            MessageKind::MinimalPolicyCompliance,
        ],
    );
    pipeline.bundles.update_object(&root_policy(
        "p1",
        &[("c1", "NonCompliant"), ("c2", "Compliant")],
    ));
    pipeline.sync();

    assert!(pipeline.compliance().is_empty());
    let aggregated = query::list_aggregated(&pipeline.store.conn(), None).expect("aggregated");
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0].policy_id, "p1");
    assert_eq!(aggregated[0].applied_clusters, 2);
    assert_eq!(aggregated[0].non_compliant_clusters, 1);
}

#[test]
fn replicated_history_lands_as_deduplicated_events() {
    let mut pipeline = Pipeline::new(AggregationLevel::Full, &[MessageKind::PolicyHistoryEvents]);
    pipeline.bundles.update_object(&replicated_policy(&[
        ("e1", 100, "NonCompliant; pod missing"),
        ("e2", 50, "Compliant; all good"),
    ]));
    pipeline.sync();

    // Redelivery of the same history is not a change.
    pipeline.bundles.update_object(&replicated_policy(&[
        ("e1", 100, "NonCompliant; pod missing"),
        ("e2", 50, "Compliant; all good"),
    ]));
    assert!(pipeline.sync().is_empty());

    // e1 fires again; e2 drops out of the history.
    pipeline
        .bundles
        .update_object(&replicated_policy(&[("e1", 200, "Compliant; fixed")]));
    pipeline.sync();

    let events = query::list_policy_events(&pipeline.store.conn(), Some("p1")).expect("events");
    let e1 = events
        .iter()
        .find(|e| e.event_name == "e1")
        .expect("e1 stored");
    assert_eq!(e1.count, 2);
    assert_eq!(e1.compliance, "Compliant");
    assert_eq!(e1.message, "Compliant; fixed");
    assert_eq!(e1.cluster_id.as_deref(), Some("cluster-1"));
    assert_eq!(e1.created_at_us, 200_000_000);
}

#[test]
fn restart_with_new_incarnation_supersedes_old_state() {
    let mut pipeline = Pipeline::new(AggregationLevel::Full, &[MessageKind::ClustersPerPolicy]);
    for state in ["NonCompliant", "Compliant", "NonCompliant"] {
        pipeline
            .bundles
            .update_object(&root_policy("p1", &[("c1", state)]));
        pipeline.sync();
    }
    let before = pipeline
        .dispatcher
        .last_sent(MessageKind::ClustersPerPolicy)
        .expect("sent");

    let path = pipeline.dir.path().join("incarnation");
    let incarnation = next_incarnation(&path).expect("claim incarnation");
    assert_eq!(incarnation, 2);
    let producer_config = ProducerConfig {
        incarnation_path: path,
        ..ProducerConfig::default()
    };
    pipeline.bundles = LeafHubBundles::new(
        &producer_config,
        &EventsConfig::default(),
        incarnation,
        Arc::new(StaticResolver::new()),
    )
    .expect("bundles");
    pipeline.dispatcher = pipeline
        .bundles
        .dispatcher(&SharedAggregationLevel::new(AggregationLevel::Full));
    pipeline
        .bundles
        .update_object(&root_policy("p1", &[("c1", "Compliant")]));
    let outcomes = pipeline.sync();

    assert_eq!(applied(&outcomes), 1);
    let after = pipeline
        .dispatcher
        .last_sent(MessageKind::ClustersPerPolicy)
        .expect("sent");
    assert!(after.newer_than(&before));
    assert!(after.generation < before.generation);
    assert_eq!(
        pipeline.compliance(),
        vec![row("p1", "c1", ComplianceStatus::Compliant)]
    );
}
