use std::collections::{BTreeMap, BTreeSet};

use hubsync_core::db::Store;
use hubsync_core::db::query::{self, AggregatedRow, ComplianceRow, EventRow, StatusObjectRow};
use hubsync_core::merge::stored_version;
use hubsync_core::registry::{AggregationLevel, SharedAggregationLevel};
use hubsync_core::transport::{TransportMessage, parse_transport_key};
use hubsync_core::version::BundleVersion;
use hubsync_core::wire::{ComplianceStatus, MessageKind};

use crate::rng::DeterministicRng;
use crate::world::LeafHubModel;
use crate::{SIM_LEAF_HUB, Simulator, primary_registry};

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    #[must_use]
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// One failed invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A compliance row differs from the model, or is missing or extra.
    Compliance {
        policy_id: String,
        cluster: String,
        expected: Option<ComplianceStatus>,
        stored: Option<ComplianceStatus>,
    },
    /// An aggregated compliance row differs from the model.
    Aggregate {
        policy_id: String,
        expected: Option<(String, u32, u32)>,
        stored: Option<(String, u32, u32)>,
    },
    /// A generic status object differs from the model.
    StatusObject {
        kind: MessageKind,
        object_id: String,
        expected: Option<serde_json::Value>,
        stored: Option<serde_json::Value>,
    },
    /// A history entry the model holds never reached the store.
    MissingEvent {
        event_name: String,
        policy_id: String,
        cluster_id: String,
    },
    /// A stored event carries an older field value than the model.
    EventDrift {
        event_name: String,
        policy_id: String,
        field: &'static str,
        expected: String,
        stored: String,
    },
    /// The stored counter is below the producer's counter.
    EventCount {
        event_name: String,
        policy_id: String,
        producer: u32,
        stored: u32,
    },
    /// The applied scope version is not the last version sent.
    Version {
        kind: MessageKind,
        last_sent: Option<BundleVersion>,
        stored: Option<BundleVersion>,
    },
    /// The complete/delta store holds a row outside the model's universe.
    PhantomCluster { policy_id: String, cluster: String },
    /// Re-delivering every message changed the store.
    Idempotence { table: &'static str },
    /// Replaying full-state bundles in another order gave another store.
    Commutativity {
        permutation_index: usize,
        table: &'static str,
    },
}

/// Tables a converged store is compared on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreSnapshot {
    compliance: Vec<ComplianceRow>,
    aggregated: Vec<AggregatedRow>,
    policy_events: Vec<EventRow>,
    root_policy_events: Vec<EventRow>,
    placements: Vec<StatusObjectRow>,
    local_policies: Vec<StatusObjectRow>,
}

impl StoreSnapshot {
    fn take(store: &Store) -> anyhow::Result<Self> {
        let conn = store.conn();
        Ok(Self {
            compliance: query::list_compliance(&conn, Some(SIM_LEAF_HUB))?,
            aggregated: query::list_aggregated(&conn, Some(SIM_LEAF_HUB))?,
            policy_events: query::list_policy_events(&conn, None)?,
            root_policy_events: query::list_root_policy_events(&conn, None)?,
            placements: query::list_status_objects(
                &conn,
                SIM_LEAF_HUB,
                MessageKind::PlacementDecisions,
            )?,
            local_policies: query::list_status_objects(
                &conn,
                SIM_LEAF_HUB,
                MessageKind::LocalSpecPolicies,
            )?,
        })
    }

    /// Names of the tables that differ, considering only full-state ones
    /// when `full_state_only` is set.
    fn diff(&self, other: &Self, full_state_only: bool) -> Vec<&'static str> {
        let mut tables = Vec::new();
        if self.compliance != other.compliance {
            tables.push("compliance");
        }
        if self.aggregated != other.aggregated {
            tables.push("aggregated_compliance");
        }
        if self.placements != other.placements {
            tables.push("status_objects.PlacementDecisions");
        }
        if self.local_policies != other.local_policies {
            tables.push("status_objects.LocalSpecPolicies");
        }
        if !full_state_only {
            if self.policy_events != other.policy_events {
                tables.push("local_policy_events");
            }
            if self.root_policy_events != other.root_policy_events {
                tables.push("local_root_policy_events");
            }
        }
        tables
    }
}

/// Kinds whose bundles carry the whole state of their scope, so the newest
/// one alone decides the stored rows.
const FULL_STATE_KINDS: [MessageKind; 4] = [
    MessageKind::ClustersPerPolicy,
    MessageKind::MinimalPolicyCompliance,
    MessageKind::PlacementDecisions,
    MessageKind::LocalSpecPolicies,
];

/// Kinds checked against the dispatcher's last successful send.
const VERSIONED_KINDS: [MessageKind; 6] = [
    MessageKind::ClustersPerPolicy,
    MessageKind::MinimalPolicyCompliance,
    MessageKind::PolicyHistoryEvents,
    MessageKind::RootPolicyEvents,
    MessageKind::PlacementDecisions,
    MessageKind::LocalSpecPolicies,
];

const PERMUTATIONS: usize = 3;

/// Invariant checks over a drained [`Simulator`].
#[derive(Debug)]
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Run every check. The idempotence check re-delivers messages into the
    /// simulator's store, so it runs last.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be read or a replay fails to
    /// dispatch.
    pub fn check_all(sim: &Simulator, rng: &mut DeterministicRng) -> anyhow::Result<OracleResult> {
        let snapshot = StoreSnapshot::take(sim.store())?;
        let level = sim.config().aggregation_level;

        let result = OracleResult::pass()
            .merge(check_compliance(sim.model(), &snapshot, level))
            .merge(check_aggregates(sim.model(), &snapshot, level))
            .merge(check_status_objects(sim.model(), &snapshot))
            .merge(check_events(sim, &snapshot))
            .merge(check_versions(sim)?)
            .merge(check_hybrid_rows(sim)?)
            .merge(check_commutativity(sim, &snapshot, rng)?)
            .merge(check_idempotence(sim, &snapshot)?);
        Ok(result)
    }
}

/// Compliance rows equal the model under `Full`, and are absent otherwise.
fn check_compliance(
    model: &LeafHubModel,
    snapshot: &StoreSnapshot,
    level: AggregationLevel,
) -> OracleResult {
    let expected = if level == AggregationLevel::Full {
        model.expected_compliance()
    } else {
        BTreeMap::new()
    };
    let stored: BTreeMap<(String, String), ComplianceStatus> = snapshot
        .compliance
        .iter()
        .map(|r| ((r.policy_id.clone(), r.cluster_name.clone()), r.compliance))
        .collect();

    let violations = diff_maps(&expected, &stored)
        .into_iter()
        .map(|((policy_id, cluster), expected, stored)| InvariantViolation::Compliance {
            policy_id,
            cluster,
            expected,
            stored,
        })
        .collect();
    OracleResult::from_violations(violations)
}

/// Aggregates equal the model under `Minimal`, and are absent otherwise.
fn check_aggregates(
    model: &LeafHubModel,
    snapshot: &StoreSnapshot,
    level: AggregationLevel,
) -> OracleResult {
    let expected = if level == AggregationLevel::Minimal {
        model.expected_minimal()
    } else {
        BTreeMap::new()
    };
    let stored: BTreeMap<String, (String, u32, u32)> = snapshot
        .aggregated
        .iter()
        .map(|r| {
            (
                r.policy_id.clone(),
                (
                    r.remediation_action.clone(),
                    r.applied_clusters,
                    r.non_compliant_clusters,
                ),
            )
        })
        .collect();

    let violations = diff_maps(&expected, &stored)
        .into_iter()
        .map(|(policy_id, expected, stored)| InvariantViolation::Aggregate {
            policy_id,
            expected,
            stored,
        })
        .collect();
    OracleResult::from_violations(violations)
}

fn check_status_objects(model: &LeafHubModel, snapshot: &StoreSnapshot) -> OracleResult {
    let mut violations = Vec::new();
    for (kind, expected, rows) in [
        (
            MessageKind::PlacementDecisions,
            model.expected_placements(),
            &snapshot.placements,
        ),
        (
            MessageKind::LocalSpecPolicies,
            model.expected_local_policies(),
            &snapshot.local_policies,
        ),
    ] {
        let stored: BTreeMap<String, serde_json::Value> = rows
            .iter()
            .map(|r| (r.object_id.clone(), r.payload.clone()))
            .collect();
        violations.extend(diff_maps(&expected, &stored).into_iter().map(
            |(object_id, expected, stored)| InvariantViolation::StatusObject {
                kind,
                object_id,
                expected,
                stored,
            },
        ));
    }
    OracleResult::from_violations(violations)
}

/// Every model history entry is stored with its latest message and
/// timestamp, and stored counters never trail the producer's.
fn check_events(sim: &Simulator, snapshot: &StoreSnapshot) -> OracleResult {
    let stored: BTreeMap<(&str, &str, &str), &EventRow> = snapshot
        .policy_events
        .iter()
        .filter_map(|r| {
            r.cluster_id
                .as_deref()
                .map(|c| ((r.event_name.as_str(), r.policy_id.as_str(), c), r))
        })
        .collect();

    let mut violations = Vec::new();
    for event in sim.model().expected_events() {
        let key = (
            event.event_name.as_str(),
            event.policy_id.as_str(),
            event.cluster_id.as_str(),
        );
        let Some(row) = stored.get(&key) else {
            violations.push(InvariantViolation::MissingEvent {
                event_name: event.event_name.clone(),
                policy_id: event.policy_id.clone(),
                cluster_id: event.cluster_id.clone(),
            });
            continue;
        };
        if row.created_at_us != event.created_at_us {
            violations.push(InvariantViolation::EventDrift {
                event_name: event.event_name.clone(),
                policy_id: event.policy_id.clone(),
                field: "created_at",
                expected: event.created_at_us.to_string(),
                stored: row.created_at_us.to_string(),
            });
        }
        if row.message != event.message {
            violations.push(InvariantViolation::EventDrift {
                event_name: event.event_name.clone(),
                policy_id: event.policy_id.clone(),
                field: "message",
                expected: event.message.clone(),
                stored: row.message.clone(),
            });
        }
    }

    for cluster in sim.model().cluster_names() {
        for policy_id in sim.model().policy_ids() {
            let uid = LeafHubModel::replicated_uid(&policy_id, cluster);
            for produced in sim.bundles().policy_events.events_for(&uid) {
                let cluster_id = produced.cluster_id.as_deref().unwrap_or_default();
                let key = (
                    produced.event_name.as_str(),
                    produced.policy_id.as_str(),
                    cluster_id,
                );
                if let Some(row) = stored.get(&key) {
                    if row.count < produced.count {
                        violations.push(InvariantViolation::EventCount {
                            event_name: produced.event_name.clone(),
                            policy_id: produced.policy_id.clone(),
                            producer: produced.count,
                            stored: row.count,
                        });
                    }
                }
            }
        }
    }
    OracleResult::from_violations(violations)
}

/// Applied versions equal the last successful send of each scope.
fn check_versions(sim: &Simulator) -> anyhow::Result<OracleResult> {
    let mut violations = Vec::new();
    let mut check = |store: &Store, kind: MessageKind| -> anyhow::Result<()> {
        let stored = stored_version(&store.conn(), SIM_LEAF_HUB, kind)?;
        let last_sent = sim.dispatcher().last_sent(kind);
        if stored != last_sent {
            violations.push(InvariantViolation::Version {
                kind,
                last_sent,
                stored,
            });
        }
        Ok(())
    };
    for kind in VERSIONED_KINDS {
        check(sim.store(), kind)?;
    }
    // Complete bundles never depend on a base, so the newest always lands.
    check(sim.hybrid_store(), MessageKind::PolicyCompleteCompliance)?;
    Ok(OracleResult::from_violations(violations))
}

/// Complete and delta merges never invent a policy or cluster.
fn check_hybrid_rows(sim: &Simulator) -> anyhow::Result<OracleResult> {
    let policies: BTreeSet<String> = sim.model().policy_ids().into_iter().collect();
    let clusters: BTreeSet<&String> = sim.model().cluster_names().iter().collect();
    let rows = query::list_compliance(&sim.hybrid_store().conn(), Some(SIM_LEAF_HUB))?;
    let violations = rows
        .into_iter()
        .filter(|r| !policies.contains(&r.policy_id) || !clusters.contains(&r.cluster_name))
        .map(|r| InvariantViolation::PhantomCluster {
            policy_id: r.policy_id,
            cluster: r.cluster_name,
        })
        .collect();
    Ok(OracleResult::from_violations(violations))
}

/// Full-state bundles replayed in shuffled order into a fresh store leave the
/// same rows as the simulated delivery order.
fn check_commutativity(
    sim: &Simulator,
    snapshot: &StoreSnapshot,
    rng: &mut DeterministicRng,
) -> anyhow::Result<OracleResult> {
    let mut messages: Vec<TransportMessage> = sim
        .delivered()
        .iter()
        .filter(|m| {
            parse_transport_key(&m.key).is_ok_and(|(_, kind)| FULL_STATE_KINDS.contains(&kind))
        })
        .cloned()
        .collect();

    let level = SharedAggregationLevel::new(sim.config().aggregation_level);
    let registry = primary_registry(&level);
    let mut violations = Vec::new();
    for permutation_index in 0..PERMUTATIONS {
        rng.shuffle(&mut messages);
        let fresh = Store::open_in_memory()?;
        for message in &messages {
            registry.dispatch(message, &fresh)?;
        }
        let replayed = StoreSnapshot::take(&fresh)?;
        violations.extend(snapshot.diff(&replayed, true).into_iter().map(|table| {
            InvariantViolation::Commutativity {
                permutation_index,
                table,
            }
        }));
    }
    Ok(OracleResult::from_violations(violations))
}

/// Re-delivering every message leaves the store untouched.
fn check_idempotence(sim: &Simulator, before: &StoreSnapshot) -> anyhow::Result<OracleResult> {
    for message in sim.delivered() {
        sim.registry().dispatch(message, sim.store())?;
    }
    let after = StoreSnapshot::take(sim.store())?;
    let violations = before
        .diff(&after, false)
        .into_iter()
        .map(|table| InvariantViolation::Idempotence { table })
        .collect();
    Ok(OracleResult::from_violations(violations))
}

/// Keys where the two maps disagree, with each side's value.
fn diff_maps<K: Ord + Clone, V: PartialEq + Clone>(
    expected: &BTreeMap<K, V>,
    stored: &BTreeMap<K, V>,
) -> Vec<(K, Option<V>, Option<V>)> {
    let keys: BTreeSet<&K> = expected.keys().chain(stored.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let e = expected.get(key);
            let s = stored.get(key);
            (e != s).then(|| (key.clone(), e.cloned(), s.cloned()))
        })
        .collect()
}
