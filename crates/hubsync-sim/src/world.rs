//! Ground-truth model of one leaf hub.
//!
//! The model owns the real state of every policy, cluster membership and
//! placement decision. Mutations return the watch [`Change`]s a leaf hub
//! would observe, and the `expected_*` accessors give the store contents a
//! converged consumer must hold.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, TimeZone, Utc};
use hubsync_core::bundle::events::StaticResolver;
use hubsync_core::object::{
    CLUSTER_NAME_LABEL, ClusterComplianceStatus, ClusterDecision, ComplianceHistory,
    DetailStatus, ObjectMeta, PlacementDecision, Policy, PolicyStatus, ROOT_POLICY_LABEL,
    RemediationAction, WatchedObject,
};
use hubsync_core::wire::ComplianceStatus;

use crate::rng::DeterministicRng;

const NAMESPACE: &str = "default";
const POLICY_STATES: [&str; 3] = ["Compliant", "NonCompliant", ""];
/// Event names cycle over this many slots per cluster, so names recur.
const EVENT_NAME_SLOTS: u64 = 4;
/// History entries kept per replicated policy, newest first.
const HISTORY_DEPTH: usize = 3;

/// A watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(WatchedObject),
    Delete(WatchedObject),
}

#[derive(Debug, Clone)]
struct ClusterState {
    compliant: String,
    history: Vec<ComplianceHistory>,
}

#[derive(Debug, Clone)]
struct PolicyModel {
    uid: String,
    name: String,
    remediation: RemediationAction,
    clusters: BTreeMap<String, ClusterState>,
}

impl PolicyModel {
    fn namespaced_name(&self) -> String {
        format!("{NAMESPACE}.{}", self.name)
    }
}

#[derive(Debug, Clone)]
struct PlacementModel {
    uid: String,
    name: String,
    clusters: BTreeSet<String>,
}

/// One event the consumer must hold after convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEvent {
    pub event_name: String,
    pub policy_id: String,
    pub cluster_id: String,
    pub message: String,
    pub created_at_us: i64,
}

/// Ground truth for one leaf hub.
#[derive(Debug, Clone)]
pub struct LeafHubModel {
    clusters: Vec<String>,
    policies: Vec<PolicyModel>,
    placements: Vec<PlacementModel>,
    epoch: DateTime<Utc>,
    clock: u64,
}

impl LeafHubModel {
    /// Build `policy_count` policies over `cluster_count` clusters. Every
    /// policy starts bound to every cluster in the pending state.
    #[must_use]
    pub fn new(policy_count: usize, cluster_count: usize) -> Self {
        let clusters: Vec<String> = (0..cluster_count).map(|i| format!("cluster-{i}")).collect();
        let policies = (0..policy_count)
            .map(|i| PolicyModel {
                uid: format!("policy-uid-{i}"),
                name: format!("policy-{i}"),
                remediation: if i % 2 == 0 {
                    RemediationAction::Inform
                } else {
                    RemediationAction::Enforce
                },
                clusters: clusters
                    .iter()
                    .map(|c| {
                        (
                            c.clone(),
                            ClusterState {
                                compliant: String::new(),
                                history: Vec::new(),
                            },
                        )
                    })
                    .collect(),
            })
            .collect();
        let placements = (0..policy_count)
            .map(|i| PlacementModel {
                uid: format!("placement-uid-{i}"),
                name: format!("placement-{i}"),
                clusters: clusters.iter().cloned().collect(),
            })
            .collect();

        Self {
            clusters,
            policies,
            placements,
            epoch: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            clock: 0,
        }
    }

    /// Resolver mapping every policy and cluster in the model.
    #[must_use]
    pub fn resolver(&self) -> StaticResolver {
        let resolver = self
            .policies
            .iter()
            .fold(StaticResolver::new(), |r, p| r.with_policy(&p.namespaced_name(), &p.uid));
        self.clusters
            .iter()
            .fold(resolver, |r, c| r.with_cluster(c, &cluster_id(c)))
    }

    #[must_use]
    pub fn cluster_names(&self) -> &[String] {
        &self.clusters
    }

    #[must_use]
    pub fn policy_ids(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.uid.clone()).collect()
    }

    /// Every object currently present, as a fresh watch would list them.
    #[must_use]
    pub fn all_objects(&self) -> Vec<WatchedObject> {
        let mut objects = Vec::new();
        for policy in &self.policies {
            objects.push(root_policy_object(policy));
            for (cluster, state) in &policy.clusters {
                objects.push(replicated_policy_object(policy, cluster, state));
            }
        }
        objects.extend(self.placements.iter().map(placement_object));
        objects
    }

    /// Apply one random mutation and return what the watch would report.
    pub fn mutate(&mut self, rng: &mut DeterministicRng) -> Vec<Change> {
        if self.policies.is_empty() || self.clusters.is_empty() {
            return Vec::new();
        }
        match rng.next_bounded(10) {
            0..=5 => self.change_compliance(rng),
            6..=7 => self.toggle_membership(rng),
            _ => self.toggle_placement(rng),
        }
    }

    fn change_compliance(&mut self, rng: &mut DeterministicRng) -> Vec<Change> {
        let p = rng.next_index(self.policies.len());
        let members: Vec<String> = self.policies[p].clusters.keys().cloned().collect();
        if members.is_empty() {
            return self.toggle_membership(rng);
        }
        let cluster = members[rng.next_index(members.len())].clone();
        let new_state = POLICY_STATES[rng.next_index(POLICY_STATES.len())];

        self.clock += 1;
        let clock = self.clock;
        let timestamp = self.epoch + Duration::seconds(i64::try_from(clock).unwrap_or(i64::MAX));
        let policy = &mut self.policies[p];
        let event_name = format!("{}.{cluster}.{}", policy.name, clock % EVENT_NAME_SLOTS);
        let label = if new_state.is_empty() { "Pending" } else { new_state };

        let Some(state) = policy.clusters.get_mut(&cluster) else {
            return Vec::new();
        };
        state.compliant = new_state.to_string();
        state.history.retain(|h| h.event_name != event_name);
        state.history.insert(
            0,
            ComplianceHistory {
                event_name,
                last_timestamp: timestamp,
                message: format!("{label}; observed at tick {clock}"),
            },
        );
        state.history.truncate(HISTORY_DEPTH);

        let policy = &self.policies[p];
        let mut changes = vec![Change::Upsert(root_policy_object(policy))];
        if let Some(state) = policy.clusters.get(&cluster) {
            changes.push(Change::Upsert(replicated_policy_object(policy, &cluster, state)));
        }
        changes
    }

    fn toggle_membership(&mut self, rng: &mut DeterministicRng) -> Vec<Change> {
        let p = rng.next_index(self.policies.len());
        let cluster = self.clusters[rng.next_index(self.clusters.len())].clone();
        let policy = &mut self.policies[p];

        if let Some(state) = policy.clusters.remove(&cluster) {
            let replicated = replicated_policy_object(policy, &cluster, &state);
            vec![
                Change::Upsert(root_policy_object(policy)),
                Change::Delete(replicated),
            ]
        } else {
            let state = ClusterState {
                compliant: String::new(),
                history: Vec::new(),
            };
            let replicated = replicated_policy_object(policy, &cluster, &state);
            policy.clusters.insert(cluster, state);
            vec![
                Change::Upsert(root_policy_object(policy)),
                Change::Upsert(replicated),
            ]
        }
    }

    fn toggle_placement(&mut self, rng: &mut DeterministicRng) -> Vec<Change> {
        if self.placements.is_empty() {
            return Vec::new();
        }
        let i = rng.next_index(self.placements.len());
        let cluster = self.clusters[rng.next_index(self.clusters.len())].clone();
        let placement = &mut self.placements[i];
        if !placement.clusters.remove(&cluster) {
            placement.clusters.insert(cluster);
        }
        vec![Change::Upsert(placement_object(placement))]
    }

    // -----------------------------------------------------------------------
    // Expectations
    // -----------------------------------------------------------------------

    /// `(policy_id, cluster) -> status` for every bound cluster.
    #[must_use]
    pub fn expected_compliance(&self) -> BTreeMap<(String, String), ComplianceStatus> {
        self.policies
            .iter()
            .flat_map(|p| {
                p.clusters.iter().map(|(cluster, state)| {
                    (
                        (p.uid.clone(), cluster.clone()),
                        ComplianceStatus::from_policy_state(&state.compliant),
                    )
                })
            })
            .collect()
    }

    /// `policy_id -> (remediation, applied, non_compliant)`.
    #[must_use]
    pub fn expected_minimal(&self) -> BTreeMap<String, (String, u32, u32)> {
        self.policies
            .iter()
            .map(|p| {
                let applied = count(p.clusters.len());
                let non_compliant = count(
                    p.clusters
                        .values()
                        .filter(|s| s.compliant == "NonCompliant")
                        .count(),
                );
                let remediation = match p.remediation {
                    RemediationAction::Inform => "inform",
                    RemediationAction::Enforce => "enforce",
                };
                (p.uid.clone(), (remediation.to_string(), applied, non_compliant))
            })
            .collect()
    }

    /// `placement uid -> payload` of every placement decision.
    #[must_use]
    pub fn expected_placements(&self) -> BTreeMap<String, serde_json::Value> {
        self.placements
            .iter()
            .filter_map(|p| match placement_object(p) {
                WatchedObject::PlacementDecision(decision) => serde_json::to_value(&decision)
                    .ok()
                    .map(|payload| (p.uid.clone(), payload)),
                _ => None,
            })
            .collect()
    }

    /// `policy uid -> payload` of every locally authored policy.
    #[must_use]
    pub fn expected_local_policies(&self) -> BTreeMap<String, serde_json::Value> {
        self.policies
            .iter()
            .map(|p| {
                (
                    p.uid.clone(),
                    serde_json::json!({
                        "name": p.name,
                        "namespace": NAMESPACE,
                        "labels": {},
                        "remediationAction": p.remediation,
                    }),
                )
            })
            .collect()
    }

    /// Every history entry of a currently bound cluster.
    #[must_use]
    pub fn expected_events(&self) -> Vec<ExpectedEvent> {
        self.policies
            .iter()
            .flat_map(|p| {
                p.clusters.iter().flat_map(move |(cluster, state)| {
                    state.history.iter().map(move |h| ExpectedEvent {
                        event_name: h.event_name.clone(),
                        policy_id: p.uid.clone(),
                        cluster_id: cluster_id(cluster),
                        message: h.message.clone(),
                        created_at_us: h.last_timestamp.timestamp_micros(),
                    })
                })
            })
            .collect()
    }

    /// UID of the replicated policy of `policy_id` on `cluster`.
    #[must_use]
    pub fn replicated_uid(policy_id: &str, cluster: &str) -> String {
        format!("{policy_id}-{cluster}")
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn cluster_id(cluster: &str) -> String {
    format!("id-{cluster}")
}

fn root_policy_object(policy: &PolicyModel) -> WatchedObject {
    WatchedObject::Policy(Policy {
        metadata: ObjectMeta {
            uid: policy.uid.clone(),
            name: policy.name.clone(),
            namespace: NAMESPACE.to_string(),
            labels: BTreeMap::new(),
        },
        remediation_action: policy.remediation,
        status: PolicyStatus {
            status: policy
                .clusters
                .iter()
                .map(|(cluster, state)| ClusterComplianceStatus {
                    cluster_name: cluster.clone(),
                    compliant: state.compliant.clone(),
                })
                .collect(),
            details: None,
        },
    })
}

fn replicated_policy_object(policy: &PolicyModel, cluster: &str, state: &ClusterState) -> WatchedObject {
    let root = policy.namespaced_name();
    WatchedObject::Policy(Policy {
        metadata: ObjectMeta {
            uid: LeafHubModel::replicated_uid(&policy.uid, cluster),
            name: root.clone(),
            namespace: cluster.to_string(),
            labels: BTreeMap::from([
                (ROOT_POLICY_LABEL.to_string(), root),
                (CLUSTER_NAME_LABEL.to_string(), cluster.to_string()),
            ]),
        },
        remediation_action: policy.remediation,
        status: PolicyStatus {
            status: Vec::new(),
            details: Some(vec![DetailStatus {
                compliance_state: state.compliant.clone(),
                history: Some(state.history.clone()),
            }]),
        },
    })
}

fn placement_object(placement: &PlacementModel) -> WatchedObject {
    WatchedObject::PlacementDecision(PlacementDecision {
        metadata: ObjectMeta {
            uid: placement.uid.clone(),
            name: placement.name.clone(),
            namespace: NAMESPACE.to_string(),
            labels: BTreeMap::new(),
        },
        decisions: placement
            .clusters
            .iter()
            .map(|c| ClusterDecision {
                cluster_name: c.clone(),
                reason: String::new(),
            })
            .collect(),
    })
}
