//! Wiring of every bundle a leaf hub reports.
//!
//! [`LeafHubBundles`] is what the watch side talks to: it fans each watched
//! object out to all bundles and builds the [`Dispatcher`] that sends them.

use std::sync::Arc;

use crate::bundle::Bundle;
use crate::bundle::compliance::ComplianceTracker;
use crate::bundle::events::{EventBundleError, EventScope, IdentityResolver, PolicyEventBundle};
use crate::bundle::object::ObjectBundle;
use crate::bundle::projection;
use crate::config::{EventsConfig, ProducerConfig};
use crate::dispatch::Dispatcher;
use crate::object::WatchedObject;
use crate::registry::{AggregationLevel, SharedAggregationLevel};
use crate::wire::{MessageKind, MinimalPolicyComplianceStatus, StatusObject};

/// All producer bundles of one leaf hub.
#[derive(Debug)]
pub struct LeafHubBundles {
    leaf_hub_name: String,
    pub placement_decisions: Arc<ObjectBundle<StatusObject>>,
    pub local_spec_policies: Arc<ObjectBundle<StatusObject>>,
    pub compliance: ComplianceTracker,
    pub minimal_compliance: Arc<ObjectBundle<MinimalPolicyComplianceStatus>>,
    pub policy_events: Arc<PolicyEventBundle>,
    pub root_policy_events: Arc<PolicyEventBundle>,
}

impl LeafHubBundles {
    /// Create every bundle at generation 0 of `incarnation`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBundleError`] if the configured compliance pattern is
    /// invalid.
    pub fn new(
        producer: &ProducerConfig,
        events: &EventsConfig,
        incarnation: u64,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self, EventBundleError> {
        let hub = producer.leaf_hub_name.as_str();
        Ok(Self {
            leaf_hub_name: hub.to_string(),
            placement_decisions: Arc::new(projection::placement_decisions_bundle(hub, incarnation)),
            local_spec_policies: Arc::new(projection::local_spec_policies_bundle(hub, incarnation)),
            compliance: ComplianceTracker::new(hub, incarnation, producer.delta_switch_factor),
            minimal_compliance: Arc::new(projection::minimal_compliance_bundle(hub, incarnation)),
            policy_events: Arc::new(PolicyEventBundle::new(
                hub,
                incarnation,
                EventScope::Cluster,
                Arc::clone(&resolver),
                &events.compliance_pattern,
            )?),
            root_policy_events: Arc::new(PolicyEventBundle::new(
                hub,
                incarnation,
                EventScope::Root,
                resolver,
                &events.compliance_pattern,
            )?),
        })
    }

    #[must_use]
    pub fn leaf_hub_name(&self) -> &str {
        &self.leaf_hub_name
    }

    fn bundles(&self) -> [&dyn Bundle; 5] {
        [
            self.placement_decisions.as_ref(),
            self.local_spec_policies.as_ref(),
            self.minimal_compliance.as_ref(),
            self.policy_events.as_ref(),
            self.root_policy_events.as_ref(),
        ]
    }

    /// Hand a created or updated object to every bundle.
    pub fn update_object(&self, object: &WatchedObject) {
        for bundle in self.bundles() {
            bundle.update_object(object);
        }
        self.compliance.update_object(object);
    }

    /// Hand a deleted object to every bundle.
    pub fn delete_object(&self, object: &WatchedObject) {
        for bundle in self.bundles() {
            bundle.delete_object(object);
        }
        self.compliance.delete_object(object);
    }

    /// Build a dispatcher over every bundle. Compliance bundles are gated on
    /// `level`; the complete view is registered ahead of the delta view so a
    /// cut is taken before the delta is read on the same tick.
    #[must_use]
    pub fn dispatcher(&self, level: &SharedAggregationLevel) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(self.leaf_hub_name.clone());
        dispatcher.register(
            MessageKind::PlacementDecisions,
            Arc::clone(&self.placement_decisions) as Arc<dyn Bundle>,
        );
        dispatcher.register(
            MessageKind::LocalSpecPolicies,
            Arc::clone(&self.local_spec_policies) as Arc<dyn Bundle>,
        );

        let full = |level: &SharedAggregationLevel| {
            let level = level.clone();
            Box::new(move || level.get() == AggregationLevel::Full)
        };
        dispatcher.register_when(
            MessageKind::ClustersPerPolicy,
            self.compliance.clusters_per_policy(),
            full(level),
        );
        dispatcher.register_when(
            MessageKind::PolicyCompleteCompliance,
            self.compliance.complete(),
            full(level),
        );
        dispatcher.register_when(
            MessageKind::PolicyDeltaCompliance,
            self.compliance.delta(),
            full(level),
        );

        let minimal = level.clone();
        dispatcher.register_when(
            MessageKind::MinimalPolicyCompliance,
            Arc::clone(&self.minimal_compliance) as Arc<dyn Bundle>,
            Box::new(move || minimal.get() == AggregationLevel::Minimal),
        );

        dispatcher.register(
            MessageKind::PolicyHistoryEvents,
            Arc::clone(&self.policy_events) as Arc<dyn Bundle>,
        );
        dispatcher.register(
            MessageKind::RootPolicyEvents,
            Arc::clone(&self.root_policy_events) as Arc<dyn Bundle>,
        );
        dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::events::StaticResolver;
    use crate::object::{ClusterComplianceStatus, ObjectMeta, Policy, PolicyStatus};
    use crate::transport::InMemoryProducer;

    fn root_policy() -> WatchedObject {
        WatchedObject::Policy(Policy {
            metadata: ObjectMeta {
                uid: "p1".into(),
                name: "root".into(),
                namespace: "default".into(),
                ..ObjectMeta::default()
            },
            status: PolicyStatus {
                status: vec![ClusterComplianceStatus {
                    cluster_name: "c1".into(),
                    compliant: "NonCompliant".into(),
                }],
                details: None,
            },
            ..Policy::default()
        })
    }

    fn bundles() -> LeafHubBundles {
        LeafHubBundles::new(
            &ProducerConfig::default(),
            &EventsConfig::default(),
            1,
            Arc::new(StaticResolver::new()),
        )
        .expect("bundles")
    }

    fn sent_kinds(producer: &InMemoryProducer) -> Vec<String> {
        let mut keys: Vec<_> = producer.drain().into_iter().map(|m| m.key).collect();
        keys.sort();
        keys
    }

    #[test]
    fn full_level_sends_per_cluster_bundles() {
        let bundles = bundles();
        let level = SharedAggregationLevel::new(AggregationLevel::Full);
        let mut dispatcher = bundles.dispatcher(&level);
        let producer = InMemoryProducer::new();

        bundles.update_object(&root_policy());
        dispatcher.tick(&producer);
        assert_eq!(
            sent_kinds(&producer),
            vec![
                "hub1.ClustersPerPolicy",
                "hub1.LocalSpecPolicies",
                "hub1.PlacementDecisions",
                "hub1.PolicyCompleteCompliance",
                "hub1.PolicyHistoryEvents",
                "hub1.RootPolicyEvents",
            ]
        );
    }

    #[test]
    fn minimal_level_sends_counts_only() {
        let bundles = bundles();
        let level = SharedAggregationLevel::new(AggregationLevel::Minimal);
        let mut dispatcher = bundles.dispatcher(&level);
        let producer = InMemoryProducer::new();

        bundles.update_object(&root_policy());
        dispatcher.tick(&producer);
        // Every bundle announces its state once, even when still empty.
        assert_eq!(
            sent_kinds(&producer),
            vec![
                "hub1.LocalSpecPolicies",
                "hub1.MinimalPolicyCompliance",
                "hub1.PlacementDecisions",
                "hub1.PolicyHistoryEvents",
                "hub1.RootPolicyEvents",
            ]
        );
    }
}
