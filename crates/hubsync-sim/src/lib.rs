//! hubsync-sim library.
//!
//! Drives one leaf hub's producer bundles through a fault-injecting transport
//! into a consumer store, then checks the store against a ground-truth model.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod world;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use hubsync_core::config::{EventsConfig, ProducerConfig};
use hubsync_core::db::Store;
use hubsync_core::dispatch::{Dispatcher, TickReport};
use hubsync_core::merge::ApplyOutcome;
use hubsync_core::producer::LeafHubBundles;
use hubsync_core::registry::{
    AggregationLevel, ConsumerRegistry, DispatchOutcome, SharedAggregationLevel,
};
use hubsync_core::transport::{TransportMessage, parse_transport_key};
use hubsync_core::wire::MessageKind;
use serde::{Deserialize, Serialize};

use crate::network::{FaultConfig, SimTransport, TransportStats};
use crate::rng::DeterministicRng;
use crate::world::{Change, LeafHubModel};

/// Leaf hub name used by every simulation.
pub const SIM_LEAF_HUB: &str = "sim-hub";

/// Kinds merged into the secondary store. Complete and delta write the same
/// compliance rows as clusters-per-policy, with no ordering across keys.
pub const HYBRID_KINDS: [MessageKind; 2] = [
    MessageKind::PolicyCompleteCompliance,
    MessageKind::PolicyDeltaCompliance,
];

/// Parameters of one simulated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub rounds: u64,
    pub policies: usize,
    pub clusters: usize,
    /// Mutations attempted per round.
    pub mutations_per_round: usize,
    pub mutation_rate_percent: u8,
    /// Chance per round that the producer restarts with a new incarnation.
    pub restart_rate_percent: u8,
    pub aggregation_level: AggregationLevel,
    pub delta_switch_factor: u64,
    pub fault: FaultConfig,
    pub max_drain_rounds: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rounds: 24,
            policies: 3,
            clusters: 4,
            mutations_per_round: 2,
            mutation_rate_percent: 60,
            restart_rate_percent: 5,
            aggregation_level: AggregationLevel::Full,
            delta_switch_factor: 3,
            fault: FaultConfig::default(),
            max_drain_rounds: 64,
        }
    }
}

/// Merge outcome counters over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub applied: u64,
    pub stale: u64,
    pub base_mismatch: u64,
    pub ignored: u64,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Merged(ApplyOutcome::Applied { .. }) => self.applied += 1,
            DispatchOutcome::Merged(ApplyOutcome::Stale { .. }) => self.stale += 1,
            DispatchOutcome::Merged(ApplyOutcome::BaseMismatch { .. }) => self.base_mismatch += 1,
            DispatchOutcome::Ignored(_) => self.ignored += 1,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub rounds_run: u64,
    pub drain_rounds: u64,
    pub restarts: u64,
    pub final_incarnation: u64,
    pub transport: TransportStats,
    pub outcomes: OutcomeCounts,
}

impl SimulationResult {
    /// A run that saw stale bundles arrive after a restart or a reordered
    /// delivery.
    #[must_use]
    pub const fn interesting_state_reached(&self) -> bool {
        self.outcomes.stale > 0 && (self.restarts > 0 || self.transport.reordered_rounds > 0)
    }
}

/// One leaf hub, its transport, and the consumer stores it feeds.
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    model: LeafHubModel,
    level: SharedAggregationLevel,
    incarnation: u64,
    restarts: u64,
    bundles: LeafHubBundles,
    dispatcher: Dispatcher,
    transport: SimTransport,
    store: Store,
    hybrid_store: Store,
    registry: ConsumerRegistry,
    hybrid_registry: ConsumerRegistry,
    delivered: Vec<TransportMessage>,
    outcomes: OutcomeCounts,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("seed", &self.config.seed)
            .field("incarnation", &self.incarnation)
            .field("delivered", &self.delivered.len())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Build a simulator from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is empty or a store cannot be opened.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.policies == 0 || config.clusters == 0 {
            bail!("simulation needs at least one policy and one cluster");
        }
        let model = LeafHubModel::new(config.policies, config.clusters);
        let level = SharedAggregationLevel::new(config.aggregation_level);
        let incarnation = 1;
        let bundles = build_bundles(&config, &model, incarnation)?;
        let dispatcher = bundles.dispatcher(&level);

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            transport: SimTransport::new(config.fault, config.seed.wrapping_add(0x5EED)),
            store: Store::open_in_memory().context("open consumer store")?,
            hybrid_store: Store::open_in_memory().context("open hybrid store")?,
            registry: primary_registry(&level),
            hybrid_registry: hybrid_registry(),
            delivered: Vec::new(),
            outcomes: OutcomeCounts::default(),
            restarts: 0,
            config,
            model,
            level,
            incarnation,
            bundles,
            dispatcher,
        })
    }

    /// Run every round, then drain the transport with send failures off.
    ///
    /// # Errors
    ///
    /// Returns an error if a delivered message cannot be dispatched or the
    /// transport does not quiesce within `max_drain_rounds`.
    pub fn run(&mut self) -> Result<SimulationResult> {
        self.feed_all();

        let mut round = 0_u64;
        for _ in 0..self.config.rounds {
            round += 1;
            self.transport.set_round(round);
            for _ in 0..self.config.mutations_per_round {
                if self.rng.hit_rate_percent(self.config.mutation_rate_percent) {
                    for change in self.model.mutate(&mut self.rng) {
                        self.apply_change(&change);
                    }
                }
            }
            if self.rng.hit_rate_percent(self.config.restart_rate_percent) {
                self.restart()?;
            }
            self.tick_and_deliver()?;
        }

        self.transport.set_rejections(false);
        let mut drain_rounds = 0_u64;
        loop {
            if drain_rounds >= self.config.max_drain_rounds {
                bail!("transport did not quiesce after {drain_rounds} drain rounds");
            }
            round += 1;
            drain_rounds += 1;
            self.transport.set_round(round);
            let report = self.tick_and_deliver()?;
            if report.sent == 0 && report.failed == 0 && self.transport.in_flight_len() == 0 {
                break;
            }
        }

        tracing::debug!(
            seed = self.config.seed,
            restarts = self.restarts,
            delivered = self.delivered.len(),
            "simulation drained"
        );

        Ok(SimulationResult {
            seed: self.config.seed,
            rounds_run: self.config.rounds,
            drain_rounds,
            restarts: self.restarts,
            final_incarnation: self.incarnation,
            transport: self.transport.stats(),
            outcomes: self.outcomes,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors for the oracle
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub const fn model(&self) -> &LeafHubModel {
        &self.model
    }

    #[must_use]
    pub const fn bundles(&self) -> &LeafHubBundles {
        &self.bundles
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Store fed everything except complete and delta bundles.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Store fed only complete and delta bundles.
    #[must_use]
    pub const fn hybrid_store(&self) -> &Store {
        &self.hybrid_store
    }

    #[must_use]
    pub const fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// Every message delivered to the primary store, in delivery order.
    #[must_use]
    pub fn delivered(&self) -> &[TransportMessage] {
        &self.delivered
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn feed_all(&self) {
        for object in self.model.all_objects() {
            self.bundles.update_object(&object);
        }
    }

    fn apply_change(&self, change: &Change) {
        match change {
            Change::Upsert(object) => self.bundles.update_object(object),
            Change::Delete(object) => self.bundles.delete_object(object),
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.incarnation += 1;
        self.restarts += 1;
        self.bundles = build_bundles(&self.config, &self.model, self.incarnation)?;
        self.dispatcher = self.bundles.dispatcher(&self.level);
        self.feed_all();
        tracing::debug!(incarnation = self.incarnation, "producer restarted");
        Ok(())
    }

    fn tick_and_deliver(&mut self) -> Result<TickReport> {
        let report = self.dispatcher.tick(&self.transport);
        for message in self.transport.deliver_ready() {
            let (_, kind) = parse_transport_key(&message.key)
                .with_context(|| format!("simulated key {}", message.key))?;
            let outcome = if HYBRID_KINDS.contains(&kind) {
                self.hybrid_registry.dispatch(&message, &self.hybrid_store)
            } else {
                self.registry.dispatch(&message, &self.store)
            }
            .with_context(|| format!("dispatch {} v{}", message.key, message.version))?;
            self.outcomes.record(outcome);
            if !HYBRID_KINDS.contains(&kind) {
                self.delivered.push(message);
            }
        }
        Ok(report)
    }
}

fn build_bundles(
    config: &SimulationConfig,
    model: &LeafHubModel,
    incarnation: u64,
) -> Result<LeafHubBundles> {
    let producer = ProducerConfig {
        leaf_hub_name: SIM_LEAF_HUB.to_string(),
        delta_switch_factor: config.delta_switch_factor,
        ..ProducerConfig::default()
    };
    LeafHubBundles::new(
        &producer,
        &EventsConfig::default(),
        incarnation,
        Arc::new(model.resolver()),
    )
    .context("build producer bundles")
}

/// Consumer registry for everything but complete and delta.
#[must_use]
pub fn primary_registry(level: &SharedAggregationLevel) -> ConsumerRegistry {
    let mut registry = ConsumerRegistry::new();
    let full = level.clone();
    registry.register_when(
        MessageKind::ClustersPerPolicy,
        Box::new(move || full.get() == AggregationLevel::Full),
    );
    let minimal = level.clone();
    registry.register_when(
        MessageKind::MinimalPolicyCompliance,
        Box::new(move || minimal.get() == AggregationLevel::Minimal),
    );
    for kind in [
        MessageKind::PolicyHistoryEvents,
        MessageKind::RootPolicyEvents,
        MessageKind::PlacementDecisions,
        MessageKind::LocalSpecPolicies,
    ] {
        registry.register_when(kind, Box::new(|| true));
    }
    registry
}

fn hybrid_registry() -> ConsumerRegistry {
    let mut registry = ConsumerRegistry::new();
    for kind in HYBRID_KINDS {
        registry.register_when(kind, Box::new(|| true));
    }
    registry
}
