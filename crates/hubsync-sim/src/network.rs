use std::sync::Mutex;

use hubsync_core::transport::{Producer, TransportMessage};
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Transport fault knobs. Delivery is at-least-once, so there is no drop
/// rate; a send can fail outright and the dispatcher retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    pub max_delay_rounds: u8,
    pub duplicate_rate_percent: u8,
    pub reorder_rate_percent: u8,
    pub send_failure_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 3,
            duplicate_rate_percent: 10,
            reorder_rate_percent: 25,
            send_failure_rate_percent: 5,
        }
    }
}

impl FaultConfig {
    /// No faults at all: every send is delivered once, in order, next round.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_delay_rounds: 0,
            duplicate_rate_percent: 0,
            reorder_rate_percent: 0,
            send_failure_rate_percent: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight<T> {
    deliver_at_round: u64,
    message: T,
}

/// Result of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub duplicated: bool,
    pub delay_rounds: u8,
}

/// Messages delivered in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome<T> {
    pub delivered: Vec<T>,
    pub reordered: bool,
}

/// Delay/duplicate/reorder queue for any message value.
#[derive(Debug, Clone)]
pub struct SimulatedNetwork<T> {
    in_flight: Vec<InFlight<T>>,
    fault: FaultConfig,
}

impl<T: Clone> SimulatedNetwork<T> {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            in_flight: Vec::new(),
            fault,
        }
    }

    pub fn send(&mut self, message: T, current_round: u64, rng: &mut DeterministicRng) -> SendOutcome {
        let delay_rounds = self.sample_delay(rng);
        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);

        self.in_flight.push(InFlight {
            deliver_at_round: current_round + 1 + u64::from(delay_rounds),
            message: message.clone(),
        });
        if duplicated {
            let extra = self.sample_delay(rng);
            self.in_flight.push(InFlight {
                deliver_at_round: current_round + 1 + u64::from(extra),
                message,
            });
        }

        SendOutcome {
            duplicated,
            delay_rounds,
        }
    }

    /// Take everything due by `current_round`, in send order unless the
    /// reorder fault fires.
    pub fn deliver_ready(
        &mut self,
        current_round: u64,
        rng: &mut DeterministicRng,
    ) -> DeliverOutcome<T> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|m| m.deliver_at_round <= current_round);
        self.in_flight = waiting;

        let mut delivered: Vec<T> = ready.into_iter().map(|m| m.message).collect();
        let reordered =
            delivered.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut delivered);
        }

        DeliverOutcome {
            delivered,
            reordered,
        }
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn sample_delay(&self, rng: &mut DeterministicRng) -> u8 {
        if self.fault.max_delay_rounds == 0 {
            return 0;
        }
        u8::try_from(rng.next_bounded(u64::from(self.fault.max_delay_rounds) + 1)).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Producer adapter
// ---------------------------------------------------------------------------

/// Send counters of a [`SimTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub sent: u64,
    pub rejected: u64,
    pub duplicated: u64,
    pub reordered_rounds: u64,
}

#[derive(Debug)]
struct TransportState {
    network: SimulatedNetwork<TransportMessage>,
    rng: DeterministicRng,
    round: u64,
    fault: FaultConfig,
    stats: TransportStats,
    rejections_enabled: bool,
}

/// Send rejected by fault injection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("simulated broker rejected send of {key}")]
pub struct SendRejected {
    pub key: String,
}

/// [`Producer`] backed by a [`SimulatedNetwork`].
#[derive(Debug)]
pub struct SimTransport {
    state: Mutex<TransportState>,
}

impl SimTransport {
    #[must_use]
    pub const fn new(fault: FaultConfig, seed: u64) -> Self {
        Self {
            state: Mutex::new(TransportState {
                network: SimulatedNetwork::new(fault),
                rng: DeterministicRng::new(seed),
                round: 0,
                fault,
                stats: TransportStats {
                    sent: 0,
                    rejected: 0,
                    duplicated: 0,
                    reordered_rounds: 0,
                },
                rejections_enabled: true,
            }),
        }
    }

    pub fn set_round(&self, round: u64) {
        self.with_state(|s| s.round = round);
    }

    /// Turn send-failure injection on or off. Draining runs with it off so a
    /// run always quiesces.
    pub fn set_rejections(&self, enabled: bool) {
        self.with_state(|s| s.rejections_enabled = enabled);
    }

    /// Deliver everything due in the current round.
    pub fn deliver_ready(&self) -> Vec<TransportMessage> {
        self.with_state(|s| {
            let round = s.round;
            let outcome = s.network.deliver_ready(round, &mut s.rng);
            if outcome.reordered {
                s.stats.reordered_rounds += 1;
            }
            outcome.delivered
        })
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.with_state(|s| s.network.in_flight_len())
    }

    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.with_state(|s| s.stats)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TransportState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Producer for SimTransport {
    type Error = SendRejected;

    fn send(&self, message: &TransportMessage) -> Result<(), Self::Error> {
        self.with_state(|s| {
            if s.rejections_enabled && s.rng.hit_rate_percent(s.fault.send_failure_rate_percent) {
                s.stats.rejected += 1;
                return Err(SendRejected {
                    key: message.key.clone(),
                });
            }
            let round = s.round;
            let outcome = s.network.send(message.clone(), round, &mut s.rng);
            s.stats.sent += 1;
            if outcome.duplicated {
                s.stats.duplicated += 1;
            }
            Ok(())
        })
    }
}
