//! Consumer-side routing from transport messages to the merge engine.
//!
//! A message's key names the leaf hub and the message kind. The
//! [`ConsumerRegistry`] looks the kind up, evaluates its predicate, decodes the
//! payload and hands the bundle to the [`Store`]. Unknown kinds and kinds
//! whose predicate is false are ignored without error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::error::ErrorCode;
use crate::merge::{ApplyOutcome, MergeError, StatusBundle};
use crate::transport::{KeyError, STATUS_BUNDLE_MSG_TYPE, TransportMessage, parse_transport_key};
use crate::wire::MessageKind;

// ---------------------------------------------------------------------------
// Aggregation level
// ---------------------------------------------------------------------------

/// Granularity at which compliance is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationLevel {
    /// Per-cluster rows from clusters-per-policy, complete and delta.
    #[default]
    Full,
    /// Per-policy counts only.
    Minimal,
}

impl AggregationLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Minimal => 1,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Minimal,
            _ => Self::Full,
        }
    }
}

impl fmt::Display for AggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown aggregation level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAggregationLevel {
    pub raw: String,
}

impl fmt::Display for UnknownAggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown aggregation level '{}': expected full or minimal",
            self.raw
        )
    }
}

impl std::error::Error for UnknownAggregationLevel {}

impl FromStr for AggregationLevel {
    type Err = UnknownAggregationLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "minimal" => Ok(Self::Minimal),
            _ => Err(UnknownAggregationLevel { raw: s.to_string() }),
        }
    }
}

/// Aggregation level shared between configuration and registry predicates.
#[derive(Debug, Clone, Default)]
pub struct SharedAggregationLevel(Arc<AtomicU8>);

impl SharedAggregationLevel {
    #[must_use]
    pub fn new(level: AggregationLevel) -> Self {
        Self(Arc::new(AtomicU8::new(level.to_u8())))
    }

    #[must_use]
    pub fn get(&self) -> AggregationLevel {
        AggregationLevel::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, level: AggregationLevel) {
        self.0.store(level.to_u8(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// Decodes a payload of the registered kind.
pub type Decoder = fn(MessageKind, &[u8]) -> Result<StatusBundle, serde_json::Error>;

/// Gate evaluated per message.
pub type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

/// How one message kind is consumed.
pub struct Registration {
    pub kind: MessageKind,
    pub decode: Decoder,
    pub predicate: Predicate,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Why a message was not merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No registration for the kind.
    Unregistered,
    /// The registration's predicate returned false.
    PredicateFalse,
    /// The message type is not a status bundle.
    NotStatusBundle,
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Merged(ApplyOutcome),
}

/// Errors raised while dispatching a message.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("key names leaf hub '{key}' but payload names '{payload}'")]
    HubMismatch { key: String, payload: String },
    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl RegistryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Key(err) => err.code(),
            Self::Decode { .. } | Self::HubMismatch { .. } => ErrorCode::PayloadDecodeFailed,
            Self::Merge(err) => err.code(),
        }
    }
}

/// Message-kind → decoder/predicate table.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    registrations: HashMap<MessageKind, Registration>,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every kind. Compliance kinds follow `level`: the full path
    /// (clusters-per-policy, complete, delta) or the minimal path.
    #[must_use]
    pub fn with_defaults(level: &SharedAggregationLevel) -> Self {
        let mut registry = Self::new();
        for kind in [
            MessageKind::ClustersPerPolicy,
            MessageKind::PolicyCompleteCompliance,
            MessageKind::PolicyDeltaCompliance,
        ] {
            registry.register_when(kind, level_is(level, AggregationLevel::Full));
        }
        registry.register_when(
            MessageKind::MinimalPolicyCompliance,
            level_is(level, AggregationLevel::Minimal),
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

    /// Register `kind` with the standard decoder and `predicate`.
    pub fn register_when(&mut self, kind: MessageKind, predicate: Predicate) {
        self.register(Registration {
            kind,
            decode: StatusBundle::decode,
            predicate,
        });
    }

    /// Add or replace a registration.
    pub fn register(&mut self, registration: Registration) {
        self.registrations.insert(registration.kind, registration);
    }

    #[must_use]
    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.registrations.contains_key(&kind)
    }

    /// Route one message to the store.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for a malformed key, an undecodable payload,
    /// a payload naming a different leaf hub, or a merge failure.
    pub fn dispatch(
        &self,
        message: &TransportMessage,
        store: &Store,
    ) -> Result<DispatchOutcome, RegistryError> {
        if message.msg_type != STATUS_BUNDLE_MSG_TYPE {
            return Ok(DispatchOutcome::Ignored(IgnoreReason::NotStatusBundle));
        }

        let (hub, kind) = match parse_transport_key(&message.key) {
            Ok(parsed) => parsed,
            Err(KeyError::UnknownKind(err)) => {
                tracing::debug!(key = %message.key, error = %err, "ignoring unknown message kind");
                return Ok(DispatchOutcome::Ignored(IgnoreReason::Unregistered));
            }
            Err(err) => return Err(err.into()),
        };

        let Some(registration) = self.registrations.get(&kind) else {
            tracing::debug!(leaf_hub = %hub, %kind, "ignoring unregistered message kind");
            return Ok(DispatchOutcome::Ignored(IgnoreReason::Unregistered));
        };
        if !(registration.predicate)() {
            tracing::debug!(leaf_hub = %hub, %kind, "predicate false, ignoring message");
            return Ok(DispatchOutcome::Ignored(IgnoreReason::PredicateFalse));
        }

        let bundle = (registration.decode)(kind, &message.payload)
            .map_err(|source| RegistryError::Decode { kind, source })?;
        if bundle.leaf_hub_name() != hub {
            return Err(RegistryError::HubMismatch {
                key: hub.to_string(),
                payload: bundle.leaf_hub_name().to_string(),
            });
        }

        Ok(DispatchOutcome::Merged(store.apply(&bundle)?))
    }
}

fn level_is(level: &SharedAggregationLevel, wanted: AggregationLevel) -> Predicate {
    let level = level.clone();
    Box::new(move || level.get() == wanted)
}
