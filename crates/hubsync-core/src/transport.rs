//! Transport seam between producers and the consumer.
//!
//! The broker client itself is external. Producers only need something that
//! implements [`Producer`]; the consumer only sees [`TransportMessage`]s.
//! Delivery is at-least-once: the same message may arrive more than once and
//! messages on different keys may interleave arbitrarily.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::wire::{MessageKind, UnknownMessageKind};

/// Message type tag for status bundles.
pub const STATUS_BUNDLE_MSG_TYPE: &str = "StatusBundle";

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    /// `<leafHub>.<messageKind>`.
    pub key: String,
    pub msg_type: String,
    /// `<incarnation>.<generation>` of the payload.
    pub version: String,
    /// Serialized [`crate::wire::BundleEnvelope`].
    pub payload: Vec<u8>,
}

/// Errors raised while interpreting a transport key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("transport key '{0}' is not '<leafHub>.<messageKind>'")]
    Malformed(String),
    #[error(transparent)]
    UnknownKind(#[from] UnknownMessageKind),
}

impl KeyError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidTransportKey
    }
}

/// Split a transport key into leaf hub name and message kind.
///
/// The kind is the part after the last `.`, so hub names may contain dots.
///
/// # Errors
///
/// Returns [`KeyError`] if there is no separator, either half is empty, or
/// the kind is not recognised.
pub fn parse_transport_key(key: &str) -> Result<(&str, MessageKind), KeyError> {
    let (hub, kind) = key
        .rsplit_once('.')
        .filter(|(hub, kind)| !hub.is_empty() && !kind.is_empty())
        .ok_or_else(|| KeyError::Malformed(key.to_string()))?;
    Ok((hub, kind.parse()?))
}

/// Outbound side of the transport.
pub trait Producer: Send + Sync {
    /// Error type for send failures.
    type Error: std::fmt::Debug + std::fmt::Display;

    /// Hand one message to the transport.
    fn send(&self, message: &TransportMessage) -> Result<(), Self::Error>;
}

/// Error type for the in-memory producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("in-memory transport error: {0}")]
pub struct InMemoryError(pub String);

/// Producer that records every sent message, for tests and local runs.
///
/// Sends can be made to fail on demand to exercise retry paths.
#[derive(Debug, Default)]
pub struct InMemoryProducer {
    sent: Mutex<Vec<TransportMessage>>,
    fail_next: Mutex<usize>,
}

impl InMemoryProducer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut pending) = self.fail_next.lock() {
            *pending = count;
        }
    }

    /// Take every message sent so far, oldest first.
    pub fn drain(&self) -> Vec<TransportMessage> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    /// Number of messages currently held.
    pub fn len(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Producer for InMemoryProducer {
    type Error = InMemoryError;

    fn send(&self, message: &TransportMessage) -> Result<(), Self::Error> {
        {
            let mut pending = self
                .fail_next
                .lock()
                .map_err(|_| InMemoryError("poisoned".into()))?;
            if *pending > 0 {
                *pending -= 1;
                return Err(InMemoryError("injected send failure".into()));
            }
        }
        self.sent
            .lock()
            .map_err(|_| InMemoryError("poisoned".into()))?
            .push(message.clone());
        Ok(())
    }
}
