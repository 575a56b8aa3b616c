//! Producer-side bundles.
//!
//! A bundle accumulates the reportable state of one object collection on one
//! leaf hub and stamps it with a [`BundleVersion`]. Watch callbacks mutate it
//! through [`Bundle::update_object`] / [`Bundle::delete_object`]; the
//! dispatcher reads it through [`Bundle::snapshot_since`].
//!
//! Every bundle guards its state with one exclusive lock. Mutations are
//! linearized per bundle, and the dispatcher's promote-and-serialize step
//! takes the same lock, so a snapshot never mixes two generations.
//!
//! - [`object::ObjectBundle`]: generic keyed collection, generation promoted
//!   on the dispatch tick.
//! - [`events::PolicyEventBundle`]: deduplicated compliance history,
//!   generation bumped inside the update call.
//! - [`compliance`]: complete/delta views layered over clusters-per-policy.

pub mod compliance;
pub mod events;
pub mod object;
pub mod projection;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::ErrorCode;
use crate::object::WatchedObject;
use crate::version::BundleVersion;
use crate::wire::BundleEnvelope;

/// Serialized bundle ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSnapshot {
    pub version: BundleVersion,
    pub payload: Vec<u8>,
}

/// Errors raised while snapshotting a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to encode bundle payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BundleError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::PayloadEncodeFailed
    }
}

/// Common interface every producer bundle exposes to the watch side and the
/// dispatcher.
pub trait Bundle: Send + Sync {
    /// Fold the object's current state into the bundle.
    fn update_object(&self, object: &WatchedObject);

    /// Forget the object.
    fn delete_object(&self, object: &WatchedObject);

    /// Current version. Does not promote pending mutations.
    fn bundle_version(&self) -> BundleVersion;

    /// Promote pending mutations into a new generation and, when the
    /// resulting version is newer than `last_sent`, serialize the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Encode`] if the payload cannot be serialized.
    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError>;
}

/// Encode an envelope as a snapshot.
pub(crate) fn encode<T: Serialize>(
    envelope: &BundleEnvelope<T>,
) -> Result<BundleSnapshot, BundleError> {
    Ok(BundleSnapshot {
        version: envelope.bundle_version,
        payload: serde_json::to_vec(envelope)?,
    })
}

/// Lock a bundle's state, recovering from poisoning.
///
/// A panicking watch callback must not wedge the bundle; the state it left
/// behind is still a valid collection.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
