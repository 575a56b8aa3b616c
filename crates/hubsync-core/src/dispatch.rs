//! Producer-side sync loop.
//!
//! The [`Dispatcher`] owns one entry per transport key. Each tick promotes
//! every bundle, and sends those whose predicate holds and whose version is
//! newer than the last successful send. A failed send leaves `last_sent`
//! untouched, so the same bundle is retried on the next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bundle::Bundle;
use crate::error::ErrorCode;
use crate::transport::{Producer, STATUS_BUNDLE_MSG_TYPE, TransportMessage};
use crate::version::BundleVersion;
use crate::wire::MessageKind;

/// Gate evaluated on every tick before sending.
pub type SendPredicate = Box<dyn Fn() -> bool + Send + Sync>;

struct DispatchEntry {
    transport_key: String,
    bundle: Arc<dyn Bundle>,
    predicate: SendPredicate,
    last_sent: Option<BundleVersion>,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sent: usize,
    pub failed: usize,
    /// Predicate false or nothing newer than the last send.
    pub skipped: usize,
}

/// Per-leaf-hub set of bundles and their send state.
pub struct Dispatcher {
    leaf_hub_name: String,
    entries: Vec<DispatchEntry>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("leaf_hub_name", &self.leaf_hub_name)
            .field(
                "keys",
                &self
                    .entries
                    .iter()
                    .map(|e| e.transport_key.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(leaf_hub_name: impl Into<String>) -> Self {
        Self {
            leaf_hub_name: leaf_hub_name.into(),
            entries: Vec::new(),
        }
    }

    /// Register a bundle that is always eligible.
    pub fn register(&mut self, kind: MessageKind, bundle: Arc<dyn Bundle>) {
        self.register_when(kind, bundle, Box::new(|| true));
    }

    /// Register a bundle gated by `predicate`.
    pub fn register_when(
        &mut self,
        kind: MessageKind,
        bundle: Arc<dyn Bundle>,
        predicate: SendPredicate,
    ) {
        self.entries.push(DispatchEntry {
            transport_key: kind.transport_key(&self.leaf_hub_name),
            bundle,
            predicate,
            last_sent: None,
        });
    }

    /// Last version successfully sent for `kind`.
    #[must_use]
    pub fn last_sent(&self, kind: MessageKind) -> Option<BundleVersion> {
        let key = kind.transport_key(&self.leaf_hub_name);
        self.entries
            .iter()
            .find(|e| e.transport_key == key)
            .and_then(|e| e.last_sent)
    }

    /// Run one sync tick against `producer`.
    pub fn tick<P: Producer + ?Sized>(&mut self, producer: &P) -> TickReport {
        let mut report = TickReport::default();

        for entry in &mut self.entries {
            // Promotion happens even when gated off, so generations keep
            // tracking mutations.
            let eligible = (entry.predicate)();
            let last_sent = if eligible {
                entry.last_sent
            } else {
                Some(entry.bundle.bundle_version())
            };

            let snapshot = match entry.bundle.snapshot_since(last_sent) {
                Ok(Some(snapshot)) if eligible => snapshot,
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        key = %entry.transport_key,
                        code = err.code().code(),
                        error = %err,
                        "failed to snapshot bundle"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let message = TransportMessage {
                key: entry.transport_key.clone(),
                msg_type: STATUS_BUNDLE_MSG_TYPE.to_string(),
                version: snapshot.version.to_string(),
                payload: snapshot.payload,
            };
            match producer.send(&message) {
                Ok(()) => {
                    tracing::debug!(key = %entry.transport_key, version = %snapshot.version, "bundle sent");
                    entry.last_sent = Some(snapshot.version);
                    report.sent += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        key = %entry.transport_key,
                        version = %snapshot.version,
                        code = ErrorCode::TransportSendFailed.code(),
                        error = %err,
                        "send failed, will retry next tick"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Run ticks every `interval` on a dedicated thread until the returned
    /// handle is stopped.
    #[must_use]
    pub fn run_every<P>(mut self, producer: Arc<P>, interval: Duration) -> DispatchLoop
    where
        P: Producer + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                self.tick(producer.as_ref());
                std::thread::sleep(interval);
            }
            self
        });
        DispatchLoop { stop, handle }
    }
}

/// Handle to a running tick loop.
#[derive(Debug)]
pub struct DispatchLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Dispatcher>,
}

impl DispatchLoop {
    /// Stop the loop after its current tick and hand the dispatcher back.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::InternalUnexpected`] if the loop thread panicked.
    pub fn stop(self) -> Result<Dispatcher, ErrorCode> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle
            .join()
            .map_err(|_| ErrorCode::InternalUnexpected)
    }
}
