//! Deduplicated policy compliance history.
//!
//! A policy's status repeats the same history entries on every reconcile. The
//! bundle folds that stream into one entry per event name: a known event seen
//! again with a new timestamp bumps its count, an identical one is ignored,
//! and names that drop out of the history are pruned.
//!
//! Unlike [`ObjectBundle`](super::object::ObjectBundle), this bundle bumps its
//! generation inside the update call. Deletes drop stored events without a
//! bump; the consumer keeps event rows forever regardless.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use regex::Regex;

use super::{Bundle, BundleError, BundleSnapshot, encode, lock};
use crate::error::ErrorCode;
use crate::object::{CLUSTER_NAME_LABEL, DetailStatus, Policy, ROOT_POLICY_LABEL, WatchedObject};
use crate::version::BundleVersion;
use crate::wire::{BundleEnvelope, PolicyEvent};

/// Default pattern extracting the compliance label from an event message.
pub const DEFAULT_COMPLIANCE_PATTERN: &str = r"(\w+);";

/// Reason stamped on every event this bundle creates.
pub const POLICY_STATUS_SYNC_REASON: &str = "PolicyStatusSync";

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// Errors raised by an [`IdentityResolver`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("identity lookup unavailable: {0}")]
    Unavailable(String),
}

impl ResolveError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::IdentityUnresolved
    }
}

/// Maps leaf hub names onto the ids the central store uses.
pub trait IdentityResolver: Send + Sync {
    /// Resolve a root policy's `namespace.name` to its policy id.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the policy is unknown or the lookup
    /// backend cannot be reached.
    fn resolve_root_policy(&self, namespaced_name: &str) -> Result<String, ResolveError>;

    /// Resolve a managed cluster name to its cluster id.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when the cluster is unknown or the lookup
    /// backend cannot be reached.
    fn resolve_cluster_id(&self, cluster_name: &str) -> Result<String, ResolveError>;
}

/// Map-backed resolver.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    policies: HashMap<String, String>,
    clusters: HashMap<String, String>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_policy(mut self, namespaced_name: &str, policy_id: &str) -> Self {
        self.policies
            .insert(namespaced_name.to_string(), policy_id.to_string());
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster_name: &str, cluster_id: &str) -> Self {
        self.clusters
            .insert(cluster_name.to_string(), cluster_id.to_string());
        self
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve_root_policy(&self, namespaced_name: &str) -> Result<String, ResolveError> {
        self.policies
            .get(namespaced_name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                kind: "policy",
                name: namespaced_name.to_string(),
            })
    }

    fn resolve_cluster_id(&self, cluster_name: &str) -> Result<String, ResolveError> {
        self.clusters
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                kind: "cluster",
                name: cluster_name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Which policies the bundle reports history for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    /// Replicated policies; events carry the resolved cluster id.
    Cluster,
    /// Root policies; the policy's own UID is the policy id.
    Root,
}

/// Errors raised while building an event bundle.
#[derive(Debug, thiserror::Error)]
pub enum EventBundleError {
    #[error("invalid compliance pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl EventBundleError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ConfigParseError
    }
}

#[derive(Debug)]
struct EventState {
    /// object uid -> event name -> event
    events: BTreeMap<String, BTreeMap<String, PolicyEvent>>,
    version: BundleVersion,
}

/// Accumulator of deduplicated compliance history for one leaf hub.
pub struct PolicyEventBundle {
    leaf_hub_name: String,
    scope: EventScope,
    resolver: Arc<dyn IdentityResolver>,
    pattern: Regex,
    state: Mutex<EventState>,
}

impl std::fmt::Debug for PolicyEventBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEventBundle")
            .field("leaf_hub_name", &self.leaf_hub_name)
            .field("scope", &self.scope)
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

impl PolicyEventBundle {
    /// Create an empty bundle.
    ///
    /// # Errors
    ///
    /// Returns [`EventBundleError::Pattern`] if `compliance_pattern` is not a
    /// valid regular expression.
    pub fn new(
        leaf_hub_name: impl Into<String>,
        incarnation: u64,
        scope: EventScope,
        resolver: Arc<dyn IdentityResolver>,
        compliance_pattern: &str,
    ) -> Result<Self, EventBundleError> {
        Ok(Self {
            leaf_hub_name: leaf_hub_name.into(),
            scope,
            resolver,
            pattern: Regex::new(compliance_pattern)?,
            state: Mutex::new(EventState {
                events: BTreeMap::new(),
                version: BundleVersion::new(incarnation, 0),
            }),
        })
    }

    #[must_use]
    pub const fn scope(&self) -> EventScope {
        self.scope
    }

    /// Events currently held for `uid`, ordered by event name.
    #[must_use]
    pub fn events_for(&self, uid: &str) -> Vec<PolicyEvent> {
        lock(&self.state)
            .events
            .get(uid)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Compliance label of a message: first capture of the pattern, trimmed,
    /// or the detail's own state when the pattern does not match.
    fn compliance_of(&self, message: &str, detail: &DetailStatus) -> String {
        self.pattern
            .captures(message)
            .and_then(|caps| caps.get(1))
            .map_or_else(
                || detail.compliance_state.clone(),
                |m| m.as_str().trim().to_string(),
            )
    }

    /// `(policy_id, cluster_id)` of the policy, or `None` when it is not one
    /// this bundle reports on or its identity cannot be resolved.
    fn identity(&self, policy: &Policy) -> Option<(String, Option<String>)> {
        let meta = &policy.metadata;
        let root_label = meta.label(ROOT_POLICY_LABEL);
        match self.scope {
            EventScope::Root => root_label
                .is_none()
                .then(|| (meta.uid.clone(), None)),
            EventScope::Cluster => {
                let root_name = root_label?;
                let cluster_name = meta.label(CLUSTER_NAME_LABEL)?;
                let resolved = self
                    .resolver
                    .resolve_root_policy(root_name)
                    .and_then(|policy_id| {
                        self.resolver
                            .resolve_cluster_id(cluster_name)
                            .map(|cluster_id| (policy_id, Some(cluster_id)))
                    });
                match resolved {
                    Ok(identity) => Some(identity),
                    Err(err) => {
                        tracing::debug!(
                            leaf_hub = %self.leaf_hub_name,
                            uid = %meta.uid,
                            code = err.code().code(),
                            error = %err,
                            "skipping policy with unresolved identity"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Fold one policy's history. Returns `true` if stored events changed.
    fn fold(&self, policy: &Policy) -> bool {
        let Some(details) = policy.status.details.as_deref().filter(|d| !d.is_empty()) else {
            return false;
        };
        let Some((policy_id, cluster_id)) = self.identity(policy) else {
            return false;
        };

        let mut state = lock(&self.state);
        let stored = state
            .events
            .entry(policy.metadata.uid.clone())
            .or_default();

        let mut seen: Vec<&str> = Vec::new();
        let mut modified = false;

        for detail in details {
            for entry in detail.history.iter().flatten() {
                // History lists newest first; later repeats of a name are older.
                if seen.contains(&entry.event_name.as_str()) {
                    continue;
                }
                seen.push(&entry.event_name);

                let compliance = self.compliance_of(&entry.message, detail);
                match stored.get_mut(&entry.event_name) {
                    Some(event) if event.created_at == entry.last_timestamp => {}
                    Some(event) => {
                        event.count = event.count.saturating_add(1);
                        event.message.clone_from(&entry.message);
                        event.compliance = compliance;
                        event.created_at = entry.last_timestamp;
                        modified = true;
                    }
                    None => {
                        stored.insert(
                            entry.event_name.clone(),
                            PolicyEvent {
                                event_name: entry.event_name.clone(),
                                policy_id: policy_id.clone(),
                                cluster_id: cluster_id.clone(),
                                message: entry.message.clone(),
                                reason: POLICY_STATUS_SYNC_REASON.to_string(),
                                count: 1,
                                compliance,
                                created_at: entry.last_timestamp,
                            },
                        );
                        modified = true;
                    }
                }
            }
        }

        let before = stored.len();
        stored.retain(|name, _| seen.contains(&name.as_str()));
        modified |= stored.len() != before;

        if stored.is_empty() {
            state.events.remove(&policy.metadata.uid);
        }
        if modified {
            state.version.bump_generation();
        }
        modified
    }
}

impl Bundle for PolicyEventBundle {
    fn update_object(&self, object: &WatchedObject) {
        if let Some(policy) = object.as_policy() {
            self.fold(policy);
        }
    }

    fn delete_object(&self, object: &WatchedObject) {
        lock(&self.state).events.remove(object.uid());
    }

    fn bundle_version(&self) -> BundleVersion {
        lock(&self.state).version
    }

    fn snapshot_since(
        &self,
        last_sent: Option<BundleVersion>,
    ) -> Result<Option<BundleSnapshot>, BundleError> {
        let state = lock(&self.state);
        if !state.version.newer_than_opt(last_sent.as_ref()) {
            return Ok(None);
        }
        encode(&BundleEnvelope {
            objects: state
                .events
                .values()
                .flat_map(BTreeMap::values)
                .cloned()
                .collect(),
            leaf_hub_name: self.leaf_hub_name.clone(),
            bundle_version: state.version,
            base_bundle_version: None,
        })
        .map(Some)
    }
}
