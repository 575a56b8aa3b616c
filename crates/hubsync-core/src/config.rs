use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::bundle::events::DEFAULT_COMPLIANCE_PATTERN;
use crate::registry::AggregationLevel;

/// Environment variable overriding `consumer.aggregation_level`.
pub const AGGREGATION_LEVEL_ENV: &str = "HUBSYNC_AGGREGATION_LEVEL";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubSyncConfig {
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_leaf_hub_name")]
    pub leaf_hub_name: String,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_delta_switch_factor")]
    pub delta_switch_factor: u64,
    #[serde(default = "default_incarnation_path")]
    pub incarnation_path: PathBuf,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            leaf_hub_name: default_leaf_hub_name(),
            sync_interval_ms: default_sync_interval_ms(),
            delta_switch_factor: default_delta_switch_factor(),
            incarnation_path: default_incarnation_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub aggregation_level: AggregationLevel,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            aggregation_level: AggregationLevel::default(),
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_compliance_pattern")]
    pub compliance_pattern: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            compliance_pattern: default_compliance_pattern(),
        }
    }
}

/// Default config location: `<config dir>/hubsync/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hubsync/config.toml"))
}

/// Load a config file; a missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<HubSyncConfig> {
    if !path.exists() {
        return Ok(HubSyncConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<HubSyncConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load from `path` (or the default location) and apply environment
/// overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be parsed or an override is invalid.
pub fn resolve_config(path: Option<&Path>) -> Result<HubSyncConfig> {
    let mut config = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_config(&path)?,
        None => HubSyncConfig::default(),
    };
    apply_overrides(&mut config, env::var(AGGREGATION_LEVEL_ENV).ok())?;
    Ok(config)
}

fn apply_overrides(config: &mut HubSyncConfig, level: Option<String>) -> Result<()> {
    if let Some(raw) = level.filter(|raw| !raw.trim().is_empty()) {
        config.consumer.aggregation_level = raw
            .parse()
            .with_context(|| format!("Invalid {AGGREGATION_LEVEL_ENV}"))?;
    }
    Ok(())
}

fn default_leaf_hub_name() -> String {
    "hub1".to_string()
}

const fn default_sync_interval_ms() -> u64 {
    5_000
}

const fn default_delta_switch_factor() -> u64 {
    3
}

fn default_incarnation_path() -> PathBuf {
    PathBuf::from("incarnation")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hubsync.sqlite3")
}

fn default_compliance_pattern() -> String {
    DEFAULT_COMPLIANCE_PATTERN.to_string()
}
