use std::path::Path;

use anyhow::{Context, Result};
use hubsync_core::config::HubSyncConfig;
use hubsync_core::db::{Store, migrations};
use serde::Serialize;

use crate::output::{OutputMode, render};

pub fn run(config: &HubSyncConfig, mode: OutputMode) -> Result<()> {
    let text = toml::to_string_pretty(config).context("serialize config")?;
    render(mode, config, |_, w| write!(w, "{text}"))
}

#[derive(Debug, Serialize)]
struct MigrateReport {
    path: String,
    schema_version: u32,
}

pub fn migrate(db: &Path, mode: OutputMode) -> Result<()> {
    let store = Store::open(db).with_context(|| format!("open store {}", db.display()))?;
    let schema_version = migrations::current_schema_version(&store.conn())?;
    let report = MigrateReport {
        path: db.display().to_string(),
        schema_version,
    };
    render(mode, &report, |r, w| {
        writeln!(w, "{} is at schema version {}", r.path, r.schema_version)
    })
}
