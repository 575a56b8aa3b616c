use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use hubsync_core::config::HubSyncConfig;
use hubsync_core::db::Store;
use hubsync_core::merge::ApplyOutcome;
use hubsync_core::registry::{ConsumerRegistry, DispatchOutcome, SharedAggregationLevel};
use hubsync_core::transport::{STATUS_BUNDLE_MSG_TYPE, TransportMessage};
use serde::{Deserialize, Serialize};

use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Message files (JSON Lines); `-` reads stdin.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Keep going after a message fails to dispatch.
    #[arg(long)]
    pub keep_going: bool,
}

/// One captured message. The payload is the envelope itself rather than
/// its serialized bytes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageLine {
    key: String,
    #[serde(default = "default_msg_type")]
    msg_type: String,
    #[serde(default)]
    version: String,
    payload: serde_json::Value,
}

fn default_msg_type() -> String {
    STATUS_BUNDLE_MSG_TYPE.to_string()
}

impl MessageLine {
    fn into_message(self) -> Result<TransportMessage> {
        Ok(TransportMessage {
            key: self.key,
            msg_type: self.msg_type,
            version: self.version,
            payload: serde_json::to_vec(&self.payload).context("re-encode payload")?,
        })
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ApplySummary {
    pub messages: usize,
    pub applied: usize,
    pub rows: usize,
    pub stale: usize,
    pub base_mismatch: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ApplySummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Merged(ApplyOutcome::Applied { rows }) => {
                self.applied += 1;
                self.rows += rows;
            }
            DispatchOutcome::Merged(ApplyOutcome::Stale { .. }) => self.stale += 1,
            DispatchOutcome::Merged(ApplyOutcome::BaseMismatch { .. }) => self.base_mismatch += 1,
            DispatchOutcome::Ignored(_) => self.ignored += 1,
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("read messages from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Parse every non-blank line of `content` into a message.
fn parse_messages(content: &str, origin: &Path) -> Result<Vec<TransportMessage>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<MessageLine>(line)
                .with_context(|| format!("{}:{}: invalid message", origin.display(), i + 1))
                .and_then(MessageLine::into_message)
        })
        .collect()
}

pub fn run(args: &ApplyArgs, config: &HubSyncConfig, db: &Path, mode: OutputMode) -> Result<()> {
    let store = Store::open(db).with_context(|| format!("open store {}", db.display()))?;
    let level = SharedAggregationLevel::new(config.consumer.aggregation_level);
    let registry = ConsumerRegistry::with_defaults(&level);

    let mut summary = ApplySummary::default();
    for path in &args.files {
        let messages = parse_messages(&read_source(path)?, path)?;
        for message in messages {
            summary.messages += 1;
            match registry.dispatch(&message, &store) {
                Ok(outcome) => summary.record(outcome),
                Err(err) if args.keep_going => {
                    tracing::warn!(
                        key = %message.key,
                        code = err.code().code(),
                        error = %err,
                        "message failed to dispatch"
                    );
                    summary.failed += 1;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("dispatch {} v{}", message.key, message.version)));
                }
            }
        }
    }

    render(mode, &summary, |s, w| {
        writeln!(
            w,
            "{} messages: {} applied ({} rows), {} stale, {} base mismatch, {} ignored, {} failed",
            s.messages, s.applied, s.rows, s.stale, s.base_mismatch, s.ignored, s.failed
        )
    })
}
