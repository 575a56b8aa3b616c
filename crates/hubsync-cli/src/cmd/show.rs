use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use hubsync_core::db::{Store, query};
use hubsync_core::wire::MessageKind;

use crate::output::{OutputMode, render_list};

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[command(subcommand)]
    pub target: ShowTarget,
}

#[derive(Subcommand, Debug)]
pub enum ShowTarget {
    /// Per-cluster compliance rows.
    Compliance {
        #[arg(long)]
        hub: Option<String>,
    },
    /// Counts-only compliance rows.
    Aggregated {
        #[arg(long)]
        hub: Option<String>,
    },
    /// Replicated-policy events.
    Events {
        #[arg(long)]
        policy: Option<String>,
    },
    /// Root-policy events.
    RootEvents {
        #[arg(long)]
        policy: Option<String>,
    },
    /// Generic status objects of one hub and kind.
    Objects {
        hub: String,
        /// Message kind, e.g. `PlacementDecisions`.
        kind: String,
    },
    /// Applied bundle version of every scope.
    Versions,
}

pub fn run(args: &ShowArgs, db: &Path, mode: OutputMode) -> Result<()> {
    let store = Store::open(db).with_context(|| format!("open store {}", db.display()))?;
    let conn = store.conn();

    match &args.target {
        ShowTarget::Compliance { hub } => {
            let rows = query::list_compliance(&conn, hub.as_deref())?;
            render_list(mode, "Compliance", &rows, |r, w| {
                writeln!(
                    w,
                    "{:<16} {:<24} {:<24} {}",
                    r.leaf_hub_name, r.policy_id, r.cluster_name, r.compliance
                )
            })
        }
        ShowTarget::Aggregated { hub } => {
            let rows = query::list_aggregated(&conn, hub.as_deref())?;
            render_list(mode, "Aggregated compliance", &rows, |r, w| {
                writeln!(
                    w,
                    "{:<16} {:<24} {:<8} applied={} non_compliant={}",
                    r.leaf_hub_name,
                    r.policy_id,
                    r.remediation_action,
                    r.applied_clusters,
                    r.non_compliant_clusters
                )
            })
        }
        ShowTarget::Events { policy } => {
            let rows = query::list_policy_events(&conn, policy.as_deref())?;
            render_list(mode, "Policy events", &rows, |r, w| {
                writeln!(
                    w,
                    "{:<28} {:<20} {:<16} x{} {}",
                    r.event_name,
                    r.policy_id,
                    r.cluster_id.as_deref().unwrap_or("-"),
                    r.count,
                    r.message
                )
            })
        }
        ShowTarget::RootEvents { policy } => {
            let rows = query::list_root_policy_events(&conn, policy.as_deref())?;
            render_list(mode, "Root policy events", &rows, |r, w| {
                writeln!(w, "{:<28} {:<20} x{} {}", r.event_name, r.policy_id, r.count, r.message)
            })
        }
        ShowTarget::Objects { hub, kind } => {
            let kind: MessageKind = kind.parse().context("invalid message kind")?;
            let rows = query::list_status_objects(&conn, hub, kind)?;
            render_list(mode, &format!("{kind} objects of {hub}"), &rows, |r, w| {
                writeln!(w, "{:<36} {}", r.object_id, r.payload)
            })
        }
        ShowTarget::Versions => {
            let rows = query::list_scope_versions(&conn)?;
            render_list(mode, "Applied versions", &rows, |r, w| {
                writeln!(w, "{:<16} {:<28} {}", r.leaf_hub_name, r.message_kind, r.version)
            })
        }
    }
}
