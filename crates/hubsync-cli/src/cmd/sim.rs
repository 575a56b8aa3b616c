
use anyhow::{Result, bail};
use clap::Args;
use hubsync_core::registry::AggregationLevel;
use hubsync_sim::campaign::{CampaignConfig, run_campaign};

use crate::output::{OutputMode, render};

#[derive(Args, Debug)]
pub struct SimArgs {
    /// Number of seeds to run.
    #[arg(long, default_value_t = 100)]
    pub seeds: u64,

    /// First seed of the range.
    #[arg(long, default_value_t = 0)]
    pub start: u64,

    /// Aggregation level: `full` or `minimal`.
    #[arg(long, default_value = "full")]
    pub level: String,

    /// Chance per round that the producer restarts.
    #[arg(long, default_value_t = 5)]
    pub restart_percent: u8,
}

pub fn run(args: &SimArgs, mode: OutputMode) -> Result<()> {
    let level: AggregationLevel = args.level.parse()?;
    let config = CampaignConfig {
        seed_range: args.start..args.start.saturating_add(args.seeds),
        aggregation_level: level,
        restart_rate_percent: args.restart_percent,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config)?;

    render(mode, &report, |r, w| {
        writeln!(
            w,
            "campaign complete: seeds_run={} seeds_passed={} interesting={}",
            r.seeds_run, r.seeds_passed, r.interesting_states_reached
        )?;
        for failure in &r.failures {
            writeln!(w, "seed {} failed:", failure.seed)?;
            for violation in &failure.violations {
                writeln!(w, "  {violation}")?;
            }
        }
        Ok(())
    })?;

    if !report.all_passed() {
        bail!("{} of {} seeds failed", report.failures.len(), report.seeds_run);
    }
    Ok(())
}
