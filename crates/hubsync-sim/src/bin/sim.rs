#![forbid(unsafe_code)]

use anyhow::Result;
use hubsync_sim::campaign::{CampaignConfig, run_campaign};

fn main() -> Result<()> {
    let config = CampaignConfig::default();
    let report = run_campaign(&config)?;

    println!(
        "campaign complete: seeds_run={} seeds_passed={} interesting={}",
        report.seeds_run, report.seeds_passed, report.interesting_states_reached
    );
    for failure in &report.failures {
        println!("seed {} failed:", failure.seed);
        for violation in &failure.violations {
            println!("  {violation}");
        }
    }

    if report.all_passed() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} seeds failed, first at {:?}",
            report.failures.len(),
            report.first_failure
        )
    }
}
