//! Seed campaigns across both aggregation levels.

use hubsync_core::registry::AggregationLevel;
use hubsync_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use proptest::prelude::*;

fn assert_campaign_passes(config: &CampaignConfig) {
    let report = run_campaign(config).expect("campaign should not error");
    assert_eq!(
        report.seeds_run,
        usize::try_from(config.seed_range.end - config.seed_range.start).expect("seeds")
    );
    assert!(
        report.all_passed(),
        "campaign failed: {:?}",
        report.failures.first()
    );
}

#[test]
fn full_level_campaign_converges() {
    assert_campaign_passes(&CampaignConfig {
        seed_range: 0..40,
        ..CampaignConfig::default()
    });
}

#[test]
fn minimal_level_campaign_converges() {
    assert_campaign_passes(&CampaignConfig {
        seed_range: 100..140,
        aggregation_level: AggregationLevel::Minimal,
        ..CampaignConfig::default()
    });
}

#[test]
fn restart_heavy_campaign_converges() {
    let config = CampaignConfig {
        seed_range: 200..230,
        restart_rate_percent: 30,
        fault_reorder_percent: 60,
        fault_duplicate_percent: 30,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).expect("campaign");
    assert!(report.all_passed(), "{:?}", report.failures.first());
    assert!(
        report.interesting_states_reached > 0,
        "expected stale bundles after restarts or reordering"
    );
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(24))]

    #[test]
    fn any_seed_converges(
        seed in 0_u64..u64::MAX,
        minimal in any::<bool>(),
        factor in 1_u64..6,
    ) {
        let config = CampaignConfig {
            seed_range: seed..seed + 1,
            aggregation_level: if minimal { AggregationLevel::Minimal } else { AggregationLevel::Full },
            delta_switch_factor: factor,
            ..CampaignConfig::default()
        };
        let trace = replay_seed(seed, &config).expect("replay");
        prop_assert!(trace.oracle.passed, "{:?}", trace.oracle.violations);
    }
}
