use std::collections::HashMap;
use tracing::{info, warn};

use crate::isolation::SimpleAllocationPolicies;
use crate::load_report::LoadReport;
use crate::placement::{get_final_candidates, SortedRankings};
use crate::ranking::ResourceUnit;
use crate::service_unit::{namespace_of_bundle, NamespaceName};

// Grace-period map for shedding: a bundle unloaded (or dry-run unloaded)
// once must not be touched again until the period expires. Entries are
// pruned lazily on access.
#[derive(Debug)]
pub(crate) struct SheddingTracker {
    recently_unloaded: HashMap<String, i64>,
    grace_period_ms: i64,
}

impl SheddingTracker {
    pub(crate) fn new(grace_period_minutes: u64) -> Self {
        SheddingTracker {
            recently_unloaded: HashMap::new(),
            grace_period_ms: grace_period_minutes as i64 * 60 * 1000,
        }
    }

    pub(crate) fn is_allowed(&mut self, bundle: &str, now_ms: i64) -> bool {
        let grace = self.grace_period_ms;
        self.recently_unloaded
            .retain(|_, &mut unloaded_at| now_ms - unloaded_at < grace);
        !self.recently_unloaded.contains_key(bundle)
    }

    pub(crate) fn mark(&mut self, bundle: &str, now_ms: i64) {
        self.recently_unloaded.insert(bundle.to_owned(), now_ms);
    }
}

// At least one candidate broker for the bundle's namespace sits below the
// comfort level on every resource, so the bundle has somewhere to go.
fn is_broker_available_for_rebalancing(
    bundle_name: &str,
    max_load_level: f64,
    current_load_reports: &HashMap<ResourceUnit, LoadReport>,
    sorted_rankings: &SortedRankings,
    policies: &SimpleAllocationPolicies,
) -> bool {
    let Some(namespace) = namespace_of_bundle(bundle_name) else {
        return false;
    };
    let namespace = NamespaceName::new(namespace);

    let candidates = get_final_candidates(&namespace, sorted_rankings, policies);
    candidates.iter().any(|(_, unit)| {
        current_load_reports
            .get(unit)
            .map(|report| report.system_usage.is_below_load_level(max_load_level))
            .unwrap_or(false)
    })
}

// Pick, for every broker reporting above the overload threshold, the one
// bundle whose removal relieves the bottleneck resource: bundles are walked
// in descending contribution order and the first one with a comfortable
// destination broker wins.
pub(crate) fn select_bundles_to_unload(
    current_load_reports: &HashMap<ResourceUnit, LoadReport>,
    sorted_rankings: &SortedRankings,
    policies: &SimpleAllocationPolicies,
    overload_threshold: f64,
    comfort_threshold: f64,
) -> Vec<(ResourceUnit, String)> {
    let mut bundles_to_unload = Vec::new();

    for (overloaded_unit, report) in current_load_reports {
        if !report.system_usage.is_above_load_level(overload_threshold) {
            continue;
        }

        if report.bundle_stats.len() <= 1 {
            if let Some(bundle_name) = report.bundle_stats.keys().next() {
                warn!(
                    "HIGH USAGE WARNING: sole bundle {} is overloading broker {}, nothing to shed",
                    bundle_name,
                    overloaded_unit.resource_id()
                );
            }
            continue;
        }

        let bottleneck = report.bottleneck_resource_type();
        for (bundle_name, stats) in report.sorted_bundle_stats(bottleneck) {
            if is_broker_available_for_rebalancing(
                bundle_name,
                comfort_threshold,
                current_load_reports,
                sorted_rankings,
                policies,
            ) {
                info!(
                    "bundle {} will be unloaded from overloaded broker {} (topics: {}, producers: {}, consumers: {}, bandwidthIn: {}, bandwidthOut: {})",
                    bundle_name,
                    overloaded_unit.resource_id(),
                    stats.topics,
                    stats.producer_count,
                    stats.consumer_count,
                    stats.msg_throughput_in,
                    stats.msg_throughput_out
                );
                bundles_to_unload.push((overloaded_unit.clone(), bundle_name.clone()));
                break;
            }
            info!(
                "no broker with enough capacity to re-balance {} away from {}",
                bundle_name,
                overloaded_unit.resource_id()
            );
        }
    }

    bundles_to_unload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::{NamespaceBundleStats, ResourceUsage};

    fn report_with_bundles(
        broker_name: &str,
        bandwidth_pct: f64,
        bundles: &[(&str, f64)],
    ) -> LoadReport {
        let mut report = LoadReport::new(
            broker_name,
            format!("http://{}", broker_name),
            None,
            format!("native://{}", broker_name),
            None,
        );
        report.system_usage.cpu = ResourceUsage::new(20.0, 100.0);
        report.system_usage.memory = ResourceUsage::new(100.0, 1000.0);
        report.system_usage.bandwidth_in = ResourceUsage::new(bandwidth_pct * 10.0, 1_000.0);
        report.system_usage.bandwidth_out = ResourceUsage::new(10.0, 1000.0);
        for (bundle, throughput) in bundles {
            report.bundle_stats.insert(
                bundle.to_string(),
                NamespaceBundleStats {
                    topics: 5,
                    msg_throughput_in: *throughput,
                    ..Default::default()
                },
            );
        }
        report
    }

    fn cluster() -> (
        HashMap<ResourceUnit, LoadReport>,
        SortedRankings,
        SimpleAllocationPolicies,
    ) {
        let overloaded = ResourceUnit::new("http://broker-b:8080");
        let comfortable = ResourceUnit::new("http://broker-a:8080");

        let mut reports = HashMap::new();
        // bandwidth-in at 90%, bottleneck; b1 contributes 80% of it
        reports.insert(
            overloaded.clone(),
            report_with_bundles(
                "broker-b:8080",
                90.0,
                &[
                    ("p/c/ns/0x0_0x1", 800.0),
                    ("p/c/ns/0x1_0x2", 100.0),
                    ("p/c/ns/0x2_0x3", 100.0),
                ],
            ),
        );
        reports.insert(
            comfortable.clone(),
            report_with_bundles("broker-a:8080", 10.0, &[("p/c/ns/0x3_0x4", 50.0)]),
        );

        let mut sorted = SortedRankings::new();
        sorted.entry(10).or_default().insert(comfortable);
        sorted.entry(90).or_default().insert(overloaded);

        (reports, sorted, SimpleAllocationPolicies::new())
    }

    #[test]
    fn test_sheds_top_contributor_of_bottleneck() {
        let (reports, sorted, policies) = cluster();

        let to_unload = select_bundles_to_unload(&reports, &sorted, &policies, 85.0, 65.0);
        assert_eq!(to_unload.len(), 1);
        assert_eq!(to_unload[0].0.broker_name(), "broker-b:8080");
        assert_eq!(to_unload[0].1, "p/c/ns/0x0_0x1");
    }

    #[test]
    fn test_no_shedding_without_comfortable_destination() {
        let (mut reports, sorted, policies) = cluster();
        // push the comfortable broker above the comfort level too
        let unit = ResourceUnit::new("http://broker-a:8080");
        reports.get_mut(&unit).unwrap().system_usage.bandwidth_in =
            ResourceUsage::new(700.0, 1000.0);

        let to_unload = select_bundles_to_unload(&reports, &sorted, &policies, 85.0, 65.0);
        assert!(to_unload.is_empty());
    }

    #[test]
    fn test_sole_bundle_broker_is_skipped() {
        let overloaded = ResourceUnit::new("http://broker-b:8080");
        let comfortable = ResourceUnit::new("http://broker-a:8080");

        let mut reports = HashMap::new();
        reports.insert(
            overloaded.clone(),
            report_with_bundles("broker-b:8080", 90.0, &[("p/c/ns/0x0_0x1", 900.0)]),
        );
        reports.insert(
            comfortable.clone(),
            report_with_bundles("broker-a:8080", 10.0, &[("p/c/ns/0x3_0x4", 50.0)]),
        );

        let mut sorted = SortedRankings::new();
        sorted.entry(10).or_default().insert(comfortable);
        sorted.entry(90).or_default().insert(overloaded);

        let to_unload = select_bundles_to_unload(
            &reports,
            &sorted,
            &SimpleAllocationPolicies::new(),
            85.0,
            65.0,
        );
        assert!(to_unload.is_empty());
    }

    #[test]
    fn test_grace_period_blocks_repeat_unload() {
        let mut tracker = SheddingTracker::new(30);
        let now = 1_000_000;

        assert!(tracker.is_allowed("p/c/ns/0x0_0x1", now));
        tracker.mark("p/c/ns/0x0_0x1", now);
        // within the grace period
        assert!(!tracker.is_allowed("p/c/ns/0x0_0x1", now + 10 * 60 * 1000));
        // expired
        assert!(tracker.is_allowed("p/c/ns/0x0_0x1", now + 31 * 60 * 1000));
    }
}
