use std::collections::HashMap;
use tracing::info;

use crate::load_report::LoadReport;
use crate::service_unit::namespace_of_bundle;

// Per-bundle limits beyond which a bundle is considered hot, plus the cap on
// how many bundles a namespace may be split into.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BundleSplitLimits {
    pub max_topics: u64,
    pub max_sessions: u64,
    pub max_msg_rate: f64,
    pub max_bandwidth_bytes: f64,
    pub max_namespace_bundles: usize,
}

// Detect hot bundles in a report. A bundle qualifies when any of its limits
// is exceeded, it has more than one topic (a single topic cannot be split)
// and its namespace is still below the bundle cap.
pub(crate) fn find_bundles_to_split(
    report: &LoadReport,
    limits: &BundleSplitLimits,
    namespace_bundle_counts: &HashMap<String, usize>,
) -> Vec<String> {
    let mut bundles_to_split = Vec::new();

    for (bundle_name, stats) in &report.bundle_stats {
        let total_sessions = stats.producer_count + stats.consumer_count;
        let total_msg_rate = stats.msg_rate_in + stats.msg_rate_out;
        let total_bandwidth = stats.msg_throughput_in + stats.msg_throughput_out;

        let hot = stats.topics > limits.max_topics
            || total_sessions > limits.max_sessions
            || total_msg_rate > limits.max_msg_rate
            || total_bandwidth > limits.max_bandwidth_bytes;
        if !hot {
            continue;
        }

        if stats.topics <= 1 {
            info!(
                "unable to split hot bundle {} since it has only one topic",
                bundle_name
            );
            continue;
        }

        let namespace_bundles = namespace_of_bundle(bundle_name)
            .and_then(|namespace| namespace_bundle_counts.get(namespace))
            .copied()
            .unwrap_or(0);
        if namespace_bundles >= limits.max_namespace_bundles {
            info!(
                "unable to split hot bundle {} since the namespace already has {} bundles",
                bundle_name, namespace_bundles
            );
            continue;
        }

        info!(
            "hot bundle {} (topics: {}, sessions: {}, msgRate: {}, bandwidth: {}) needs splitting",
            bundle_name, stats.topics, total_sessions, total_msg_rate, total_bandwidth
        );
        bundles_to_split.push(bundle_name.clone());
    }

    bundles_to_split
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::NamespaceBundleStats;

    fn limits() -> BundleSplitLimits {
        BundleSplitLimits {
            max_topics: 1000,
            max_sessions: 1000,
            max_msg_rate: 1000.0,
            max_bandwidth_bytes: 100.0 * 1024.0 * 1024.0,
            max_namespace_bundles: 4,
        }
    }

    fn report_with_bundle(bundle: &str, stats: NamespaceBundleStats) -> LoadReport {
        let mut report = LoadReport::default();
        report.bundle_stats.insert(bundle.to_string(), stats);
        report
    }

    #[test]
    fn test_hot_bundle_is_split_until_namespace_cap() {
        let report = report_with_bundle(
            "p/c/ns/0x0_0x8",
            NamespaceBundleStats {
                topics: 2,
                msg_rate_in: 10_000.0,
                ..Default::default()
            },
        );

        // namespace one below the cap: split allowed
        let counts = HashMap::from([("p/c/ns".to_string(), 3)]);
        let split = find_bundles_to_split(&report, &limits(), &counts);
        assert_eq!(split, vec!["p/c/ns/0x0_0x8".to_string()]);

        // namespace at the cap: no further splits
        let counts = HashMap::from([("p/c/ns".to_string(), 4)]);
        let split = find_bundles_to_split(&report, &limits(), &counts);
        assert!(split.is_empty());
    }

    #[test]
    fn test_single_topic_bundle_is_never_split() {
        let report = report_with_bundle(
            "p/c/ns/0x0_0x8",
            NamespaceBundleStats {
                topics: 1,
                msg_rate_in: 10_000.0,
                ..Default::default()
            },
        );
        let split = find_bundles_to_split(&report, &limits(), &HashMap::new());
        assert!(split.is_empty());
    }

    #[test]
    fn test_cool_bundle_is_left_alone() {
        let report = report_with_bundle(
            "p/c/ns/0x0_0x8",
            NamespaceBundleStats {
                topics: 10,
                producer_count: 5,
                consumer_count: 5,
                msg_rate_in: 100.0,
                ..Default::default()
            },
        );
        let counts = HashMap::from([("p/c/ns".to_string(), 1)]);
        let split = find_bundles_to_split(&report, &limits(), &counts);
        assert!(split.is_empty());
    }

    #[test]
    fn test_session_overflow_triggers_split() {
        let report = report_with_bundle(
            "p/c/ns/0x0_0x8",
            NamespaceBundleStats {
                topics: 50,
                producer_count: 800,
                consumer_count: 400,
                ..Default::default()
            },
        );
        let counts = HashMap::from([("p/c/ns".to_string(), 1)]);
        let split = find_bundles_to_split(&report, &limits(), &counts);
        assert_eq!(split.len(), 1);
    }
}
