use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::isolation::SimpleAllocationPolicies;
use crate::quota_estimator::QuotaEstimator;
use crate::ranking::{ResourceUnit, ResourceUnitRanking};
use crate::service_unit::NamespaceName;

// Rank -> brokers at that rank. Ascending by rank; under the least-loaded
// strategy the rank is the load percentage, under weighted random selection
// it is the estimated free capacity, so the same ordered mapping serves both.
pub type SortedRankings = BTreeMap<i64, BTreeSet<ResourceUnit>>;

pub(crate) const BROKER_ROTATION_MODULO: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerStrategy {
    LeastLoadedServer,
    WeightedRandomSelection,
}

pub(crate) static LOADBALANCER_STRATEGY_LLS: &str = "leastLoadedServer";
pub(crate) static LOADBALANCER_STRATEGY_RAND: &str = "weightedRandomSelection";

impl LoadBalancerStrategy {
    // Unknown strategy names degrade to weighted random selection.
    pub fn from_setting(value: &str) -> Self {
        if value == LOADBALANCER_STRATEGY_LLS {
            LoadBalancerStrategy::LeastLoadedServer
        } else {
            LoadBalancerStrategy::WeightedRandomSelection
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::LeastLoadedServer => LOADBALANCER_STRATEGY_LLS,
            LoadBalancerStrategy::WeightedRandomSelection => LOADBALANCER_STRATEGY_RAND,
        }
    }
}

// Filter the ranked brokers through the namespace's isolation policy:
// primaries first, shared brokers only when the policy allows failover, all
// shared brokers when no policy exists. Result keeps the rank ordering.
pub(crate) fn get_final_candidates(
    namespace: &NamespaceName,
    available_brokers: &SortedRankings,
    policies: &SimpleAllocationPolicies,
) -> Vec<(i64, ResourceUnit)> {
    let mut matched_primaries: Vec<(i64, ResourceUnit)> = Vec::new();
    let mut matched_shared: Vec<(i64, ResourceUnit)> = Vec::new();

    let isolation_present = policies.is_isolation_policies_present(namespace);
    for (&rank, units) in available_brokers {
        for unit in units {
            let host = unit.hostname();
            if isolation_present {
                if policies.is_primary_broker(namespace, host) {
                    matched_primaries.push((rank, unit.clone()));
                } else if policies.is_shared_broker(host) {
                    matched_shared.push((rank, unit.clone()));
                } else {
                    debug!(
                        "skipping broker {} - neither primary nor shared for namespace {}",
                        host, namespace
                    );
                }
            } else if policies.is_shared_broker(host) {
                matched_shared.push((rank, unit.clone()));
            }
        }
    }

    if isolation_present {
        let mut final_candidates = matched_primaries;
        if policies.should_failover_to_secondaries(namespace, final_candidates.len()) {
            debug!(
                "not enough primaries [{}] for namespace {}, adding shared brokers",
                final_candidates.len(),
                namespace
            );
            final_candidates.extend(matched_shared);
        }
        final_candidates.sort();
        final_candidates
    } else {
        matched_shared
    }
}

// Weighted random selection: the probability of picking a broker is
// proportional to its rank, which under this strategy is its estimated free
// capacity. When every rank is zero the pick is uniform.
pub(crate) fn weighted_random_selection(
    candidates: &[(i64, ResourceUnit)],
) -> Option<ResourceUnit> {
    if candidates.is_empty() {
        return None;
    }

    let mut rng = rand::thread_rng();
    let total_weight: i64 = candidates.iter().map(|(rank, _)| (*rank).max(0)).sum();
    if total_weight <= 0 {
        let index = rng.gen_range(0..candidates.len());
        return Some(candidates[index].1.clone());
    }

    let mut remaining = rng.gen_range(0..total_weight);
    for (rank, unit) in candidates {
        remaining -= (*rank).max(0);
        if remaining < 0 {
            return Some(unit.clone());
        }
    }
    candidates.last().map(|(_, unit)| unit.clone())
}

// Deterministic least-loaded selection with four tracked picks, scanned in
// rank order:
// - selected: the lowest-loaded broker that is already warm (not idle)
// - idle: the first idle broker, used once the warm ones reach optimum load
// - max_available: the broker with the largest absolute headroom, for when
//   everyone is past the overload threshold
// - random: the broker at the rotation cursor, for when everyone is full
pub(crate) fn find_broker_for_placement(
    rankings: &mut HashMap<ResourceUnit, ResourceUnitRanking>,
    estimator: &QuotaEstimator,
    rotation_cursor: u64,
    candidates: &[(i64, ResourceUnit)],
    service_unit: &str,
    underload_threshold: f64,
    overload_threshold: f64,
) -> Option<ResourceUnit> {
    let mut min_load_percentage = 101.0;
    let mut max_availability: i64 = -1;
    let mut idle_ru: Option<ResourceUnit> = None;
    let mut max_available_ru: Option<ResourceUnit> = None;
    let mut random_ru: Option<ResourceUnit> = None;
    let mut selected_ru: Option<ResourceUnit> = None;
    let mut selected_ranking: Option<ResourceUnitRanking> = None;

    let mut random_index: i64 = if candidates.is_empty() {
        0
    } else {
        (rotation_cursor % candidates.len() as u64) as i64
    };

    for (_, candidate) in candidates {
        random_index -= 1;

        // unranked brokers can only show up when rankings and candidates
        // come from different snapshots
        if !rankings.contains_key(candidate) {
            continue;
        }

        // sticky: the bundle was already handed to this broker
        if rankings[candidate].is_service_unit_pre_allocated(service_unit) {
            return Some(candidate.clone());
        }

        // about to be re-placed: discount it from its current owner
        if rankings[candidate].is_service_unit_loaded(service_unit) {
            let quota = estimator.quota_for(service_unit);
            if let Some(ranking) = rankings.get_mut(candidate) {
                ranking.remove_loaded_service_unit(service_unit, &quota);
            }
        }

        if random_index < 0 && random_ru.is_none() {
            random_ru = Some(candidate.clone());
        }

        let ranking = &rankings[candidate];
        let load_percentage = ranking.estimated_load_percentage();
        let available_percentage = ((100.0 - load_percentage) / 100.0).max(0.0);
        let availability =
            (ranking.estimated_max_capacity() as f64 * available_percentage) as i64;
        if availability > max_availability {
            max_availability = availability;
            max_available_ru = Some(candidate.clone());
        }

        if ranking.is_idle() {
            if idle_ru.is_none() {
                idle_ru = Some(candidate.clone());
            }
        } else {
            let better = match &selected_ranking {
                None => true,
                Some(current) => ranking.compare_to(current) == std::cmp::Ordering::Less,
            };
            if better {
                min_load_percentage = load_percentage;
                selected_ranking = Some(ranking.clone());
                selected_ru = Some(candidate.clone());
            }
        }
    }

    if (min_load_percentage > underload_threshold && idle_ru.is_some()) || selected_ru.is_none() {
        // the least loaded warm broker already carries optimum load (or
        // every broker is idle): wake an idle one
        selected_ru = idle_ru;
    } else if min_load_percentage >= 100.0 && random_ru.is_some() {
        // everyone is full: distribute by rotation
        selected_ru = random_ru;
    } else if min_load_percentage > overload_threshold {
        // everyone is past the overload threshold: largest absolute headroom
        selected_ru = max_available_ru;
    }

    selected_ru
}

// Bookkeeping after a successful pick, for either strategy: advance the
// rotation cursor and charge the bundle's quota to the chosen broker so
// placements within the same ranking interval see it.
pub(crate) fn record_assignment(
    rankings: &mut HashMap<ResourceUnit, ResourceUnitRanking>,
    estimator: &QuotaEstimator,
    rotation_cursor: &mut u64,
    selected: &ResourceUnit,
    service_unit: &str,
) {
    *rotation_cursor = (*rotation_cursor + 1) % BROKER_ROTATION_MODULO;
    if let Some(ranking) = rankings.get_mut(selected) {
        if !ranking.is_service_unit_pre_allocated(service_unit) {
            let quota = estimator.quota_for(service_unit);
            ranking.add_pre_allocated_service_unit(service_unit, &quota);
        }
    }
}
