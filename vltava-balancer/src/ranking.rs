use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::load_report::SystemResourceUsage;
use crate::resource_quota::ResourceQuota;

// Quota bandwidth is bytes/s while ResourceUsage bandwidth is Mbit/s.
const BYTES_PER_MBIT: f64 = 125_000.0;

// A broker seen from the load balancer: its service URL is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUnit {
    resource_id: String,
}

impl ResourceUnit {
    pub fn new(resource_id: impl Into<String>) -> Self {
        ResourceUnit {
            resource_id: resource_id.into(),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    // <host>:<port>, the broker's name in /loadbalance/brokers
    pub fn broker_name(&self) -> &str {
        self.resource_id
            .strip_prefix("https://")
            .or_else(|| self.resource_id.strip_prefix("http://"))
            .unwrap_or(&self.resource_id)
    }

    pub fn hostname(&self) -> &str {
        let name = self.broker_name();
        name.split(':').next().unwrap_or(name)
    }
}

impl fmt::Display for ResourceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource_id)
    }
}

// Derived per-broker score combining the broker's actual resource usage with
// the quota allocated to the bundles it owns plus the bundles the leader has
// pre-allocated to it but which have not shown up in a load report yet.
//
// The estimated load percentage is, per resource, the worse of the actual
// usage and the quota-implied usage, so a just-assigned broker cannot hide
// behind a stale report.
#[derive(Debug, Clone)]
pub struct ResourceUnitRanking {
    system_usage: SystemResourceUsage,
    loaded_bundles: HashSet<String>,
    allocated_quota: ResourceQuota,
    pre_allocated_bundles: HashSet<String>,
    pre_allocated_quota: ResourceQuota,
    cpu_factor: f64,
    estimated_load_percentage: f64,
    allocated_load_pct_cpu: f64,
    allocated_load_pct_memory: f64,
    allocated_load_pct_bandwidth_in: f64,
    allocated_load_pct_bandwidth_out: f64,
    estimated_max_capacity: i64,
}

impl ResourceUnitRanking {
    pub fn new(
        system_usage: SystemResourceUsage,
        loaded_bundles: HashSet<String>,
        allocated_quota: ResourceQuota,
        pre_allocated_bundles: HashSet<String>,
        pre_allocated_quota: ResourceQuota,
        cpu_factor: f64,
        default_quota: &ResourceQuota,
    ) -> Self {
        let estimated_max_capacity =
            calculate_broker_max_capacity(&system_usage, default_quota, cpu_factor);
        let mut ranking = ResourceUnitRanking {
            system_usage,
            loaded_bundles,
            allocated_quota,
            pre_allocated_bundles,
            pre_allocated_quota,
            cpu_factor,
            estimated_load_percentage: 0.0,
            allocated_load_pct_cpu: 0.0,
            allocated_load_pct_memory: 0.0,
            allocated_load_pct_bandwidth_in: 0.0,
            allocated_load_pct_bandwidth_out: 0.0,
            estimated_max_capacity,
        };
        ranking.estimate_load_percentage();
        ranking
    }

    fn estimate_load_percentage(&mut self) {
        let mut combined = self.allocated_quota;
        combined.add(&self.pre_allocated_quota);

        self.allocated_load_pct_cpu = quota_percentage(
            combined.total_msg_rate() * self.cpu_factor,
            self.system_usage.cpu.limit,
        );
        self.allocated_load_pct_memory =
            quota_percentage(combined.memory, self.system_usage.memory.limit);
        self.allocated_load_pct_bandwidth_in = quota_percentage(
            combined.bandwidth_in / BYTES_PER_MBIT,
            self.system_usage.bandwidth_in.limit,
        );
        self.allocated_load_pct_bandwidth_out = quota_percentage(
            combined.bandwidth_out / BYTES_PER_MBIT,
            self.system_usage.bandwidth_out.limit,
        );

        let pairs = [
            (self.system_usage.cpu.percent_usage(), self.allocated_load_pct_cpu),
            (
                self.system_usage.memory.percent_usage(),
                self.allocated_load_pct_memory,
            ),
            (self.system_usage.direct_memory.percent_usage(), 0.0),
            (
                self.system_usage.bandwidth_in.percent_usage(),
                self.allocated_load_pct_bandwidth_in,
            ),
            (
                self.system_usage.bandwidth_out.percent_usage(),
                self.allocated_load_pct_bandwidth_out,
            ),
        ];
        self.estimated_load_percentage = pairs
            .iter()
            .map(|(actual, quota)| actual.max(*quota))
            .fold(0.0, f64::max);
    }

    pub fn estimated_load_percentage(&self) -> f64 {
        self.estimated_load_percentage
    }

    // How many default-sized bundles this broker's hardware can host.
    pub fn estimated_max_capacity(&self) -> i64 {
        self.estimated_max_capacity
    }

    pub fn is_idle(&self) -> bool {
        self.loaded_bundles.is_empty() && self.pre_allocated_bundles.is_empty()
    }

    pub fn is_service_unit_loaded(&self, service_unit: &str) -> bool {
        self.loaded_bundles.contains(service_unit)
    }

    pub fn is_service_unit_pre_allocated(&self, service_unit: &str) -> bool {
        self.pre_allocated_bundles.contains(service_unit)
    }

    pub fn add_pre_allocated_service_unit(&mut self, service_unit: &str, quota: &ResourceQuota) {
        if self.pre_allocated_bundles.insert(service_unit.to_owned()) {
            self.pre_allocated_quota.add(quota);
            self.estimate_load_percentage();
        }
    }

    pub fn remove_loaded_service_unit(&mut self, service_unit: &str, quota: &ResourceQuota) {
        if self.loaded_bundles.remove(service_unit) {
            self.allocated_quota.substract(quota);
            self.estimate_load_percentage();
        }
    }

    pub fn loaded_bundles(&self) -> &HashSet<String> {
        &self.loaded_bundles
    }

    pub fn pre_allocated_bundles(&self) -> &HashSet<String> {
        &self.pre_allocated_bundles
    }

    pub fn allocated_load_percentage_cpu(&self) -> f64 {
        self.allocated_load_pct_cpu
    }

    pub fn allocated_load_percentage_memory(&self) -> f64 {
        self.allocated_load_pct_memory
    }

    pub fn allocated_load_percentage_bandwidth_in(&self) -> f64 {
        self.allocated_load_pct_bandwidth_in
    }

    pub fn allocated_load_percentage_bandwidth_out(&self) -> f64 {
        self.allocated_load_pct_bandwidth_out
    }

    pub fn load_percentage_desc(&self) -> String {
        format!(
            "load: {:.1}%, cpu: {:.1}%, mem: {:.1}%, bandwidthIn: {:.1}%, bandwidthOut: {:.1}%",
            self.estimated_load_percentage,
            self.system_usage.cpu.percent_usage(),
            self.system_usage.memory.percent_usage(),
            self.system_usage.bandwidth_in.percent_usage(),
            self.system_usage.bandwidth_out.percent_usage(),
        )
    }

    // Lexicographic on (load percentage, -max capacity).
    pub fn compare_to(&self, other: &ResourceUnitRanking) -> Ordering {
        self.estimated_load_percentage
            .total_cmp(&other.estimated_load_percentage)
            .then(other.estimated_max_capacity.cmp(&self.estimated_max_capacity))
    }
}

fn quota_percentage(implied_usage: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        100.0 * implied_usage / limit
    } else {
        0.0
    }
}

// The number of default-quota bundles that fit within the broker's hardware
// limits, taking the most constrained resource. Resources with an unknown
// limit do not constrain the estimate.
pub(crate) fn calculate_broker_max_capacity(
    usage: &SystemResourceUsage,
    default_quota: &ResourceQuota,
    cpu_factor: f64,
) -> i64 {
    let per_bundle = [
        (usage.cpu.limit, default_quota.total_msg_rate() * cpu_factor),
        (usage.memory.limit, default_quota.memory),
        (
            usage.bandwidth_in.limit,
            default_quota.bandwidth_in / BYTES_PER_MBIT,
        ),
        (
            usage.bandwidth_out.limit,
            default_quota.bandwidth_out / BYTES_PER_MBIT,
        ),
    ];

    let mut capacity: Option<f64> = None;
    for (limit, cost) in per_bundle {
        if limit > 0.0 && cost > 0.0 {
            let fit = limit / cost;
            capacity = Some(capacity.map_or(fit, |current: f64| current.min(fit)));
        }
    }
    capacity.map_or(0, |value| value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::ResourceUsage;

    fn system_usage(cpu_pct: f64) -> SystemResourceUsage {
        SystemResourceUsage {
            cpu: ResourceUsage::new(cpu_pct, 100.0),
            memory: ResourceUsage::new(1024.0, 8192.0),
            direct_memory: ResourceUsage::new(0.0, 0.0),
            bandwidth_in: ResourceUsage::new(10.0, 1000.0),
            bandwidth_out: ResourceUsage::new(10.0, 1000.0),
        }
    }

    #[test]
    fn test_broker_name_from_resource_id() {
        let unit = ResourceUnit::new("http://broker-1.example.com:8080");
        assert_eq!(unit.broker_name(), "broker-1.example.com:8080");
        assert_eq!(unit.hostname(), "broker-1.example.com");
    }

    #[test]
    fn test_load_percentage_takes_worse_of_usage_and_quota() {
        // actual cpu is 20% but the allocated quota implies 50%:
        // 2000 msg/s * 0.025 cpu-per-msg / 100 limit
        let mut quota = ResourceQuota::zero();
        quota.msg_rate_in = 1000.0;
        quota.msg_rate_out = 1000.0;

        let ranking = ResourceUnitRanking::new(
            system_usage(20.0),
            ["p/c/ns/0x0_0xf".to_string()].into(),
            quota,
            HashSet::new(),
            ResourceQuota::zero(),
            0.025,
            &ResourceQuota::default(),
        );
        assert!((ranking.estimated_load_percentage() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_means_no_loaded_and_no_pre_allocated() {
        let mut ranking = ResourceUnitRanking::new(
            system_usage(0.0),
            HashSet::new(),
            ResourceQuota::zero(),
            HashSet::new(),
            ResourceQuota::zero(),
            0.025,
            &ResourceQuota::default(),
        );
        assert!(ranking.is_idle());

        ranking.add_pre_allocated_service_unit("p/c/ns/0x0_0xf", &ResourceQuota::default());
        assert!(!ranking.is_idle());
        assert!(ranking.is_service_unit_pre_allocated("p/c/ns/0x0_0xf"));
    }

    #[test]
    fn test_max_capacity_uses_most_constrained_resource() {
        // memory allows 8192/80 = 102 bundles, cpu allows
        // 100 / (160 * 0.025) = 25 bundles
        let capacity = calculate_broker_max_capacity(
            &system_usage(0.0),
            &ResourceQuota::default(),
            0.025,
        );
        assert_eq!(capacity, 25);
    }

    #[test]
    fn test_ordering_prefers_lower_load_then_bigger_capacity() {
        let low = ResourceUnitRanking::new(
            system_usage(10.0),
            HashSet::new(),
            ResourceQuota::zero(),
            HashSet::new(),
            ResourceQuota::zero(),
            0.025,
            &ResourceQuota::default(),
        );
        let high = ResourceUnitRanking::new(
            system_usage(90.0),
            HashSet::new(),
            ResourceQuota::zero(),
            HashSet::new(),
            ResourceQuota::zero(),
            0.025,
            &ResourceQuota::default(),
        );
        assert_eq!(low.compare_to(&high), Ordering::Less);
    }
}
