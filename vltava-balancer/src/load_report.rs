use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// The broker's periodic self-report, replicated to the metadata store under
// /loadbalance/brokers/<host>:<port>. The leader aggregates these to rank
// brokers, estimate quotas, shed load and split hot bundles.

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub usage: f64,
    pub limit: f64,
}

impl ResourceUsage {
    pub fn new(usage: f64, limit: f64) -> Self {
        ResourceUsage { usage, limit }
    }

    // A limit of zero means the probe could not determine it; such a
    // resource never counts against the broker.
    pub fn percent_usage(&self) -> f64 {
        if self.limit > 0.0 {
            100.0 * self.usage / self.limit
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Cpu,
    Memory,
    DirectMemory,
    BandwidthIn,
    BandwidthOut,
}

pub(crate) const RESOURCE_TYPES: [ResourceType; 5] = [
    ResourceType::Cpu,
    ResourceType::Memory,
    ResourceType::DirectMemory,
    ResourceType::BandwidthIn,
    ResourceType::BandwidthOut,
];

// Units: CPU usage/limit in percentage points (limit = 100 per core),
// memory in MB, bandwidth in Mbit/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemResourceUsage {
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    pub direct_memory: ResourceUsage,
    pub bandwidth_in: ResourceUsage,
    pub bandwidth_out: ResourceUsage,
}

impl SystemResourceUsage {
    pub fn resource(&self, kind: ResourceType) -> ResourceUsage {
        match kind {
            ResourceType::Cpu => self.cpu,
            ResourceType::Memory => self.memory,
            ResourceType::DirectMemory => self.direct_memory,
            ResourceType::BandwidthIn => self.bandwidth_in,
            ResourceType::BandwidthOut => self.bandwidth_out,
        }
    }

    pub fn is_above_load_level(&self, threshold_percentage: f64) -> bool {
        RESOURCE_TYPES
            .iter()
            .any(|&kind| self.resource(kind).percent_usage() > threshold_percentage)
    }

    pub fn is_below_load_level(&self, threshold_percentage: f64) -> bool {
        RESOURCE_TYPES
            .iter()
            .all(|&kind| self.resource(kind).percent_usage() < threshold_percentage)
    }
}

// How many 500-entity groups a bundle's topics, producers and consumers
// amount to; the memory factor is expressed per group.
pub(crate) const MEM_OBJECT_GROUP_SIZE: u64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceBundleStats {
    pub topics: u64,
    pub producer_count: u64,
    pub consumer_count: u64,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub msg_throughput_in: f64,
    pub msg_throughput_out: f64,
}

impl NamespaceBundleStats {
    pub(crate) fn memory_groups(&self) -> u64 {
        1 + (self.topics + self.producer_count + self.consumer_count) / MEM_OBJECT_GROUP_SIZE
    }

    // The bundle's contribution to one resource dimension, used to decide
    // which bundle to shed first from an overloaded broker.
    pub(crate) fn contribution_to(&self, kind: ResourceType) -> f64 {
        match kind {
            ResourceType::Cpu => self.msg_rate_in + self.msg_rate_out,
            ResourceType::Memory | ResourceType::DirectMemory => {
                (self.topics + self.producer_count + self.consumer_count) as f64
            }
            ResourceType::BandwidthIn => self.msg_throughput_in,
            ResourceType::BandwidthOut => self.msg_throughput_out,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    // <host>:<port> of the reporting broker
    pub broker_name: String,
    pub web_addr: String,
    pub web_addr_tls: Option<String>,
    pub broker_addr: String,
    pub broker_addr_tls: Option<String>,
    // epoch milliseconds; monotonic per broker
    pub timestamp: i64,
    pub system_usage: SystemResourceUsage,
    pub bundle_stats: HashMap<String, NamespaceBundleStats>,
    pub overloaded: bool,
    pub underloaded: bool,
}

impl LoadReport {
    pub fn new(
        broker_name: impl Into<String>,
        web_addr: impl Into<String>,
        web_addr_tls: Option<String>,
        broker_addr: impl Into<String>,
        broker_addr_tls: Option<String>,
    ) -> Self {
        LoadReport {
            broker_name: broker_name.into(),
            web_addr: web_addr.into(),
            web_addr_tls,
            broker_addr: broker_addr.into(),
            broker_addr_tls,
            ..Default::default()
        }
    }

    pub fn msg_rate_in(&self) -> f64 {
        self.bundle_stats.values().map(|stats| stats.msg_rate_in).sum()
    }

    pub fn msg_rate_out(&self) -> f64 {
        self.bundle_stats.values().map(|stats| stats.msg_rate_out).sum()
    }

    pub fn num_bundles(&self) -> usize {
        self.bundle_stats.len()
    }

    pub fn bundles(&self) -> HashSet<String> {
        self.bundle_stats.keys().cloned().collect()
    }

    // The resource dimension closest to its limit.
    pub fn bottleneck_resource_type(&self) -> ResourceType {
        let mut bottleneck = ResourceType::Cpu;
        let mut highest = f64::MIN;
        for &kind in &RESOURCE_TYPES {
            let pct = self.system_usage.resource(kind).percent_usage();
            if pct > highest {
                highest = pct;
                bottleneck = kind;
            }
        }
        bottleneck
    }

    // Bundles ordered by descending contribution to the given resource.
    pub fn sorted_bundle_stats(
        &self,
        kind: ResourceType,
    ) -> Vec<(&String, &NamespaceBundleStats)> {
        let mut sorted: Vec<_> = self.bundle_stats.iter().collect();
        sorted.sort_by(|a, b| {
            b.1.contribution_to(kind)
                .total_cmp(&a.1.contribution_to(kind))
        });
        sorted
    }
}

// Per-bundle statistics of the local broker, provided by the broker service.
pub trait BundleStatsSource: Send + Sync + 'static {
    fn bundle_stats(&self) -> HashMap<String, NamespaceBundleStats>;
}

impl BundleStatsSource for HashMap<String, NamespaceBundleStats> {
    fn bundle_stats(&self) -> HashMap<String, NamespaceBundleStats> {
        self.clone()
    }
}
