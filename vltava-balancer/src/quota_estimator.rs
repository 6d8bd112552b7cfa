use std::collections::HashMap;

use crate::load_report::LoadReport;
use crate::resource_quota::{
    ResourceQuota, RESOURCE_QUOTA_MAX_BANDWIDTH_IN, RESOURCE_QUOTA_MAX_BANDWIDTH_OUT,
    RESOURCE_QUOTA_MAX_CPU_FACTOR, RESOURCE_QUOTA_MAX_MEMORY, RESOURCE_QUOTA_MAX_MEM_FACTOR,
    RESOURCE_QUOTA_MAX_MSG_RATE_IN, RESOURCE_QUOTA_MAX_MSG_RATE_OUT,
    RESOURCE_QUOTA_MIN_BANDWIDTH_IN, RESOURCE_QUOTA_MIN_BANDWIDTH_OUT,
    RESOURCE_QUOTA_MIN_CPU_FACTOR, RESOURCE_QUOTA_MIN_MEMORY, RESOURCE_QUOTA_MIN_MEM_FACTOR,
    RESOURCE_QUOTA_MIN_MSG_RATE_IN, RESOURCE_QUOTA_MIN_MSG_RATE_OUT,
};

// Asymmetric smoothing windows: quotas ramp up within 30 minutes but decay
// over a full day, damping transient dips while following real growth.
pub(crate) const RESOURCE_QUOTA_GO_UP_TIMEWINDOW_MS: i64 = 30 * 60 * 1000;
pub(crate) const RESOURCE_QUOTA_GO_DOWN_TIMEWINDOW_MS: i64 = 1440 * 60 * 1000;

// Exponentially-weighted update toward a clamped sample. The weight is the
// fraction of the applicable time window that has elapsed since the last
// update, capped at 1.
pub(crate) fn time_smooth_value(
    old_value: f64,
    new_sample: f64,
    min_value: f64,
    max_value: f64,
    time_past_ms: i64,
) -> f64 {
    let mut sample = new_sample.max(min_value);
    if max_value > 0.0 {
        sample = sample.min(max_value);
    }

    let window = if sample >= old_value {
        RESOURCE_QUOTA_GO_UP_TIMEWINDOW_MS
    } else {
        RESOURCE_QUOTA_GO_DOWN_TIMEWINDOW_MS
    };
    let weight = (time_past_ms as f64 / window as f64).clamp(0.0, 1.0);

    (1.0 - weight) * old_value + weight * sample
}

fn time_smooth_quota(
    old_quota: &ResourceQuota,
    msg_rate_in: f64,
    msg_rate_out: f64,
    bandwidth_in: f64,
    bandwidth_out: f64,
    memory: f64,
    time_past_ms: i64,
) -> ResourceQuota {
    if !old_quota.dynamic {
        return *old_quota;
    }

    ResourceQuota {
        msg_rate_in: time_smooth_value(
            old_quota.msg_rate_in,
            msg_rate_in,
            RESOURCE_QUOTA_MIN_MSG_RATE_IN,
            RESOURCE_QUOTA_MAX_MSG_RATE_IN,
            time_past_ms,
        ),
        msg_rate_out: time_smooth_value(
            old_quota.msg_rate_out,
            msg_rate_out,
            RESOURCE_QUOTA_MIN_MSG_RATE_OUT,
            RESOURCE_QUOTA_MAX_MSG_RATE_OUT,
            time_past_ms,
        ),
        bandwidth_in: time_smooth_value(
            old_quota.bandwidth_in,
            bandwidth_in,
            RESOURCE_QUOTA_MIN_BANDWIDTH_IN,
            RESOURCE_QUOTA_MAX_BANDWIDTH_IN,
            time_past_ms,
        ),
        bandwidth_out: time_smooth_value(
            old_quota.bandwidth_out,
            bandwidth_out,
            RESOURCE_QUOTA_MIN_BANDWIDTH_OUT,
            RESOURCE_QUOTA_MAX_BANDWIDTH_OUT,
            time_past_ms,
        ),
        memory: time_smooth_value(
            old_quota.memory,
            memory,
            RESOURCE_QUOTA_MIN_MEMORY,
            RESOURCE_QUOTA_MAX_MEMORY,
            time_past_ms,
        ),
        dynamic: true,
    }
}

// Cluster-wide smoother over the current set of load reports. Produces the
// CPU-per-message-rate factor, the memory-per-entity-group factor, the
// average bundle quota (which doubles as the default quota) and a realtime
// quota per bundle.
#[derive(Debug, Clone)]
pub struct QuotaEstimator {
    // expected CPU percentage points per msg/s
    cpu_load_factor: f64,
    // expected MB per 500 (topics + producers + consumers)
    memory_load_factor: f64,
    avg_resource_quota: ResourceQuota,
    bundle_quotas: HashMap<String, ResourceQuota>,
    last_update_timestamp: i64,
}

impl Default for QuotaEstimator {
    fn default() -> Self {
        QuotaEstimator {
            cpu_load_factor: 0.025,
            memory_load_factor: 25.0,
            avg_resource_quota: ResourceQuota::default(),
            bundle_quotas: HashMap::new(),
            last_update_timestamp: -1,
        }
    }
}

impl QuotaEstimator {
    pub fn cpu_load_factor(&self) -> f64 {
        self.cpu_load_factor
    }

    pub fn set_cpu_load_factor(&mut self, factor: f64) {
        self.cpu_load_factor = factor;
    }

    pub fn memory_load_factor(&self) -> f64 {
        self.memory_load_factor
    }

    pub fn set_memory_load_factor(&mut self, factor: f64) {
        self.memory_load_factor = factor;
    }

    // The smoothed average bundle quota, which is also the quota assumed for
    // bundles the estimator has never seen.
    pub fn default_quota(&self) -> ResourceQuota {
        self.avg_resource_quota
    }

    pub fn set_default_quota(&mut self, quota: ResourceQuota) {
        self.avg_resource_quota = quota;
    }

    pub fn quota_for(&self, bundle: &str) -> ResourceQuota {
        self.bundle_quotas
            .get(bundle)
            .copied()
            .unwrap_or(self.avg_resource_quota)
    }

    pub fn bundle_quotas(&self) -> &HashMap<String, ResourceQuota> {
        &self.bundle_quotas
    }

    pub fn total_allocated_quota<'a>(
        &self,
        bundles: impl IntoIterator<Item = &'a String>,
    ) -> ResourceQuota {
        let mut total = ResourceQuota::zero();
        for bundle in bundles {
            total.add(&self.quota_for(bundle));
        }
        total
    }

    // One estimation tick over the current reports: aggregate rates, usage
    // and entity groups, then smooth the factors, the average quota and
    // every observed bundle's quota.
    pub fn update<'a>(&mut self, reports: impl IntoIterator<Item = &'a LoadReport>) {
        let mut total_bundles: u64 = 0;
        let mut total_mem_groups: u64 = 0;
        let mut total_msg_rate_in = 0.0;
        let mut total_msg_rate_out = 0.0;
        let mut total_cpu_usage = 0.0;
        let mut total_memory_usage = 0.0;
        let mut total_bandwidth_in = 0.0;
        let mut total_bandwidth_out = 0.0;
        let mut report_timestamp: i64 = -1;

        let reports: Vec<&LoadReport> = reports.into_iter().collect();
        if reports.is_empty() {
            return;
        }

        for report in &reports {
            if report.timestamp > report_timestamp {
                report_timestamp = report.timestamp;
            }

            for stats in report.bundle_stats.values() {
                total_bundles += 1;
                total_mem_groups += stats.memory_groups();
                total_bandwidth_in += stats.msg_throughput_in;
                total_bandwidth_out += stats.msg_throughput_out;
            }

            total_msg_rate_in += report.msg_rate_in();
            total_msg_rate_out += report.msg_rate_out();
            total_cpu_usage += report.system_usage.cpu.usage;
            total_memory_usage += report.system_usage.memory.usage;
        }

        let total_msg_rate = total_msg_rate_in + total_msg_rate_out;
        let time_past = if self.last_update_timestamp < 0 {
            0
        } else {
            report_timestamp - self.last_update_timestamp
        };
        self.last_update_timestamp = report_timestamp;

        // only re-estimate the factors when the cluster carries enough
        // traffic for the ratio to be meaningful
        if total_msg_rate > 1000.0 && total_mem_groups > 30 {
            self.cpu_load_factor = time_smooth_value(
                self.cpu_load_factor,
                total_cpu_usage / total_msg_rate,
                RESOURCE_QUOTA_MIN_CPU_FACTOR,
                RESOURCE_QUOTA_MAX_CPU_FACTOR,
                time_past,
            );
            self.memory_load_factor = time_smooth_value(
                self.memory_load_factor,
                total_memory_usage / total_mem_groups as f64,
                RESOURCE_QUOTA_MIN_MEM_FACTOR,
                RESOURCE_QUOTA_MAX_MEM_FACTOR,
                time_past,
            );
        }

        if total_bundles > 30 && self.avg_resource_quota.dynamic {
            let bundles = total_bundles as f64;
            self.avg_resource_quota = time_smooth_quota(
                &self.avg_resource_quota,
                total_msg_rate_in / bundles,
                total_msg_rate_out / bundles,
                total_bandwidth_in / bundles,
                total_bandwidth_out / bundles,
                total_memory_usage / bundles,
                time_past,
            );
        }

        let mut new_quotas = HashMap::new();
        for report in &reports {
            for (bundle, stats) in &report.bundle_stats {
                let memory_quota = stats.memory_groups() as f64 * self.memory_load_factor;
                let old_quota = self.quota_for(bundle);
                new_quotas.insert(
                    bundle.clone(),
                    time_smooth_quota(
                        &old_quota,
                        stats.msg_rate_in,
                        stats.msg_rate_out,
                        stats.msg_throughput_in,
                        stats.msg_throughput_out,
                        memory_quota,
                        time_past,
                    ),
                );
            }
        }
        self.bundle_quotas = new_quotas;
    }
}
