use serde::{Deserialize, Serialize};

// Bounds applied to every dynamically smoothed quota field and to the
// cluster-wide load factors.
pub(crate) const RESOURCE_QUOTA_MIN_MSG_RATE_IN: f64 = 5.0;
pub(crate) const RESOURCE_QUOTA_MAX_MSG_RATE_IN: f64 = 5000.0;
pub(crate) const RESOURCE_QUOTA_MIN_MSG_RATE_OUT: f64 = 5.0;
pub(crate) const RESOURCE_QUOTA_MAX_MSG_RATE_OUT: f64 = 5000.0;
pub(crate) const RESOURCE_QUOTA_MIN_BANDWIDTH_IN: f64 = 10_000.0;
pub(crate) const RESOURCE_QUOTA_MAX_BANDWIDTH_IN: f64 = 1_000_000.0;
pub(crate) const RESOURCE_QUOTA_MIN_BANDWIDTH_OUT: f64 = 10_000.0;
pub(crate) const RESOURCE_QUOTA_MAX_BANDWIDTH_OUT: f64 = 1_000_000.0;
pub(crate) const RESOURCE_QUOTA_MIN_MEMORY: f64 = 2.0;
pub(crate) const RESOURCE_QUOTA_MAX_MEMORY: f64 = 200.0;
pub(crate) const RESOURCE_QUOTA_MIN_CPU_FACTOR: f64 = 0.01;
pub(crate) const RESOURCE_QUOTA_MAX_CPU_FACTOR: f64 = 0.1;
pub(crate) const RESOURCE_QUOTA_MIN_MEM_FACTOR: f64 = 10.0;
pub(crate) const RESOURCE_QUOTA_MAX_MEM_FACTOR: f64 = 50.0;

// The resources one service unit is expected to consume. Message rates in
// msg/s, bandwidth in bytes/s, memory in MB. A static quota (dynamic=false)
// is administrator-pinned and exempt from smoothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub bandwidth_in: f64,
    pub bandwidth_out: f64,
    pub memory: f64,
    pub dynamic: bool,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        ResourceQuota {
            msg_rate_in: 40.0,
            msg_rate_out: 120.0,
            bandwidth_in: 100_000.0,
            bandwidth_out: 300_000.0,
            memory: 80.0,
            dynamic: true,
        }
    }
}

impl ResourceQuota {
    pub fn add(&mut self, other: &ResourceQuota) {
        self.msg_rate_in += other.msg_rate_in;
        self.msg_rate_out += other.msg_rate_out;
        self.bandwidth_in += other.bandwidth_in;
        self.bandwidth_out += other.bandwidth_out;
        self.memory += other.memory;
    }

    pub fn substract(&mut self, other: &ResourceQuota) {
        self.msg_rate_in = (self.msg_rate_in - other.msg_rate_in).max(0.0);
        self.msg_rate_out = (self.msg_rate_out - other.msg_rate_out).max(0.0);
        self.bandwidth_in = (self.bandwidth_in - other.bandwidth_in).max(0.0);
        self.bandwidth_out = (self.bandwidth_out - other.bandwidth_out).max(0.0);
        self.memory = (self.memory - other.memory).max(0.0);
    }

    // Aggregate message rate, used to convert a quota into an expected CPU
    // load through the cluster cpu factor.
    pub fn total_msg_rate(&self) -> f64 {
        self.msg_rate_in + self.msg_rate_out
    }

    pub fn zero() -> Self {
        ResourceQuota {
            msg_rate_in: 0.0,
            msg_rate_out: 0.0,
            bandwidth_in: 0.0,
            bandwidth_out: 0.0,
            memory: 0.0,
            dynamic: true,
        }
    }
}
