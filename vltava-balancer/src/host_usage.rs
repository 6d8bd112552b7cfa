use anyhow::Result;
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{Networks, System};

use crate::load_report::{ResourceUsage, SystemResourceUsage};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BITS_PER_MBIT: f64 = 1_000_000.0;

// Probe producing the broker host's raw resource usage. The balancer only
// depends on this contract; deployments plug in the sysinfo-backed probe
// below, tests a fixed one.
pub trait HostUsage: Send + Sync + 'static {
    fn host_usage(&self) -> Result<SystemResourceUsage>;
}

// Host probe backed by the sysinfo crate. CPU is reported in percentage
// points with a limit of 100 per core, memory in MB, bandwidth in Mbit/s
// against a configured NIC limit. Direct memory is left unknown (limit 0),
// which the balancer ignores.
pub struct SysinfoHostUsage {
    state: Mutex<ProbeState>,
    bandwidth_limit_mbps: f64,
}

struct ProbeState {
    system: System,
    networks: Networks,
    last_refresh: Instant,
}

impl SysinfoHostUsage {
    pub fn new(bandwidth_limit_mbps: f64) -> Self {
        SysinfoHostUsage {
            state: Mutex::new(ProbeState {
                system: System::new(),
                networks: Networks::new_with_refreshed_list(),
                last_refresh: Instant::now(),
            }),
            bandwidth_limit_mbps,
        }
    }
}

impl HostUsage for SysinfoHostUsage {
    fn host_usage(&self) -> Result<SystemResourceUsage> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("host probe state poisoned"))?;

        state.system.refresh_cpu_usage();
        state.system.refresh_memory();
        state.networks.refresh();

        let elapsed_secs = state.last_refresh.elapsed().as_secs_f64().max(1.0);
        state.last_refresh = Instant::now();

        let cores = state.system.cpus().len().max(1) as f64;
        // global_cpu_usage is 0-100 across all cores; scale to points
        let cpu_usage = state.system.global_cpu_usage() as f64 * cores;

        let mut received_bytes = 0.0;
        let mut transmitted_bytes = 0.0;
        for (_, data) in state.networks.iter() {
            received_bytes += data.received() as f64;
            transmitted_bytes += data.transmitted() as f64;
        }
        let bandwidth_in = received_bytes * 8.0 / elapsed_secs / BITS_PER_MBIT;
        let bandwidth_out = transmitted_bytes * 8.0 / elapsed_secs / BITS_PER_MBIT;

        Ok(SystemResourceUsage {
            cpu: ResourceUsage::new(cpu_usage, 100.0 * cores),
            memory: ResourceUsage::new(
                state.system.used_memory() as f64 / BYTES_PER_MB,
                state.system.total_memory() as f64 / BYTES_PER_MB,
            ),
            direct_memory: ResourceUsage::new(0.0, 0.0),
            bandwidth_in: ResourceUsage::new(bandwidth_in, self.bandwidth_limit_mbps),
            bandwidth_out: ResourceUsage::new(bandwidth_out, self.bandwidth_limit_mbps),
        })
    }
}

// Fixed probe for tests and simulations.
#[derive(Debug, Clone)]
pub struct FixedHostUsage(pub SystemResourceUsage);

impl HostUsage for FixedHostUsage {
    fn host_usage(&self) -> Result<SystemResourceUsage> {
        Ok(self.0)
    }
}
