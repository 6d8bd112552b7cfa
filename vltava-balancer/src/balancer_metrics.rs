use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;

use crate::ranking::ResourceUnitRanking;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const GAUGES: [Metric; 5] = [
    LOAD_RANK,
    QUOTA_PCT_CPU,
    QUOTA_PCT_MEMORY,
    QUOTA_PCT_BANDWIDTH_IN,
    QUOTA_PCT_BANDWIDTH_OUT,
];

pub(crate) const LOAD_RANK: Metric = Metric {
    name: "brk_lb_load_rank",
    description: "Final load-balancer rank of the broker",
};

pub(crate) const QUOTA_PCT_CPU: Metric = Metric {
    name: "brk_lb_quota_pct_cpu",
    description: "CPU percentage implied by the quota allocated to the broker",
};

pub(crate) const QUOTA_PCT_MEMORY: Metric = Metric {
    name: "brk_lb_quota_pct_memory",
    description: "Memory percentage implied by the quota allocated to the broker",
};

pub(crate) const QUOTA_PCT_BANDWIDTH_IN: Metric = Metric {
    name: "brk_lb_quota_pct_bandwidth_in",
    description: "Inbound bandwidth percentage implied by the quota allocated to the broker",
};

pub(crate) const QUOTA_PCT_BANDWIDTH_OUT: Metric = Metric {
    name: "brk_lb_quota_pct_bandwidth_out",
    description: "Outbound bandwidth percentage implied by the quota allocated to the broker",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>) {
    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("failed to install Prometheus recorder");
    }

    for metric in GAUGES {
        metrics::describe_gauge!(metric.name, metric.description);
        let _gauge = metrics::gauge!(metric.name);
    }
}

// Snapshot of the balancer gauges for one broker, also exposed in-process.
#[derive(Debug, Clone)]
pub struct LoadBalancingMetrics {
    pub broker: String,
    pub metrics: HashMap<&'static str, f64>,
}

pub(crate) fn update_load_balancing_metrics(
    broker: &str,
    final_rank: i64,
    ranking: &ResourceUnitRanking,
) -> LoadBalancingMetrics {
    let values = [
        (LOAD_RANK.name, final_rank as f64),
        (QUOTA_PCT_CPU.name, ranking.allocated_load_percentage_cpu()),
        (
            QUOTA_PCT_MEMORY.name,
            ranking.allocated_load_percentage_memory(),
        ),
        (
            QUOTA_PCT_BANDWIDTH_IN.name,
            ranking.allocated_load_percentage_bandwidth_in(),
        ),
        (
            QUOTA_PCT_BANDWIDTH_OUT.name,
            ranking.allocated_load_percentage_bandwidth_out(),
        ),
    ];

    for (name, value) in values {
        metrics::gauge!(name, "broker" => broker.to_owned()).set(value);
    }

    LoadBalancingMetrics {
        broker: broker.to_owned(),
        metrics: values.into_iter().collect(),
    }
}
