use crate::placement::LoadBalancerStrategy;

// Static configuration of the controller. The threshold and strategy fields
// are fallbacks: when the corresponding dynamic setting exists under
// /loadbalance/settings it takes precedence.
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    /// Advertised hostname of this broker.
    pub advertised_address: String,
    /// Port of the broker's web service; <host>:<port> is the broker name.
    pub web_service_port: u16,
    pub web_service_url: String,
    pub web_service_url_tls: Option<String>,
    pub broker_service_url: String,
    pub broker_service_url_tls: Option<String>,
    pub load_balancer: LoadBalancerConfig,
}

impl ServiceConfiguration {
    pub fn new(advertised_address: impl Into<String>, web_service_port: u16) -> Self {
        let advertised_address = advertised_address.into();
        ServiceConfiguration {
            web_service_url: format!("http://{}:{}", advertised_address, web_service_port),
            web_service_url_tls: None,
            broker_service_url: format!("vltava://{}:6650", advertised_address),
            broker_service_url_tls: None,
            advertised_address,
            web_service_port,
            load_balancer: LoadBalancerConfig::default(),
        }
    }

    // The broker's name under /loadbalance/brokers.
    pub fn broker_name(&self) -> String {
        format!("{}:{}", self.advertised_address, self.web_service_port)
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub enabled: bool,
    pub placement_strategy: LoadBalancerStrategy,
    pub underload_threshold_pct: f64,
    pub overload_threshold_pct: f64,
    pub comfort_load_threshold_pct: f64,
    pub shedding_interval_minutes: u64,
    pub shedding_grace_period_minutes: u64,
    pub report_update_threshold_pct: f64,
    pub report_update_max_interval_minutes: u64,
    pub host_usage_check_interval_minutes: u64,
    pub namespace_maximum_bundles: usize,
    pub namespace_bundle_max_topics: u64,
    pub namespace_bundle_max_sessions: u64,
    pub namespace_bundle_max_msg_rate: f64,
    pub namespace_bundle_max_bandwidth_mbytes: f64,
    pub auto_bundle_split_enabled: bool,
    pub bundle_split_check_interval_minutes: u64,
    pub quota_update_interval_minutes: u64,
    // Reproduce the historical cross-field bandwidth comparison when
    // deciding whether a smoothed quota is worth writing back.
    pub legacy_bandwidth_in_compare: bool,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        LoadBalancerConfig {
            enabled: true,
            placement_strategy: LoadBalancerStrategy::WeightedRandomSelection,
            underload_threshold_pct: 50.0,
            overload_threshold_pct: 85.0,
            comfort_load_threshold_pct: 65.0,
            shedding_interval_minutes: 30,
            shedding_grace_period_minutes: 30,
            report_update_threshold_pct: 10.0,
            report_update_max_interval_minutes: 5,
            host_usage_check_interval_minutes: 1,
            namespace_maximum_bundles: 128,
            namespace_bundle_max_topics: 1000,
            namespace_bundle_max_sessions: 1000,
            namespace_bundle_max_msg_rate: 1000.0,
            namespace_bundle_max_bandwidth_mbytes: 100.0,
            auto_bundle_split_enabled: false,
            bundle_split_check_interval_minutes: 1,
            quota_update_interval_minutes: 15,
            legacy_bandwidth_in_compare: false,
        }
    }
}
