use anyhow::{anyhow, Result};
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use vltava_metadata_store::{MetadataStore, StorageBackend, WatchEvent};

use crate::admin_client::{AdminClientCache, BrokerAdminFactory};
use crate::balancer_metrics::{update_load_balancing_metrics, LoadBalancingMetrics};
use crate::host_usage::HostUsage;
use crate::isolation::SimpleAllocationPolicies;
use crate::load_report::{
    BundleStatsSource, LoadReport, SystemResourceUsage, RESOURCE_TYPES,
};
use crate::placement::{
    find_broker_for_placement, get_final_candidates, record_assignment,
    weighted_random_selection, LoadBalancerStrategy, SortedRankings,
};
use crate::quota_estimator::QuotaEstimator;
use crate::ranking::{calculate_broker_max_capacity, ResourceUnit, ResourceUnitRanking};
use crate::resource_quota::{
    ResourceQuota, RESOURCE_QUOTA_MIN_BANDWIDTH_IN, RESOURCE_QUOTA_MIN_BANDWIDTH_OUT,
    RESOURCE_QUOTA_MIN_MEMORY, RESOURCE_QUOTA_MIN_MSG_RATE_IN, RESOURCE_QUOTA_MIN_MSG_RATE_OUT,
};
use crate::resources::{
    join_path, LOADBALANCE_BROKERS_ROOT, LOAD_SHEDDING_UNLOAD_DISABLED_PATH,
    RESOURCE_QUOTA_BUNDLE_ROOT, RESOURCE_QUOTA_DEFAULT_PATH, SETTING_AUTO_BUNDLE_SPLIT_PATH,
    SETTING_COMFORT_LOAD_THRESHOLD_PATH, SETTING_LOAD_FACTOR_CPU_PATH,
    SETTING_LOAD_FACTOR_MEM_PATH, SETTING_NAME_AUTO_BUNDLE_SPLIT,
    SETTING_NAME_COMFORT_LOAD_THRESHOLD, SETTING_NAME_LOAD_FACTOR_CPU,
    SETTING_NAME_LOAD_FACTOR_MEM, SETTING_NAME_OVERLOAD_THRESHOLD, SETTING_NAME_STRATEGY,
    SETTING_NAME_UNDERLOAD_THRESHOLD, SETTING_OVERLOAD_THRESHOLD_PATH, SETTING_STRATEGY_PATH,
    SETTING_UNDERLOAD_THRESHOLD_PATH,
};
use crate::service_configuration::ServiceConfiguration;
use crate::service_unit::{namespace_of_bundle, range_of_bundle, ServiceUnitId};
use crate::shedder::{select_bundles_to_unload, SheddingTracker};
use crate::splitter::{find_bundles_to_split, BundleSplitLimits};

// Write the broker's load report at most every 5 seconds.
pub(crate) const LOAD_REPORT_UPDATE_MINIMUM_INTERVAL_MS: i64 = 5_000;

const MBYTES: f64 = 1024.0 * 1024.0;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

// "Am I the leader" flag, flipped by the external leader election. Only the
// leader runs shedding, splitting and the quota write-back.
#[derive(Debug, Clone, Default)]
pub struct LeaderStatus(Arc<AtomicBool>);

impl LeaderStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leading(&self, leading: bool) {
        self.0.store(leading, Ordering::SeqCst);
    }

    pub fn is_leading(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// The in-memory cluster view, mutated only by the rank updater and by
// placement. One mutex covers the reports, the quota estimator and the
// rankings so every ranking pass observes a consistent quota snapshot.
#[derive(Debug, Default)]
struct LoadState {
    current_load_reports: HashMap<ResourceUnit, LoadReport>,
    resource_unit_rankings: HashMap<ResourceUnit, ResourceUnitRanking>,
    estimator: QuotaEstimator,
    broker_rotation_cursor: u64,
}

// Local report-writer state, touched only by the report writer task.
#[derive(Debug, Default)]
struct ReportState {
    last_load_report: Option<LoadReport>,
    last_resource_usage_timestamp: i64,
    avg_memory_usage_mb: f64,
}

// The load-balancing controller. Every broker runs one; the elected leader
// additionally ranks the cluster, decides placements, sheds load from
// overloaded brokers, splits hot bundles and publishes smoothed quotas.
pub struct LoadManager {
    config: ServiceConfiguration,
    store: StorageBackend,
    host_usage: Arc<dyn HostUsage>,
    bundle_stats_source: Arc<dyn BundleStatsSource>,
    admin_clients: AdminClientCache,
    policies: SimpleAllocationPolicies,
    leader: LeaderStatus,
    loads: Arc<Mutex<LoadState>>,
    // published as a whole-map snapshot: readers clone the Arc and never
    // observe a half-built ranking
    sorted_rankings: Arc<Mutex<Arc<SortedRankings>>>,
    report: Arc<Mutex<ReportState>>,
    force_load_report_update: AtomicBool,
    shedding: Arc<Mutex<SheddingTracker>>,
    load_balancing_metrics: Arc<Mutex<Vec<LoadBalancingMetrics>>>,
    broker_report_path: String,
}

impl LoadManager {
    pub fn new(
        config: ServiceConfiguration,
        store: StorageBackend,
        host_usage: Arc<dyn HostUsage>,
        bundle_stats_source: Arc<dyn BundleStatsSource>,
        admin_factory: BrokerAdminFactory,
        policies: SimpleAllocationPolicies,
        leader: LeaderStatus,
    ) -> Self {
        let broker_report_path = join_path(&[LOADBALANCE_BROKERS_ROOT, &config.broker_name()]);
        let grace_period = config.load_balancer.shedding_grace_period_minutes;

        LoadManager {
            config,
            store,
            host_usage,
            bundle_stats_source,
            admin_clients: AdminClientCache::new(admin_factory),
            policies,
            leader,
            loads: Arc::new(Mutex::new(LoadState::default())),
            sorted_rankings: Arc::new(Mutex::new(Arc::new(SortedRankings::new()))),
            report: Arc::new(Mutex::new(ReportState::default())),
            force_load_report_update: AtomicBool::new(false),
            shedding: Arc::new(Mutex::new(SheddingTracker::new(grace_period))),
            load_balancing_metrics: Arc::new(Mutex::new(Vec::new())),
            broker_report_path,
        }
    }

    pub fn leader(&self) -> &LeaderStatus {
        &self.leader
    }

    // Register this broker in the cluster and produce the watch channel the
    // event loop consumes. Failing to create the broker's own ephemeral
    // report node is fatal.
    pub async fn bootstrap(&self) -> Result<mpsc::Receiver<WatchEvent>> {
        let overload = self.overload_threshold().await;
        let underload = self.underload_threshold().await;

        let first_report = {
            let mut state = self.report.lock().await;
            match self.generate_report(&mut state, overload, underload) {
                Ok(report) => report,
                Err(error) => {
                    warn!("unable to probe host usage for the first report: {}", error);
                    let mut report = LoadReport::new(
                        self.config.broker_name(),
                        self.config.web_service_url.clone(),
                        self.config.web_service_url_tls.clone(),
                        self.config.broker_service_url.clone(),
                        self.config.broker_service_url_tls.clone(),
                    );
                    report.timestamp = now_millis();
                    report
                }
            }
        };

        let payload = serde_json::to_vec(&first_report)?;
        self.store
            .create_ephemeral(&self.broker_report_path, payload)
            .await
            .map_err(|error| {
                anyhow!(
                    "unable to create broker node {}: {}",
                    self.broker_report_path,
                    error
                )
            })?;
        info!("created broker ephemeral node on {}", self.broker_report_path);

        {
            let mut state = self.report.lock().await;
            state.last_resource_usage_timestamp = first_report.timestamp;
            state.last_load_report = Some(first_report);
        }

        // pick up the factors and the default quota persisted by a previous
        // leader before the first ranking pass
        let (cpu_default, mem_default) = {
            let loads = self.loads.lock().await;
            (
                loads.estimator.cpu_load_factor(),
                loads.estimator.memory_load_factor(),
            )
        };
        let cpu_factor = self
            .dynamic_setting_f64(
                SETTING_LOAD_FACTOR_CPU_PATH,
                SETTING_NAME_LOAD_FACTOR_CPU,
                cpu_default,
            )
            .await;
        let mem_factor = self
            .dynamic_setting_f64(
                SETTING_LOAD_FACTOR_MEM_PATH,
                SETTING_NAME_LOAD_FACTOR_MEM,
                mem_default,
            )
            .await;
        let stored_default_quota = self.read_stored_quota(RESOURCE_QUOTA_DEFAULT_PATH).await;
        {
            let mut loads = self.loads.lock().await;
            loads.estimator.set_cpu_load_factor(cpu_factor);
            loads.estimator.set_memory_load_factor(mem_factor);
            if let Some(quota) = stored_default_quota {
                loads.estimator.set_default_quota(quota);
            }
        }

        // first ranking pass, so placement works before any watch event
        self.update_ranking().await;

        let mut stream = self.store.watch(LOADBALANCE_BROKERS_ROOT).await?;
        let (tx_event, rx_event) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(event) => {
                        if tx_event.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!("error receiving broker watch event: {}", error),
                }
            }
        });

        Ok(rx_event)
    }

    // Event loop: every change under /loadbalance/brokers re-runs the rank
    // updater. Watch callbacks only enqueue; the update itself runs here.
    pub async fn start(&self, mut rx_event: mpsc::Receiver<WatchEvent>) {
        while let Some(event) = rx_event.recv().await {
            debug!(
                "broker load change on {:?}, re-ranking",
                String::from_utf8_lossy(event.key())
            );
            self.update_ranking().await;
        }
    }

    // Periodic tasks: the report writer runs everywhere, the rest only act
    // on the leader. The handles let the embedding broker abort on shutdown.
    pub fn start_scheduled_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let lb = &self.config.load_balancer;

        let manager = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(
                LOAD_REPORT_UPDATE_MINIMUM_INTERVAL_MS as u64,
            ));
            loop {
                ticker.tick().await;
                if let Err(error) = manager.write_load_report_if_needed().await {
                    warn!("failed to write load report: {}", error);
                }
            }
        }));

        let manager = self.clone();
        let shedding_interval = lb.shedding_interval_minutes * 60;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(shedding_interval.max(1)));
            loop {
                ticker.tick().await;
                manager.do_load_shedding().await;
            }
        }));

        let manager = self.clone();
        let split_interval = lb.bundle_split_check_interval_minutes * 60;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(split_interval.max(1)));
            loop {
                ticker.tick().await;
                manager.do_namespace_bundle_split().await;
            }
        }));

        let manager = self.clone();
        let quota_interval = lb.quota_update_interval_minutes * 60;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(quota_interval.max(1)));
            loop {
                ticker.tick().await;
                if let Err(error) = manager.write_resource_quotas().await {
                    warn!("failed to write resource quotas: {}", error);
                }
            }
        }));

        handles
    }

    // ---- dynamic settings -------------------------------------------------

    async fn dynamic_setting_f64(&self, path: &str, setting_name: &str, default: f64) -> f64 {
        match self.store.get(path).await {
            Ok(Some(bytes)) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|value| value.get(setting_name).cloned())
                .and_then(|value| {
                    value
                        .as_f64()
                        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
                })
                .unwrap_or(default),
            Ok(None) => default,
            Err(error) => {
                warn!("failed to read setting {}: {}", path, error);
                default
            }
        }
    }

    async fn dynamic_setting_bool(&self, path: &str, setting_name: &str, default: bool) -> bool {
        match self.store.get(path).await {
            Ok(Some(bytes)) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|value| value.get(setting_name).cloned())
                .and_then(|value| {
                    value
                        .as_bool()
                        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
                })
                .unwrap_or(default),
            Ok(None) => default,
            Err(error) => {
                warn!("failed to read setting {}: {}", path, error);
                default
            }
        }
    }

    pub(crate) async fn placement_strategy(&self) -> LoadBalancerStrategy {
        match self.store.get(SETTING_STRATEGY_PATH).await {
            Ok(Some(bytes)) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|value| {
                    value
                        .get(SETTING_NAME_STRATEGY)
                        .and_then(|raw| raw.as_str())
                        .map(LoadBalancerStrategy::from_setting)
                })
                .unwrap_or(self.config.load_balancer.placement_strategy),
            _ => self.config.load_balancer.placement_strategy,
        }
    }

    // Centralized placement means the leader decides deterministically.
    pub async fn is_centralized(&self) -> bool {
        self.placement_strategy().await == LoadBalancerStrategy::LeastLoadedServer
    }

    pub(crate) async fn underload_threshold(&self) -> f64 {
        self.dynamic_setting_f64(
            SETTING_UNDERLOAD_THRESHOLD_PATH,
            SETTING_NAME_UNDERLOAD_THRESHOLD,
            self.config.load_balancer.underload_threshold_pct,
        )
        .await
    }

    pub(crate) async fn overload_threshold(&self) -> f64 {
        self.dynamic_setting_f64(
            SETTING_OVERLOAD_THRESHOLD_PATH,
            SETTING_NAME_OVERLOAD_THRESHOLD,
            self.config.load_balancer.overload_threshold_pct,
        )
        .await
    }

    pub(crate) async fn comfort_load_threshold(&self) -> f64 {
        self.dynamic_setting_f64(
            SETTING_COMFORT_LOAD_THRESHOLD_PATH,
            SETTING_NAME_COMFORT_LOAD_THRESHOLD,
            self.config.load_balancer.comfort_load_threshold_pct,
        )
        .await
    }

    async fn auto_bundle_split_enabled(&self) -> bool {
        self.dynamic_setting_bool(
            SETTING_AUTO_BUNDLE_SPLIT_PATH,
            SETTING_NAME_AUTO_BUNDLE_SPLIT,
            self.config.load_balancer.auto_bundle_split_enabled,
        )
        .await
    }

    // ---- rank updater -----------------------------------------------------

    // Reload every broker's report, run the quota estimator and rebuild the
    // rankings, then publish the sorted snapshot. The store reads happen
    // before the lock is taken; the rankings mutate under it.
    pub async fn update_ranking(&self) {
        let strategy = self.placement_strategy().await;

        let prefix = format!("{}/", LOADBALANCE_BROKERS_ROOT);
        let entries = match self.store.get_bulk(&prefix).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("error reading load reports while re-ranking: {}", error);
                return;
            }
        };

        let mut reports = HashMap::new();
        for entry in entries {
            match serde_json::from_slice::<LoadReport>(&entry.value) {
                Ok(report) => {
                    let unit = ResourceUnit::new(format!("http://{}", report.broker_name));
                    reports.insert(unit, report);
                }
                Err(error) => {
                    warn!("failed to deserialize load report at {}: {}", entry.key, error);
                }
            }
        }

        let own_broker_name = self.config.broker_name();
        let mut own_metrics = None;
        let mut new_sorted = SortedRankings::new();
        {
            let mut loads = self.loads.lock().await;
            loads.current_load_reports = reports;

            let LoadState {
                current_load_reports,
                resource_unit_rankings,
                estimator,
                ..
            } = &mut *loads;

            estimator.update(current_load_reports.values());

            if current_load_reports.is_empty() {
                info!("no brokers to rank this run, keeping the previous ranking");
                return;
            }

            info!("re-ranking {} brokers under strategy {}", current_load_reports.len(), strategy.as_str());
            let default_quota = estimator.default_quota();
            let cpu_factor = estimator.cpu_load_factor();

            let mut new_rankings = HashMap::new();
            for (unit, report) in current_load_reports.iter() {
                let loaded_bundles = report.bundles();
                let mut pre_allocated = resource_unit_rankings
                    .get(unit)
                    .map(|ranking| ranking.pre_allocated_bundles().clone())
                    .unwrap_or_default();
                pre_allocated.retain(|bundle| !loaded_bundles.contains(bundle));

                let allocated_quota = estimator.total_allocated_quota(&loaded_bundles);
                let pre_allocated_quota = estimator.total_allocated_quota(&pre_allocated);
                let ranking = ResourceUnitRanking::new(
                    report.system_usage,
                    loaded_bundles,
                    allocated_quota,
                    pre_allocated,
                    pre_allocated_quota,
                    cpu_factor,
                    &default_quota,
                );

                let load_percentage = ranking.estimated_load_percentage();
                let final_rank = match strategy {
                    LoadBalancerStrategy::LeastLoadedServer => load_percentage as i64,
                    LoadBalancerStrategy::WeightedRandomSelection => {
                        let idle_ratio = ((100.0 - load_percentage) / 100.0).max(0.0);
                        (ranking.estimated_max_capacity() as f64 * idle_ratio * idle_ratio) as i64
                    }
                };
                new_sorted.entry(final_rank).or_default().insert(unit.clone());
                debug!("ranked broker {} at {}", unit, final_rank);

                if unit.broker_name() == own_broker_name {
                    own_metrics = Some(update_load_balancing_metrics(
                        &own_broker_name,
                        final_rank,
                        &ranking,
                    ));
                }
                new_rankings.insert(unit.clone(), ranking);
            }
            *resource_unit_rankings = new_rankings;
            *self.sorted_rankings.lock().await = Arc::new(new_sorted);
        }

        if let Some(metrics) = own_metrics {
            *self.load_balancing_metrics.lock().await = vec![metrics];
        }
    }

    pub async fn load_balancing_metrics(&self) -> Vec<LoadBalancingMetrics> {
        self.load_balancing_metrics.lock().await.clone()
    }

    // ---- placement --------------------------------------------------------

    // Decide the owner for a service unit. None means no broker is
    // currently available; the caller retries.
    pub async fn get_least_loaded(
        &self,
        service_unit: &ServiceUnitId,
    ) -> Result<Option<ResourceUnit>> {
        let strategy = self.placement_strategy().await;
        let underload = self.underload_threshold().await;
        let overload = self.overload_threshold().await;

        let snapshot = { self.sorted_rankings.lock().await.clone() };
        let fallback;
        let available: &SortedRankings = if snapshot.is_empty() {
            fallback = self.available_brokers_fallback().await?;
            &fallback
        } else {
            &snapshot
        };

        let mut candidates =
            get_final_candidates(&service_unit.namespace(), available, &self.policies);

        // drop candidates whose broker has meanwhile disappeared
        match self.active_broker_names().await {
            Ok(active) => {
                candidates.retain(|(_, unit)| active.contains(unit.broker_name()));
            }
            Err(error) => {
                warn!("could not prune inactive brokers: {}", error);
            }
        }

        if candidates.is_empty() {
            warn!("no broker available to acquire service unit {}", service_unit);
            return Ok(None);
        }

        let mut loads = self.loads.lock().await;
        let LoadState {
            resource_unit_rankings,
            estimator,
            broker_rotation_cursor,
            ..
        } = &mut *loads;

        // sticky across both strategies: a bundle already pre-allocated to a
        // candidate goes back to it
        for (_, candidate) in &candidates {
            if resource_unit_rankings
                .get(candidate)
                .map(|ranking| ranking.is_service_unit_pre_allocated(service_unit.as_str()))
                .unwrap_or(false)
            {
                return Ok(Some(candidate.clone()));
            }
        }

        let selected = match strategy {
            LoadBalancerStrategy::LeastLoadedServer => find_broker_for_placement(
                resource_unit_rankings,
                estimator,
                *broker_rotation_cursor,
                &candidates,
                service_unit.as_str(),
                underload,
                overload,
            ),
            LoadBalancerStrategy::WeightedRandomSelection => {
                weighted_random_selection(&candidates)
            }
        };

        if let Some(unit) = &selected {
            record_assignment(
                resource_unit_rankings,
                estimator,
                broker_rotation_cursor,
                unit,
                service_unit.as_str(),
            );
            let desc = resource_unit_rankings
                .get(unit)
                .map(|ranking| ranking.load_percentage_desc())
                .unwrap_or_default();
            info!("assigned {} to {} ({})", service_unit, unit, desc);
        }
        Ok(selected)
    }

    // The ranked candidates a service unit could be placed on right now.
    pub async fn get_resource_availability_for(
        &self,
        service_unit: &ServiceUnitId,
    ) -> Vec<(i64, ResourceUnit)> {
        let snapshot = { self.sorted_rankings.lock().await.clone() };
        get_final_candidates(&service_unit.namespace(), &snapshot, &self.policies)
    }

    // With no rankings yet, pick among the registered brokers at rank zero,
    // shuffled for fairness.
    async fn available_brokers_fallback(&self) -> Result<SortedRankings> {
        let mut names: Vec<String> = self
            .active_broker_names()
            .await?
            .into_iter()
            .collect();
        names.shuffle(&mut rand::thread_rng());
        info!("no rankings yet, choosing at random from brokers: {:?}", names);

        let mut rankings = SortedRankings::new();
        for name in names {
            rankings
                .entry(0)
                .or_default()
                .insert(ResourceUnit::new(format!("http://{}", name)));
        }
        Ok(rankings)
    }

    async fn active_broker_names(&self) -> Result<HashSet<String>> {
        let children = self.store.get_childrens(LOADBALANCE_BROKERS_ROOT).await?;
        Ok(children
            .iter()
            .filter_map(|key| key.rsplit('/').next())
            .map(str::to_owned)
            .collect())
    }

    // ---- load report writer ----------------------------------------------

    pub fn set_load_report_force_update_flag(&self) {
        self.force_load_report_update.store(true, Ordering::SeqCst);
    }

    // De-register this broker: its report node disappears and the next
    // ranking pass drops it.
    pub async fn disable_broker(&self) -> Result<()> {
        self.store.delete(&self.broker_report_path).await?;
        Ok(())
    }

    fn generate_report(
        &self,
        state: &mut ReportState,
        overload_threshold: f64,
        underload_threshold: f64,
    ) -> Result<LoadReport> {
        let now = now_millis();
        if let Some(last) = &state.last_load_report {
            if now - last.timestamp <= LOAD_REPORT_UPDATE_MINIMUM_INTERVAL_MS {
                return Ok(last.clone());
            }
        }

        let mut system_usage = self.host_usage.host_usage()?;

        // smooth the process memory figure over roughly two minutes of
        // report intervals
        let weight = (120_000 / LOAD_REPORT_UPDATE_MINIMUM_INTERVAL_MS).max(1) as f64;
        if state.avg_memory_usage_mb <= 0.0 {
            state.avg_memory_usage_mb = system_usage.memory.usage;
        } else {
            state.avg_memory_usage_mb =
                ((weight - 1.0) * state.avg_memory_usage_mb + system_usage.memory.usage) / weight;
        }
        system_usage.memory.usage = state.avg_memory_usage_mb;

        let mut report = LoadReport::new(
            self.config.broker_name(),
            self.config.web_service_url.clone(),
            self.config.web_service_url_tls.clone(),
            self.config.broker_service_url.clone(),
            self.config.broker_service_url_tls.clone(),
        );
        report.timestamp = now;
        report.overloaded = system_usage.is_above_load_level(overload_threshold);
        report.underloaded = system_usage.is_below_load_level(underload_threshold);
        report.system_usage = system_usage;
        report.bundle_stats = self.bundle_stats_source.bundle_stats();
        Ok(report)
    }

    // Write the report back when something noteworthy happened: first write,
    // forced update, max interval elapsed, the bundle count moved by more
    // than the report threshold relative to broker capacity, or any resource
    // moved by more than the threshold relative to its limit.
    pub async fn write_load_report_if_needed(&self) -> Result<()> {
        let overload = self.overload_threshold().await;
        let underload = self.underload_threshold().await;
        let (default_quota, cpu_factor) = {
            let loads = self.loads.lock().await;
            (
                loads.estimator.default_quota(),
                loads.estimator.cpu_load_factor(),
            )
        };
        let lb = &self.config.load_balancer;

        let report_to_write = {
            let mut state = self.report.lock().await;
            let now = now_millis();
            let force = self.force_load_report_update.swap(false, Ordering::SeqCst);

            let mut need_update = false;
            if force || state.last_load_report.is_none() {
                need_update = true;
            } else if let Some(last) = &state.last_load_report {
                let elapsed = now - last.timestamp;
                if elapsed > lb.report_update_max_interval_minutes as i64 * 60_000 {
                    need_update = true;
                } else if elapsed > LOAD_REPORT_UPDATE_MINIMUM_INTERVAL_MS {
                    let old_bundle_count = last.num_bundles() as i64;
                    let new_bundle_count = self.bundle_stats_source.bundle_stats().len() as i64;
                    let count_change = (old_bundle_count - new_bundle_count).abs();
                    let max_capacity = calculate_broker_max_capacity(
                        &last.system_usage,
                        &default_quota,
                        cpu_factor,
                    );
                    let count_change_pct = if max_capacity > 0 {
                        (count_change * 100 / max_capacity) as f64
                    } else {
                        0.0
                    };
                    if new_bundle_count < old_bundle_count
                        || count_change_pct > lb.report_update_threshold_pct
                    {
                        need_update = true;
                    }

                    if !need_update
                        && now - state.last_resource_usage_timestamp
                            > lb.host_usage_check_interval_minutes as i64 * 60_000
                    {
                        if let Ok(new_usage) = self.host_usage.host_usage() {
                            let last_system_usage = last.system_usage;
                            state.last_resource_usage_timestamp = now;
                            let resource_change =
                                max_resource_change_pct(&last_system_usage, &new_usage);
                            if resource_change > lb.report_update_threshold_pct {
                                need_update = true;
                                info!(
                                    "load report update triggered by resource change ({:.1}%)",
                                    resource_change
                                );
                            }
                        }
                    }
                }
            }

            if need_update {
                Some(self.generate_report(&mut state, overload, underload)?)
            } else {
                None
            }
        };

        if let Some(report) = report_to_write {
            let payload = serde_json::to_vec(&report)?;
            self.store
                .update_ephemeral(&self.broker_report_path, payload)
                .await?;
            let mut state = self.report.lock().await;
            state.last_resource_usage_timestamp = report.timestamp;
            state.last_load_report = Some(report);
        }
        Ok(())
    }

    // ---- load shedding ----------------------------------------------------

    // Leader only. Pick one bundle per overloaded broker and ask its owner
    // to release it, unless the kill switch is set or the bundle was shed
    // recently.
    pub async fn do_load_shedding(&self) {
        if !self.leader.is_leading() {
            return;
        }

        let overload = self.overload_threshold().await;
        let comfort = self.comfort_load_threshold().await;
        info!(
            "running load shedding as leader, overload threshold {}, comfort level {}",
            overload, comfort
        );

        let unload_disabled = !self.config.load_balancer.enabled
            || match self.store.exists(LOAD_SHEDDING_UNLOAD_DISABLED_PATH).await {
                Ok(found) => found,
                Err(error) => {
                    warn!(
                        "unable to check {}: {}",
                        LOAD_SHEDDING_UNLOAD_DISABLED_PATH, error
                    );
                    false
                }
            };

        let bundles_to_unload = {
            let loads = self.loads.lock().await;
            let sorted = self.sorted_rankings.lock().await.clone();
            select_bundles_to_unload(
                &loads.current_load_reports,
                &sorted,
                &self.policies,
                overload,
                comfort,
            )
        };

        let now = now_millis();
        for (unit, bundle) in bundles_to_unload {
            if !self.shedding.lock().await.is_allowed(&bundle, now) {
                info!("not unloading {} again within the grace period", bundle);
                continue;
            }
            let (Some(namespace), Some(range)) =
                (namespace_of_bundle(&bundle), range_of_bundle(&bundle))
            else {
                continue;
            };

            if unload_disabled {
                info!(
                    "DRY RUN: unload disabled; bundle {} would have been unloaded from {}",
                    bundle,
                    unit.resource_id()
                );
                self.shedding.lock().await.mark(&bundle, now);
                continue;
            }

            let admin = match self.admin_clients.get(unit.resource_id()) {
                Ok(admin) => admin,
                Err(error) => {
                    warn!("no admin client for {}: {}", unit.resource_id(), error);
                    continue;
                }
            };
            match admin.unload_namespace_bundle(namespace, range).await {
                Ok(()) => {
                    info!("unloaded bundle {} from {}", bundle, unit.resource_id());
                    self.shedding.lock().await.mark(&bundle, now);
                }
                // not recorded: the next cycle retries this bundle
                Err(error) => warn!(
                    "failed to unload bundle {} from {}: {}",
                    bundle,
                    unit.resource_id(),
                    error
                ),
            }
        }
    }

    // ---- bundle splitting -------------------------------------------------

    // Leader only. Detect hot bundles in the latest local report and request
    // splits, then force a report update so the new bundles show up.
    pub async fn do_namespace_bundle_split(&self) {
        if !self.leader.is_leading() {
            return;
        }

        let lb = &self.config.load_balancer;
        let limits = BundleSplitLimits {
            max_topics: lb.namespace_bundle_max_topics,
            max_sessions: lb.namespace_bundle_max_sessions,
            max_msg_rate: lb.namespace_bundle_max_msg_rate,
            max_bandwidth_bytes: lb.namespace_bundle_max_bandwidth_mbytes * MBYTES,
            max_namespace_bundles: lb.namespace_maximum_bundles,
        };
        let auto_split = self.auto_bundle_split_enabled().await;

        let Some(last_report) = self.report.lock().await.last_load_report.clone() else {
            return;
        };

        let namespace_bundle_counts = {
            let loads = self.loads.lock().await;
            let mut bundles: HashSet<String> = HashSet::new();
            for report in loads.current_load_reports.values() {
                bundles.extend(report.bundle_stats.keys().cloned());
            }
            // the local view also counts, reports may lag behind
            bundles.extend(last_report.bundle_stats.keys().cloned());

            let mut counts: HashMap<String, usize> = HashMap::new();
            for bundle in &bundles {
                if let Some(namespace) = namespace_of_bundle(bundle) {
                    *counts.entry(namespace.to_owned()).or_default() += 1;
                }
            }
            counts
        };

        let bundles_to_split =
            find_bundles_to_split(&last_report, &limits, &namespace_bundle_counts);
        if bundles_to_split.is_empty() {
            return;
        }

        if !auto_split {
            for bundle in &bundles_to_split {
                info!("DRY RUN - would split hot bundle {}", bundle);
            }
            return;
        }

        let admin = match self.admin_clients.get(&self.config.web_service_url) {
            Ok(admin) => admin,
            Err(error) => {
                warn!("no admin client for bundle split: {}", error);
                return;
            }
        };
        for bundle in &bundles_to_split {
            let (Some(namespace), Some(range)) =
                (namespace_of_bundle(bundle), range_of_bundle(bundle))
            else {
                continue;
            };
            match admin.split_namespace_bundle(namespace, range).await {
                Ok(()) => info!("successfully split bundle {}", bundle),
                Err(error) => warn!("failed to split bundle {}: {}", bundle, error),
            }
        }
        self.set_load_report_force_update_flag();
    }

    // ---- quota write-back -------------------------------------------------

    async fn read_stored_quota(&self, path: &str) -> Option<ResourceQuota> {
        match self.store.get(path).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(error) => {
                warn!("failed to read quota at {}: {}", path, error);
                None
            }
        }
    }

    fn quota_needs_update(&self, old_quota: &ResourceQuota, new_quota: &ResourceQuota) -> bool {
        if !old_quota.dynamic {
            return false;
        }
        // the historical comparison diffed bandwidthIn against bandwidthOut
        let bandwidth_in_reference = if self.config.load_balancer.legacy_bandwidth_in_compare {
            old_quota.bandwidth_out
        } else {
            old_quota.bandwidth_in
        };
        (new_quota.msg_rate_in - old_quota.msg_rate_in).abs() >= RESOURCE_QUOTA_MIN_MSG_RATE_IN
            || (new_quota.msg_rate_out - old_quota.msg_rate_out).abs()
                >= RESOURCE_QUOTA_MIN_MSG_RATE_OUT
            || (new_quota.bandwidth_in - bandwidth_in_reference).abs()
                >= RESOURCE_QUOTA_MIN_BANDWIDTH_IN
            || (new_quota.bandwidth_out - old_quota.bandwidth_out).abs()
                >= RESOURCE_QUOTA_MIN_BANDWIDTH_OUT
            || (new_quota.memory - old_quota.memory).abs() >= RESOURCE_QUOTA_MIN_MEMORY
    }

    // Leader only. Publish the smoothed factors always, quotas only when a
    // field moved by at least its minimum threshold, to keep store traffic
    // down.
    pub async fn write_resource_quotas(&self) -> Result<()> {
        if !self.leader.is_leading() {
            return Ok(());
        }
        info!("writing resource quotas to the metadata store as leader");

        let (cpu_factor, mem_factor, avg_quota, bundle_quotas) = {
            let loads = self.loads.lock().await;
            (
                loads.estimator.cpu_load_factor(),
                loads.estimator.memory_load_factor(),
                loads.estimator.default_quota(),
                loads.estimator.bundle_quotas().clone(),
            )
        };

        self.store
            .put(
                SETTING_LOAD_FACTOR_CPU_PATH,
                serde_json::to_vec(&serde_json::json!({ SETTING_NAME_LOAD_FACTOR_CPU: cpu_factor }))?,
            )
            .await?;
        self.store
            .put(
                SETTING_LOAD_FACTOR_MEM_PATH,
                serde_json::to_vec(&serde_json::json!({ SETTING_NAME_LOAD_FACTOR_MEM: mem_factor }))?,
            )
            .await?;

        let stored_default = self
            .read_stored_quota(RESOURCE_QUOTA_DEFAULT_PATH)
            .await
            .unwrap_or_default();
        if self.quota_needs_update(&stored_default, &avg_quota) {
            debug!(
                "updating default quota - msgRateIn: {:.1}, msgRateOut: {:.1}, memory: {:.1}",
                avg_quota.msg_rate_in, avg_quota.msg_rate_out, avg_quota.memory
            );
            self.store
                .put(RESOURCE_QUOTA_DEFAULT_PATH, serde_json::to_vec(&avg_quota)?)
                .await?;
        }

        for (bundle, quota) in bundle_quotas {
            let path = join_path(&[RESOURCE_QUOTA_BUNDLE_ROOT, &bundle]);
            let old_quota = self
                .read_stored_quota(&path)
                .await
                .unwrap_or(stored_default);
            if self.quota_needs_update(&old_quota, &quota) {
                debug!("updating quota for bundle {}", bundle);
                self.store.put(&path, serde_json::to_vec(&quota)?).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadManager")
            .field("broker", &self.config.broker_name())
            .field("leader", &self.leader.is_leading())
            .finish()
    }
}

fn max_resource_change_pct(
    old_usage: &SystemResourceUsage,
    new_usage: &SystemResourceUsage,
) -> f64 {
    let mut max_change = 0.0f64;
    for &kind in &RESOURCE_TYPES {
        let old = old_usage.resource(kind);
        let new = new_usage.resource(kind);
        if new.limit > 0.0 {
            let change = ((new.usage - old.usage) * 100.0 / new.limit).abs();
            max_change = max_change.max(change);
        }
    }
    max_change.min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_client::BrokerAdmin;
    use crate::host_usage::FixedHostUsage;
    use crate::load_report::{NamespaceBundleStats, ResourceUsage};
    use async_trait::async_trait;
    use vltava_metadata_store::MemoryStore;

    #[derive(Default)]
    struct RecordingAdmin {
        unloads: std::sync::Mutex<Vec<(String, String)>>,
        splits: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl BrokerAdmin for RecordingAdmin {
        async fn unload_namespace_bundle(&self, namespace: &str, range: &str) -> Result<()> {
            self.unloads
                .lock()
                .unwrap()
                .push((namespace.to_owned(), range.to_owned()));
            Ok(())
        }
        async fn split_namespace_bundle(&self, namespace: &str, range: &str) -> Result<()> {
            self.splits
                .lock()
                .unwrap()
                .push((namespace.to_owned(), range.to_owned()));
            Ok(())
        }
    }

    fn usage_at(cpu_pct: f64) -> SystemResourceUsage {
        SystemResourceUsage {
            cpu: ResourceUsage::new(cpu_pct, 100.0),
            memory: ResourceUsage::new(512.0, 8192.0),
            direct_memory: ResourceUsage::new(0.0, 0.0),
            bandwidth_in: ResourceUsage::new(10.0, 1000.0),
            bandwidth_out: ResourceUsage::new(10.0, 1000.0),
        }
    }

    fn manager_for(
        store: MemoryStore,
        host: &str,
        cpu_pct: f64,
        admin: Arc<RecordingAdmin>,
    ) -> Arc<LoadManager> {
        let config = ServiceConfiguration::new(host, 8080);
        let leader = LeaderStatus::new();
        let stats: HashMap<String, NamespaceBundleStats> = HashMap::new();
        Arc::new(LoadManager::new(
            config,
            StorageBackend::Memory(store),
            Arc::new(FixedHostUsage(usage_at(cpu_pct))),
            Arc::new(stats),
            Arc::new(move |_url| Ok(admin.clone() as Arc<dyn BrokerAdmin>)),
            SimpleAllocationPolicies::new(),
            leader,
        ))
    }

    fn report_at(broker_name: &str, cpu_pct: f64, bundles: &[&str]) -> LoadReport {
        let mut report = LoadReport::new(
            broker_name,
            format!("http://{}", broker_name),
            None,
            format!("vltava://{}", broker_name),
            None,
        );
        report.timestamp = now_millis();
        report.system_usage = usage_at(cpu_pct);
        for bundle in bundles {
            report.bundle_stats.insert(
                bundle.to_string(),
                NamespaceBundleStats {
                    topics: 2,
                    ..Default::default()
                },
            );
        }
        report
    }

    async fn put_report(store: &MemoryStore, report: &LoadReport) {
        let path = format!("/loadbalance/brokers/{}", report.broker_name);
        store
            .put(&path, serde_json::to_vec(report).unwrap())
            .await
            .unwrap();
    }

    async fn set_strategy(store: &MemoryStore, strategy: &str) {
        store
            .put(
                SETTING_STRATEGY_PATH,
                serde_json::to_vec(&serde_json::json!({ "loadBalancerStrategy": strategy }))
                    .unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_registers_broker_and_ranks() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());

        manager.bootstrap().await.unwrap();

        let node = store
            .get("/loadbalance/brokers/broker-a:8080")
            .await
            .unwrap();
        assert!(node.is_some());
        let report: LoadReport = serde_json::from_slice(&node.unwrap()).unwrap();
        assert_eq!(report.broker_name, "broker-a:8080");

        // first ranking pass already ran
        let snapshot = manager.sorted_rankings.lock().await.clone();
        assert_eq!(snapshot.values().map(|s| s.len()).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_broker_name_taken() {
        let store = MemoryStore::new();
        let first = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        first.bootstrap().await.unwrap();

        let imposter = manager_for(store.session(), "broker-a", 20.0, Arc::default());
        assert!(imposter.bootstrap().await.is_err());
    }

    #[tokio::test]
    async fn test_update_ranking_skips_undecodable_reports() {
        let store = MemoryStore::new();
        store
            .put("/loadbalance/brokers/bad:8080", b"not json".to_vec())
            .await
            .unwrap();
        put_report(&store, &report_at("good:8080", 30.0, &["p/c/ns/0x0_0x1"])).await;

        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        manager.update_ranking().await;

        let loads = manager.loads.lock().await;
        assert_eq!(loads.current_load_reports.len(), 1);
    }

    #[tokio::test]
    async fn test_least_loaded_strategy_prefers_cool_broker() {
        let store = MemoryStore::new();
        set_strategy(&store, "leastLoadedServer").await;
        put_report(&store, &report_at("broker-a:8080", 20.0, &["p/c/ns/0x0_0x1"])).await;
        put_report(&store, &report_at("broker-b:8080", 80.0, &["p/c/ns/0x1_0x2"])).await;

        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        manager.update_ranking().await;

        let unit = ServiceUnitId::new("p/c/ns/0xa_0xb").unwrap();
        let selected = manager.get_least_loaded(&unit).await.unwrap().unwrap();
        assert_eq!(selected.broker_name(), "broker-a:8080");

        // sticky on the second ask
        let again = manager.get_least_loaded(&unit).await.unwrap().unwrap();
        assert_eq!(again, selected);
    }

    #[tokio::test]
    async fn test_weighted_random_assignment_pre_allocates() {
        let store = MemoryStore::new();
        for name in ["broker-a:8080", "broker-b:8080", "broker-c:8080"] {
            put_report(&store, &report_at(name, 0.0, &[])).await;
        }

        let manager = manager_for(store.clone(), "broker-a", 0.0, Arc::default());
        manager.update_ranking().await;

        let unit = ServiceUnitId::new("p/c/ns/0xa_0xb").unwrap();
        let selected = manager.get_least_loaded(&unit).await.unwrap().unwrap();

        let loads = manager.loads.lock().await;
        let pre_allocated: Vec<&ResourceUnit> = loads
            .resource_unit_rankings
            .iter()
            .filter(|(_, ranking)| ranking.is_service_unit_pre_allocated(unit.as_str()))
            .map(|(unit, _)| unit)
            .collect();
        assert_eq!(pre_allocated, vec![&selected]);
    }

    #[tokio::test]
    async fn test_rank_order_follows_strategy() {
        let store = MemoryStore::new();
        put_report(&store, &report_at("cool:8080", 10.0, &["p/c/ns/0x0_0x1"])).await;
        put_report(&store, &report_at("hot:8080", 80.0, &["p/c/ns/0x1_0x2"])).await;

        let manager = manager_for(store.clone(), "cool", 10.0, Arc::default());

        // weighted random: rank is free capacity, the cool broker ranks higher
        manager.update_ranking().await;
        let rank_of = |snapshot: &SortedRankings, name: &str| {
            snapshot
                .iter()
                .find(|(_, units)| units.iter().any(|u| u.broker_name() == name))
                .map(|(rank, _)| *rank)
                .unwrap()
        };
        let snapshot = manager.sorted_rankings.lock().await.clone();
        assert!(rank_of(&snapshot, "cool:8080") > rank_of(&snapshot, "hot:8080"));

        // least loaded: rank is the load percentage itself
        set_strategy(&store, "leastLoadedServer").await;
        manager.update_ranking().await;
        let snapshot = manager.sorted_rankings.lock().await.clone();
        assert_eq!(rank_of(&snapshot, "cool:8080"), 10);
        assert_eq!(rank_of(&snapshot, "hot:8080"), 80);
    }

    #[tokio::test]
    async fn test_ranking_is_idempotent_for_same_reports() {
        let store = MemoryStore::new();
        put_report(&store, &report_at("broker-a:8080", 25.0, &["p/c/ns/0x0_0x1"])).await;
        put_report(&store, &report_at("broker-b:8080", 60.0, &["p/c/ns/0x1_0x2"])).await;

        let manager = manager_for(store.clone(), "broker-a", 25.0, Arc::default());
        manager.update_ranking().await;
        let first = manager.sorted_rankings.lock().await.clone();

        manager.update_ranking().await;
        let second = manager.sorted_rankings.lock().await.clone();
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn test_placement_falls_back_to_registered_brokers() {
        let store = MemoryStore::new();
        // broker nodes exist but carry no parseable report, so no rankings
        store
            .put("/loadbalance/brokers/broker-a:8080", b"garbage".to_vec())
            .await
            .unwrap();
        store
            .put("/loadbalance/brokers/broker-b:8080", b"garbage".to_vec())
            .await
            .unwrap();

        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        let unit = ServiceUnitId::new("p/c/ns/0xa_0xb").unwrap();
        let selected = manager.get_least_loaded(&unit).await.unwrap().unwrap();
        assert!(["broker-a:8080", "broker-b:8080"].contains(&selected.broker_name()));
    }

    #[tokio::test]
    async fn test_placement_returns_none_without_brokers() {
        let store = MemoryStore::new();
        let manager = manager_for(store, "broker-a", 20.0, Arc::default());
        let unit = ServiceUnitId::new("p/c/ns/0xa_0xb").unwrap();
        assert!(manager.get_least_loaded(&unit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forced_report_write_bumps_store_version() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        manager.bootstrap().await.unwrap();

        manager.set_load_report_force_update_flag();
        manager.write_load_report_if_needed().await.unwrap();

        let entries = store.get_bulk("/loadbalance/brokers/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].version >= 2, "forced write must hit the store");
    }

    #[tokio::test]
    async fn test_unchanged_report_is_not_rewritten() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        manager.bootstrap().await.unwrap();

        manager.write_load_report_if_needed().await.unwrap();

        let entries = store.get_bulk("/loadbalance/brokers/").await.unwrap();
        assert_eq!(entries[0].version, 1, "quiet broker must not rewrite");
    }

    #[tokio::test]
    async fn test_dynamic_threshold_overrides_config() {
        let store = MemoryStore::new();
        store
            .put(
                SETTING_OVERLOAD_THRESHOLD_PATH,
                serde_json::to_vec(&serde_json::json!({ "overloadThreshold": 72.0 })).unwrap(),
            )
            .await
            .unwrap();

        let manager = manager_for(store, "broker-a", 20.0, Arc::default());
        assert_eq!(manager.overload_threshold().await, 72.0);
        // untouched setting falls back to config
        assert_eq!(manager.underload_threshold().await, 50.0);
    }

    #[tokio::test]
    async fn test_is_centralized_follows_strategy_setting() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 20.0, Arc::default());
        assert!(!manager.is_centralized().await);

        set_strategy(&store, "leastLoadedServer").await;
        assert!(manager.is_centralized().await);

        // unknown strategy values degrade to weighted random
        set_strategy(&store, "definitelyNotAStrategy").await;
        assert!(!manager.is_centralized().await);
    }

    fn overloaded_report(broker_name: &str) -> LoadReport {
        let mut report = report_at(
            broker_name,
            20.0,
            &["p/c/ns/0x0_0x1", "p/c/ns/0x1_0x2", "p/c/ns/0x2_0x3"],
        );
        report.system_usage.bandwidth_in = ResourceUsage::new(900.0, 1000.0);
        report
            .bundle_stats
            .get_mut("p/c/ns/0x0_0x1")
            .unwrap()
            .msg_throughput_in = 800.0;
        report
    }

    #[tokio::test]
    async fn test_load_shedding_unloads_once_per_grace_period() {
        let store = MemoryStore::new();
        let admin = Arc::new(RecordingAdmin::default());
        put_report(&store, &overloaded_report("broker-b:8080")).await;
        put_report(&store, &report_at("broker-a:8080", 10.0, &["p/c/ns/0x3_0x4"])).await;

        let manager = manager_for(store.clone(), "broker-a", 10.0, admin.clone());
        manager.leader().set_leading(true);
        manager.update_ranking().await;

        manager.do_load_shedding().await;
        {
            let unloads = admin.unloads.lock().unwrap();
            assert_eq!(unloads.as_slice(), &[("p/c/ns".to_string(), "0x0_0x1".to_string())]);
        }

        // immediately again: the grace period blocks a second unload
        manager.do_load_shedding().await;
        assert_eq!(admin.unloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_shedding_respects_kill_switch() {
        let store = MemoryStore::new();
        let admin = Arc::new(RecordingAdmin::default());
        store
            .put(LOAD_SHEDDING_UNLOAD_DISABLED_PATH, b"on".to_vec())
            .await
            .unwrap();
        put_report(&store, &overloaded_report("broker-b:8080")).await;
        put_report(&store, &report_at("broker-a:8080", 10.0, &["p/c/ns/0x3_0x4"])).await;

        let manager = manager_for(store.clone(), "broker-a", 10.0, admin.clone());
        manager.leader().set_leading(true);
        manager.update_ranking().await;

        manager.do_load_shedding().await;
        assert!(admin.unloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_followers_never_shed() {
        let store = MemoryStore::new();
        let admin = Arc::new(RecordingAdmin::default());
        put_report(&store, &overloaded_report("broker-b:8080")).await;
        put_report(&store, &report_at("broker-a:8080", 10.0, &["p/c/ns/0x3_0x4"])).await;

        let manager = manager_for(store.clone(), "broker-a", 10.0, admin.clone());
        manager.update_ranking().await;

        manager.do_load_shedding().await;
        assert!(admin.unloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hot_bundle_split_and_forced_report() {
        let store = MemoryStore::new();
        let admin = Arc::new(RecordingAdmin::default());
        store
            .put(
                SETTING_AUTO_BUNDLE_SPLIT_PATH,
                serde_json::to_vec(&serde_json::json!({ "autoBundleSplitEnabled": true }))
                    .unwrap(),
            )
            .await
            .unwrap();

        let manager = manager_for(store.clone(), "broker-a", 10.0, admin.clone());
        manager.leader().set_leading(true);

        // a hot bundle in the local report: msg rate far past the limit
        let mut hot = report_at("broker-a:8080", 10.0, &[]);
        hot.bundle_stats.insert(
            "p/c/ns/0x0_0x8".to_string(),
            NamespaceBundleStats {
                topics: 2,
                msg_rate_in: 10_000.0,
                ..Default::default()
            },
        );
        {
            let mut state = manager.report.lock().await;
            state.last_load_report = Some(hot);
        }

        manager.do_namespace_bundle_split().await;
        {
            let splits = admin.splits.lock().unwrap();
            assert_eq!(splits.as_slice(), &[("p/c/ns".to_string(), "0x0_0x8".to_string())]);
        }
        assert!(manager.force_load_report_update.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_quota_writer_publishes_factors() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 10.0, Arc::default());
        manager.leader().set_leading(true);

        manager.write_resource_quotas().await.unwrap();

        let cpu = store.get(SETTING_LOAD_FACTOR_CPU_PATH).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&cpu).unwrap();
        assert_eq!(value["loadFactorCPU"].as_f64().unwrap(), 0.025);
    }

    #[tokio::test]
    async fn test_quota_write_skipped_below_min_change() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 10.0, Arc::default());
        manager.leader().set_leading(true);

        // stored default equals the estimator's default: no quota write
        store
            .put(
                RESOURCE_QUOTA_DEFAULT_PATH,
                serde_json::to_vec(&ResourceQuota::default()).unwrap(),
            )
            .await
            .unwrap();

        manager.write_resource_quotas().await.unwrap();

        let entries = store.get_bulk(RESOURCE_QUOTA_DEFAULT_PATH).await.unwrap();
        assert_eq!(entries[0].version, 1, "unchanged quota must not be rewritten");
    }

    #[tokio::test]
    async fn test_disable_broker_removes_report_node() {
        let store = MemoryStore::new();
        let manager = manager_for(store.clone(), "broker-a", 10.0, Arc::default());
        manager.bootstrap().await.unwrap();

        manager.disable_broker().await.unwrap();
        assert!(store
            .get("/loadbalance/brokers/broker-a:8080")
            .await
            .unwrap()
            .is_none());
    }
}
