//! Cluster load-balancing controller for a Vltava broker fleet.
//!
//! Every broker embeds a [`LoadManager`]; the externally elected leader
//! ranks brokers from their load reports, places service units, sheds load
//! from overloaded brokers, splits hot bundles and publishes smoothed
//! resource quotas. Bundle ownership itself is taken through the
//! [`OwnershipCache`], which uses the metadata store's atomic
//! ephemeral-create as the cluster-wide mutex.

mod admin_client;
mod balancer_metrics;
mod host_usage;
mod isolation;
mod load_manager;
mod load_report;
mod ownership_cache;
mod placement;
mod quota_estimator;
mod ranking;
mod resource_quota;
mod resources;
mod service_configuration;
mod service_unit;
mod shedder;
mod splitter;

pub use admin_client::{AdminClientCache, BrokerAdmin, BrokerAdminFactory};
pub use balancer_metrics::{init_metrics, LoadBalancingMetrics};
pub use host_usage::{FixedHostUsage, HostUsage, SysinfoHostUsage};
pub use isolation::{NamespaceIsolationPolicy, SimpleAllocationPolicies};
pub use load_manager::{LeaderStatus, LoadManager};
pub use load_report::{
    BundleStatsSource, LoadReport, NamespaceBundleStats, ResourceType, ResourceUsage,
    SystemResourceUsage,
};
pub use ownership_cache::{NamespaceEphemeralData, OwnedBundle, OwnershipCache};
pub use placement::{LoadBalancerStrategy, SortedRankings};
pub use quota_estimator::QuotaEstimator;
pub use ranking::{ResourceUnit, ResourceUnitRanking};
pub use resource_quota::ResourceQuota;
pub use service_configuration::{LoadBalancerConfig, ServiceConfiguration};
pub use service_unit::{NamespaceName, ServiceUnitId};
