// Layout of the load-balancer state in the metadata store.
//
// Brokers register an ephemeral node under /loadbalance/brokers carrying
// their current LoadReport. The leader publishes smoothed factors and quotas
// under /loadbalance/settings and /loadbalance/resource-quota. Service unit
// ownership is an ephemeral node per bundle under /namespace.

pub(crate) static LOADBALANCE_BROKERS_ROOT: &str = "/loadbalance/brokers";

pub(crate) static SETTING_STRATEGY_PATH: &str = "/loadbalance/settings/strategy";
pub(crate) static SETTING_LOAD_FACTOR_CPU_PATH: &str = "/loadbalance/settings/load_factor_cpu";
pub(crate) static SETTING_LOAD_FACTOR_MEM_PATH: &str = "/loadbalance/settings/load_factor_mem";
pub(crate) static SETTING_OVERLOAD_THRESHOLD_PATH: &str =
    "/loadbalance/settings/overload_threshold";
pub(crate) static SETTING_UNDERLOAD_THRESHOLD_PATH: &str =
    "/loadbalance/settings/underload_threshold";
pub(crate) static SETTING_COMFORT_LOAD_THRESHOLD_PATH: &str =
    "/loadbalance/settings/comfort_load_threshold";
pub(crate) static SETTING_AUTO_BUNDLE_SPLIT_PATH: &str =
    "/loadbalance/settings/auto_bundle_split_enabled";

pub(crate) static SETTING_NAME_STRATEGY: &str = "loadBalancerStrategy";
pub(crate) static SETTING_NAME_LOAD_FACTOR_CPU: &str = "loadFactorCPU";
pub(crate) static SETTING_NAME_LOAD_FACTOR_MEM: &str = "loadFactorMemory";
pub(crate) static SETTING_NAME_OVERLOAD_THRESHOLD: &str = "overloadThreshold";
pub(crate) static SETTING_NAME_UNDERLOAD_THRESHOLD: &str = "underloadThreshold";
pub(crate) static SETTING_NAME_COMFORT_LOAD_THRESHOLD: &str = "comfortLoadThreshold";
pub(crate) static SETTING_NAME_AUTO_BUNDLE_SPLIT: &str = "autoBundleSplitEnabled";

pub(crate) static RESOURCE_QUOTA_DEFAULT_PATH: &str = "/loadbalance/resource-quota/default";
pub(crate) static RESOURCE_QUOTA_BUNDLE_ROOT: &str = "/loadbalance/resource-quota/namespace";

// Service unit ownership nodes live at /namespace/<bundle-name>
pub(crate) static BASE_NAMESPACE_OWNER_PATH: &str = "/namespace";

// Presence of this node turns load-shedding unloads into dry runs
pub(crate) static LOAD_SHEDDING_UNLOAD_DISABLED_PATH: &str =
    "/admin/flags/load-shedding-unload-disabled";

pub(crate) fn join_path(parts: &[&str]) -> String {
    parts.join("/")
}
