use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::service_unit::NamespaceName;

// Per-namespace isolation rule: the listed hosts are the preferred owners of
// the namespace's bundles; everything else is a shared broker. Placement
// falls back to shared brokers when fewer than min_primary_brokers primaries
// are available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceIsolationPolicy {
    pub primary_brokers: Vec<String>,
    pub min_primary_brokers: usize,
}

impl NamespaceIsolationPolicy {
    fn covers(&self, broker_host: &str) -> bool {
        self.primary_brokers
            .iter()
            .any(|primary| primary == broker_host)
    }
}

// The isolation policies of the cluster, keyed by namespace name. A host
// that is primary for any namespace is no longer a shared broker.
#[derive(Debug, Clone, Default)]
pub struct SimpleAllocationPolicies {
    policies: HashMap<NamespaceName, NamespaceIsolationPolicy>,
}

impl SimpleAllocationPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: HashMap<NamespaceName, NamespaceIsolationPolicy>) -> Self {
        SimpleAllocationPolicies { policies }
    }

    pub fn set_policy(&mut self, namespace: NamespaceName, policy: NamespaceIsolationPolicy) {
        self.policies.insert(namespace, policy);
    }

    pub fn is_isolation_policies_present(&self, namespace: &NamespaceName) -> bool {
        self.policies.contains_key(namespace)
    }

    pub fn is_primary_broker(&self, namespace: &NamespaceName, broker_host: &str) -> bool {
        self.policies
            .get(namespace)
            .map(|policy| policy.covers(broker_host))
            .unwrap_or(false)
    }

    // A broker is shared when no namespace claims it as primary.
    pub fn is_shared_broker(&self, broker_host: &str) -> bool {
        !self
            .policies
            .values()
            .any(|policy| policy.covers(broker_host))
    }

    pub fn should_failover_to_secondaries(
        &self,
        namespace: &NamespaceName,
        primary_count: usize,
    ) -> bool {
        self.policies
            .get(namespace)
            .map(|policy| primary_count < policy.min_primary_brokers)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policies() -> SimpleAllocationPolicies {
        let mut policies = SimpleAllocationPolicies::new();
        policies.set_policy(
            NamespaceName::new("p/c/isolated"),
            NamespaceIsolationPolicy {
                primary_brokers: vec!["broker-1".to_string(), "broker-2".to_string()],
                min_primary_brokers: 2,
            },
        );
        policies
    }

    #[test]
    fn test_primary_and_shared_split() {
        let policies = policies();
        let namespace = NamespaceName::new("p/c/isolated");

        assert!(policies.is_isolation_policies_present(&namespace));
        assert!(policies.is_primary_broker(&namespace, "broker-1"));
        assert!(!policies.is_primary_broker(&namespace, "broker-3"));
        // primaries are not shared, even for other namespaces
        assert!(!policies.is_shared_broker("broker-1"));
        assert!(policies.is_shared_broker("broker-3"));
    }

    #[test]
    fn test_failover_threshold() {
        let policies = policies();
        let namespace = NamespaceName::new("p/c/isolated");

        assert!(policies.should_failover_to_secondaries(&namespace, 1));
        assert!(!policies.should_failover_to_secondaries(&namespace, 2));
        // no policy, no failover semantics
        assert!(!policies.should_failover_to_secondaries(&NamespaceName::new("p/c/other"), 0));
    }
}
