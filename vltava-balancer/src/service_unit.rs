use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// A namespace name: property/cluster/namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceName(String);

impl NamespaceName {
    pub fn new(name: impl Into<String>) -> Self {
        NamespaceName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// The ownership unit handed out by the load balancer: a hash-range bundle of
// a namespace, named property/cluster/namespace/0xLLLLLLLL_0xHHHHHHHH.
// The range token itself is treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceUnitId(String);

impl ServiceUnitId {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.contains('/') {
            return Err(anyhow!("invalid service unit name: {}", name));
        }
        Ok(ServiceUnitId(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Everything before the last '/'.
    pub fn namespace(&self) -> NamespaceName {
        let pos = self.0.rfind('/').expect("validated at construction");
        NamespaceName(self.0[..pos].to_owned())
    }

    // The hash-range token after the last '/'.
    pub fn range(&self) -> &str {
        let pos = self.0.rfind('/').expect("validated at construction");
        &self.0[pos + 1..]
    }
}

impl fmt::Display for ServiceUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Split a raw bundle name from a load report into its namespace part,
// without requiring a full ServiceUnitId.
pub(crate) fn namespace_of_bundle(bundle_name: &str) -> Option<&str> {
    bundle_name.rfind('/').map(|pos| &bundle_name[..pos])
}

pub(crate) fn range_of_bundle(bundle_name: &str) -> Option<&str> {
    bundle_name.rfind('/').map(|pos| &bundle_name[pos + 1..])
}
