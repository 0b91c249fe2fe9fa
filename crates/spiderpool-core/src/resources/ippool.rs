use super::Resource;
use crate::constants;
use crate::ip::{self, IpError};
use crate::types::IpVersion;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A named, immutable-CIDR container of assignable addresses for one IP family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderIPPool {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IPPoolSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IPPoolStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    /// CIDR that contains every assignable address of the pool
    #[serde(default)]
    pub subnet: String,
    /// Inclusive ranges (`a` or `a-b`) within the CIDR
    #[serde(default)]
    pub ips: Vec<String>,
    /// Ranges subtracted from `ips`
    #[serde(
        default,
        rename = "excludeIPs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub exclude_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// Member of the cluster default pool set
    #[serde(default)]
    pub default: bool,
    /// Disabled pools accept no new picks; existing allocations stay valid
    #[serde(default)]
    pub disable: bool,
    /// Match-labels selector restricting which pods may use the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<BTreeMap<String, String>>,
    /// Match-labels selector against the pod's namespace labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_affinity: Option<BTreeMap<String, String>>,
    /// Match-labels selector against the node running the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<BTreeMap<String, String>>,
    /// Restrict the pool to pods attached through this CNI network name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus_name: Option<String>,
}

/// A route installed alongside an address from this pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    pub gw: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolStatus {
    /// Address → holder record for every allocated address
    #[serde(
        default,
        rename = "allocatedIPs",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub allocated_ips: BTreeMap<IpAddr, PoolAllocation>,
    #[serde(rename = "totalIPCount", skip_serializing_if = "Option::is_none")]
    pub total_ip_count: Option<u64>,
    #[serde(rename = "allocatedIPCount", skip_serializing_if = "Option::is_none")]
    pub allocated_ip_count: Option<u64>,
}

/// The holder record for one allocated address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAllocation {
    #[serde(rename = "podUID")]
    pub pod_uid: String,
    pub pod: String,
    pub namespace: String,
    pub nic: String,
    pub owner_controller_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_controller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl Resource for SpiderIPPool {
    const API_VERSION: &'static str = constants::API_VERSION;
    const KIND: &'static str = "SpiderIPPool";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl SpiderIPPool {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The pool's declared IP family; a pool without one is malformed
    pub fn version(&self) -> Result<IpVersion, IpError> {
        self.spec
            .ip_version
            .ok_or_else(|| IpError::parse("IP version", "<missing spec.ipVersion>"))
    }

    /// `∪ips ∖ ∪excludeIPs`, sorted and duplicate-free
    pub fn total_ips(&self) -> Result<Vec<IpAddr>, IpError> {
        ip::assemble_total_ips(self.version()?, &self.spec.ips, &self.spec.exclude_ips)
    }

    pub fn allocated_ip_count(&self) -> u64 {
        self.status
            .as_ref()
            .map(|s| s.allocated_ips.len() as u64)
            .unwrap_or(0)
    }

    /// Fraction of the pool currently allocated, for candidate ordering
    pub fn usage_ratio(&self) -> f64 {
        let total = self
            .status
            .as_ref()
            .and_then(|s| s.total_ip_count)
            .unwrap_or(0);
        if total == 0 {
            return 1.0;
        }
        self.allocated_ip_count() as f64 / total as f64
    }

    /// The Subnet this pool was carved from, if it has a controller owner
    pub fn owner_subnet(&self) -> Option<&str> {
        self.metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true) && r.kind == "SpiderSubnet")
            .map(|r| r.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_ips(ips: &[&str], excludes: &[&str]) -> SpiderIPPool {
        let mut pool = SpiderIPPool::new("test-pool");
        pool.spec.ip_version = Some(IpVersion::V4);
        pool.spec.subnet = "10.0.0.0/24".to_string();
        pool.spec.ips = ips.iter().map(|s| s.to_string()).collect();
        pool.spec.exclude_ips = excludes.iter().map(|s| s.to_string()).collect();
        pool
    }

    #[test]
    fn test_total_ips() {
        let pool = pool_with_ips(&["10.0.0.1-10.0.0.5"], &["10.0.0.2", "10.0.0.3"]);
        let total = pool.total_ips().unwrap();
        assert_eq!(
            total,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.4".parse::<IpAddr>().unwrap(),
                "10.0.0.5".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_missing_version_is_error() {
        let mut pool = SpiderIPPool::new("no-version");
        pool.spec.ips = vec!["10.0.0.1".to_string()];
        assert!(pool.total_ips().is_err());
    }

    #[test]
    fn test_usage_ratio() {
        let mut pool = pool_with_ips(&["10.0.0.1-10.0.0.4"], &[]);
        assert_eq!(pool.usage_ratio(), 1.0); // no status yet: treated as full

        let mut status = IPPoolStatus {
            total_ip_count: Some(4),
            ..Default::default()
        };
        status.allocated_ips.insert(
            "10.0.0.1".parse().unwrap(),
            PoolAllocation {
                pod_uid: "u1".to_string(),
                pod: "a".to_string(),
                namespace: "ns".to_string(),
                nic: "eth0".to_string(),
                owner_controller_kind: "Pod".to_string(),
                ..Default::default()
            },
        );
        status.allocated_ip_count = Some(1);
        pool.status = Some(status);
        assert_eq!(pool.usage_ratio(), 0.25);
    }

    #[test]
    fn test_serde_camel_case() {
        let pool = pool_with_ips(&["10.0.0.1"], &[]);
        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json["spec"]["ipVersion"], 4);
        assert_eq!(json["spec"]["subnet"], "10.0.0.0/24");
        assert!(json["spec"].get("excludeIPs").is_none());
    }

    #[test]
    fn test_owner_subnet() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut pool = pool_with_ips(&["10.0.0.1"], &[]);
        assert_eq!(pool.owner_subnet(), None);

        pool.metadata.owner_references = Some(vec![OwnerReference {
            api_version: constants::API_VERSION.to_string(),
            kind: "SpiderSubnet".to_string(),
            name: "subnet-a".to_string(),
            uid: "u".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert_eq!(pool.owner_subnet(), Some("subnet-a"));
    }
}
