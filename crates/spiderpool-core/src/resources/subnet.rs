use super::ippool::Route;
use super::Resource;
use crate::constants;
use crate::ip::{self, IpError};
use crate::types::IpVersion;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A CIDR parent resource from which IPPools are carved
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderSubnet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SubnetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubnetStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub subnet: String,
    /// Master list of assignable ranges handed out to child pools
    #[serde(default)]
    pub ips: Vec<String>,
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
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Child pool name → the ranges claimed by that pool
    #[serde(
        default,
        rename = "controlledIPPools",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub controlled_ip_pools: BTreeMap<String, ControlledPool>,
    #[serde(rename = "totalIPCount", skip_serializing_if = "Option::is_none")]
    pub total_ip_count: Option<u64>,
    #[serde(rename = "allocatedIPCount", skip_serializing_if = "Option::is_none")]
    pub allocated_ip_count: Option<u64>,
}

/// The slice of a subnet claimed by one child pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlledPool {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub ip_count: u64,
}

impl Resource for SpiderSubnet {
    const API_VERSION: &'static str = constants::API_VERSION;
    const KIND: &'static str = "SpiderSubnet";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl SpiderSubnet {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn version(&self) -> Result<IpVersion, IpError> {
        self.spec
            .ip_version
            .ok_or_else(|| IpError::parse("IP version", "<missing spec.ipVersion>"))
    }

    /// `∪ips ∖ ∪excludeIPs`, sorted and duplicate-free
    pub fn total_ips(&self) -> Result<Vec<IpAddr>, IpError> {
        ip::assemble_total_ips(self.version()?, &self.spec.ips, &self.spec.exclude_ips)
    }

    /// Addresses claimed by any child pool, sorted and duplicate-free
    pub fn controlled_ips(&self) -> Result<Vec<IpAddr>, IpError> {
        let version = self.version()?;
        let mut claimed = Vec::new();
        if let Some(status) = &self.status {
            for pool in status.controlled_ip_pools.values() {
                let ips = ip::convert_ip_ranges_to_ips(version, &pool.ips)?;
                claimed = ip::ips_union_set(&claimed, &ips);
            }
        }
        Ok(claimed)
    }

    /// Addresses not yet claimed by any child pool
    pub fn free_ips(&self) -> Result<Vec<IpAddr>, IpError> {
        let total = self.total_ips()?;
        let claimed = self.controlled_ips()?;
        Ok(ip::ips_diff_set(&total, &claimed, true))
    }
}
