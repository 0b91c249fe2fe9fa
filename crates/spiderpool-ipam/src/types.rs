use serde::{Deserialize, Serialize};
use spiderpool_core::config::ClusterDefaultPool;
use spiderpool_core::constants;
use spiderpool_core::types::{IpVersion, OwnerKind};
use spiderpool_core::Route;
use std::net::IpAddr;
use std::time::Duration;

/// Static configuration of the allocation engine
#[derive(Debug, Clone)]
pub struct IpamConfig {
    /// Name of the node this agent runs on
    pub node_name: String,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    /// Re-use the recorded assignment for StatefulSet replicas
    pub enable_stateful_set: bool,
    /// Provision per-application pools from Subnets on demand
    pub enable_spider_subnet: bool,
    pub cluster_default: ClusterDefaultPool,
    /// Budget for optimistic-write retries per pool update
    pub max_conflict_retries: u32,
    /// Unit of the exponential backoff between conflict retries
    pub conflict_retry_unit: Duration,
    /// Hard ceiling on allocated addresses per pool, enforced at pick
    pub max_allocated_ips: usize,
    /// Cap on SpiderEndpoint history records
    pub max_history_records: usize,
    /// Attempts to wait for an auto-pool to become available
    pub operation_retries: u32,
    /// Gap between auto-pool wait attempts
    pub operation_gap: Duration,
    /// Bound on queued auto-pool provisioning requests
    pub max_queue_size: usize,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            enable_ipv4: true,
            enable_ipv6: false,
            enable_stateful_set: true,
            enable_spider_subnet: false,
            cluster_default: ClusterDefaultPool::default(),
            max_conflict_retries: constants::DEFAULT_MAX_CONFLICT_RETRIES,
            conflict_retry_unit: Duration::from_millis(constants::DEFAULT_CONFLICT_RETRY_UNIT_MS),
            max_allocated_ips: constants::DEFAULT_MAX_ALLOCATED_IPS,
            max_history_records: constants::DEFAULT_MAX_HISTORY_RECORDS,
            operation_retries: 25,
            operation_gap: Duration::from_secs(2),
            max_queue_size: 1000,
        }
    }
}

/// Pool candidates for one interface of one request
#[derive(Debug, Clone)]
pub struct ToBeAllocated {
    pub nic: String,
    /// The pod annotation asked to suppress the default route on this NIC
    pub clean_gateway: bool,
    /// One entry per requested IP family
    pub pool_candidates: Vec<PoolCandidate>,
}

impl ToBeAllocated {
    /// All candidate pool names across families
    pub fn pools(&self) -> Vec<String> {
        self.pool_candidates
            .iter()
            .flat_map(|c| c.pools.iter().cloned())
            .collect()
    }
}

/// Candidate pool names for one IP family
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub version: IpVersion,
    pub pools: Vec<String>,
}

/// The outcome of one pick: an address plus the pool context it came with
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub nic: String,
    pub version: IpVersion,
    pub ip: IpAddr,
    /// Prefix length of the pool's CIDR
    pub prefix: u8,
    pub gateway: Option<String>,
    pub routes: Vec<Route>,
    pub vlan: Option<i64>,
    pub pool: String,
    /// Suppress installing a default route for this NIC
    pub clean_gateway: bool,
}

impl AllocationResult {
    /// Address in `ip/prefix` form
    pub fn address(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }
}

/// The pod-side identity written into pool and endpoint records
#[derive(Debug, Clone)]
pub struct PodContext {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node: Option<String>,
    pub owner_kind: OwnerKind,
    pub owner_name: Option<String>,
}

/// `Allocate` request from the network plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub if_name: String,
    #[serde(default)]
    pub netns: String,
    #[serde(
        default,
        rename = "defaultRouteNIC",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_route_nic: Option<String>,
}

/// `Allocate` response to the network plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

/// One assigned address in the wire response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    pub nic: String,
    pub version: IpVersion,
    /// `ip/prefix`
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
}

/// One route in the wire response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub nic: String,
    pub dst: String,
    pub gw: String,
}

/// `Release` request from the network plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub pod_namespace: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_name: Option<String>,
}
