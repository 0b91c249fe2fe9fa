//! Process-wide IPAM configuration values.
//!
//! The cluster default pool lists are loaded once at startup from the
//! mounted config file and passed by reference; nothing here is mutable
//! after initialization.

use serde::{Deserialize, Serialize};

/// Contents of the mounted YAML config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub ipam_unix_socket_path: String,
    #[serde(rename = "enableIPv4")]
    pub enable_ipv4: bool,
    #[serde(rename = "enableIPv6")]
    pub enable_ipv6: bool,
    pub enable_stateful_set: bool,
    pub enable_spider_subnet: bool,
    #[serde(rename = "clusterDefaultIPv4IPPool")]
    pub cluster_default_ipv4_ip_pool: Vec<String>,
    #[serde(rename = "clusterDefaultIPv6IPPool")]
    pub cluster_default_ipv6_ip_pool: Vec<String>,
    #[serde(rename = "clusterDefaultIPv4Subnet")]
    pub cluster_default_ipv4_subnet: Vec<String>,
    #[serde(rename = "clusterDefaultIPv6Subnet")]
    pub cluster_default_ipv6_subnet: Vec<String>,
    #[serde(rename = "clusterSubnetDefaultFlexibleIPNumber")]
    pub cluster_subnet_default_flexible_ip_number: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            ipam_unix_socket_path: crate::constants::DEFAULT_IPAM_UNIX_SOCKET_PATH.to_string(),
            enable_ipv4: true,
            enable_ipv6: false,
            enable_stateful_set: true,
            enable_spider_subnet: false,
            cluster_default_ipv4_ip_pool: Vec::new(),
            cluster_default_ipv6_ip_pool: Vec::new(),
            cluster_default_ipv4_subnet: Vec::new(),
            cluster_default_ipv6_subnet: Vec::new(),
            cluster_subnet_default_flexible_ip_number: 1,
        }
    }
}

impl FileConfig {
    /// Parse the mounted config file, filling defaults for absent keys
    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }
}

/// Cluster default pool and subnet lists, immutable after startup
#[derive(Debug, Clone, Default)]
pub struct ClusterDefaultPool {
    pub ipv4_pools: Vec<String>,
    pub ipv6_pools: Vec<String>,
    pub ipv4_subnets: Vec<String>,
    pub ipv6_subnets: Vec<String>,
    pub subnet_default_flexible_ip_number: u32,
}

impl ClusterDefaultPool {
    pub fn from_file_config(cfg: &FileConfig) -> Self {
        Self {
            ipv4_pools: cfg.cluster_default_ipv4_ip_pool.clone(),
            ipv6_pools: cfg.cluster_default_ipv6_ip_pool.clone(),
            ipv4_subnets: cfg.cluster_default_ipv4_subnet.clone(),
            ipv6_subnets: cfg.cluster_default_ipv6_subnet.clone(),
            subnet_default_flexible_ip_number: cfg.cluster_subnet_default_flexible_ip_number,
        }
    }
}
