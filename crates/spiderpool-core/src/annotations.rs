//! Pod annotations that steer pool selection.
//!
//! All annotations are optional; parsing failures surface as
//! `InvalidArgument` at the allocation boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

pub const ANNO_POD_IPPOOL: &str = "ipam.spidernet.io/ippool";
pub const ANNO_POD_IPPOOLS: &str = "ipam.spidernet.io/ippools";
pub const ANNO_POD_SUBNET: &str = "ipam.spidernet.io/subnet";
pub const ANNO_POD_SUBNETS: &str = "ipam.spidernet.io/subnets";
pub const ANNO_POD_RECLAIM_IPPOOL: &str = "ipam.spidernet.io/reclaimippool";
pub const ANNO_POD_IPPOOL_IP_NUMBER: &str = "ipam.spidernet.io/ippool-ip-number";

/// Namespace annotations carrying per-namespace default pool lists
pub const ANNO_NS_DEFAULT_IPV4_POOL: &str = "ipam.spidernet.io/default-ipv4-ippool";
pub const ANNO_NS_DEFAULT_IPV6_POOL: &str = "ipam.spidernet.io/default-ipv6-ippool";

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("failed to parse annotation {key}: {reason}")]
    Parse { key: &'static str, reason: String },
}

impl AnnotationError {
    fn parse(key: &'static str, reason: impl ToString) -> Self {
        Self::Parse {
            key,
            reason: reason.to_string(),
        }
    }
}

/// `ipam.spidernet.io/ippool`: pool selection for a single NIC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodIppoolAnno {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub ipv4pools: Vec<String>,
    #[serde(default)]
    pub ipv6pools: Vec<String>,
}

/// One element of `ipam.spidernet.io/ippools`: pool selection per NIC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodIppoolsAnnoItem {
    pub interface: String,
    #[serde(default)]
    pub ipv4pools: Vec<String>,
    #[serde(default)]
    pub ipv6pools: Vec<String>,
    #[serde(default)]
    pub cleangateway: bool,
}

/// `ipam.spidernet.io/subnet`: request an auto-pool carved from a subnet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSubnetAnno {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
}

/// `ipam.spidernet.io/ippool-ip-number`: auto-pool size specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPoolIpNumber {
    /// The pool holds exactly N addresses
    Fixed(u32),
    /// The pool holds `desiredReplicas + N` addresses
    Flexible(u32),
}

impl AutoPoolIpNumber {
    /// Resolve against the owning controller's desired replica count
    pub fn desired(&self, replicas: u32) -> u32 {
        match self {
            Self::Fixed(n) => *n,
            Self::Flexible(n) => replicas + n,
        }
    }
}

impl std::fmt::Display for AutoPoolIpNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{}", n),
            Self::Flexible(n) => write!(f, "+{}", n),
        }
    }
}

impl FromStr for AutoPoolIpNumber {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('+') {
            let n = rest
                .parse()
                .map_err(|e| AnnotationError::parse(ANNO_POD_IPPOOL_IP_NUMBER, e))?;
            Ok(Self::Flexible(n))
        } else {
            let n = s
                .parse()
                .map_err(|e| AnnotationError::parse(ANNO_POD_IPPOOL_IP_NUMBER, e))?;
            Ok(Self::Fixed(n))
        }
    }
}

/// Typed view over the selection annotations of one pod
#[derive(Debug, Clone, Default)]
pub struct PodAnnotations {
    pub ippool: Option<PodIppoolAnno>,
    pub ippools: Option<Vec<PodIppoolsAnnoItem>>,
    pub subnet: Option<PodSubnetAnno>,
    pub subnets: Option<Vec<PodSubnetAnno>>,
    pub reclaim_ippool: bool,
    pub ippool_ip_number: Option<AutoPoolIpNumber>,
}

impl PodAnnotations {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Result<Self, AnnotationError> {
        let mut out = Self {
            // Auto-pools are reclaimed with their workload unless opted out
            reclaim_ippool: true,
            ..Default::default()
        };

        if let Some(raw) = annotations.get(ANNO_POD_IPPOOL) {
            out.ippool = Some(
                serde_json::from_str(raw)
                    .map_err(|e| AnnotationError::parse(ANNO_POD_IPPOOL, e))?,
            );
        }
        if let Some(raw) = annotations.get(ANNO_POD_IPPOOLS) {
            out.ippools = Some(
                serde_json::from_str(raw)
                    .map_err(|e| AnnotationError::parse(ANNO_POD_IPPOOLS, e))?,
            );
        }
        if let Some(raw) = annotations.get(ANNO_POD_SUBNET) {
            out.subnet = Some(
                serde_json::from_str(raw)
                    .map_err(|e| AnnotationError::parse(ANNO_POD_SUBNET, e))?,
            );
        }
        if let Some(raw) = annotations.get(ANNO_POD_SUBNETS) {
            out.subnets = Some(
                serde_json::from_str(raw)
                    .map_err(|e| AnnotationError::parse(ANNO_POD_SUBNETS, e))?,
            );
        }
        if let Some(raw) = annotations.get(ANNO_POD_RECLAIM_IPPOOL) {
            out.reclaim_ippool = raw
                .trim()
                .parse()
                .map_err(|e| AnnotationError::parse(ANNO_POD_RECLAIM_IPPOOL, e))?;
        }
        if let Some(raw) = annotations.get(ANNO_POD_IPPOOL_IP_NUMBER) {
            out.ippool_ip_number = Some(raw.parse()?);
        }

        Ok(out)
    }
}

/// Parse a namespace default pool annotation (a JSON list of pool names)
pub fn parse_ns_default_pools(raw: &str) -> Result<Vec<String>, AnnotationError> {
    serde_json::from_str(raw).map_err(|e| AnnotationError::parse(ANNO_NS_DEFAULT_IPV4_POOL, e))
}
