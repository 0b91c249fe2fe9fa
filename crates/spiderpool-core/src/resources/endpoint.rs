use super::ippool::Route;
use super::Resource;
use crate::constants;
use crate::types::IpVersion;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Per-pod record of current and historical IP assignments.
///
/// Namespace-scoped; the name equals the pod name. Created on first
/// successful allocation and deleted only after every referenced pool
/// record has been cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderEndpoint {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EndpointStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    /// Latest assignment; rewritten on each allocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<EndpointAllocation>,
    /// Prior assignments, newest first, capped by the history limit
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub history: VecDeque<EndpointAllocation>,
    #[serde(default)]
    pub owner_controller_kind: String,
    #[serde(default)]
    pub owner_controller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// One complete assignment for a pod instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAllocation {
    /// UID of the pod instance this assignment belongs to
    pub uid: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub ips: Vec<NicAllocation>,
}

/// The assignment of one address (per family) to one interface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicAllocation {
    pub nic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<IpVersion>,
    /// Address in `ip/prefix` form
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
    /// Name of the pool the address was taken from
    pub pool: String,
    /// Suppress installing a default route for this NIC
    #[serde(default)]
    pub clean_gateway: bool,
}

impl Resource for SpiderEndpoint {
    const API_VERSION: &'static str = constants::API_VERSION;
    const KIND: &'static str = "SpiderEndpoint";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl SpiderEndpoint {
    pub fn new(namespace: &str, pod_name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(EndpointStatus::default()),
        }
    }

    /// Replace `current`, pushing the previous assignment onto `history`
    /// (capped to `max_history`, oldest dropped).
    pub fn record_allocation(&mut self, allocation: EndpointAllocation, max_history: usize) {
        let status = self.status.get_or_insert_with(EndpointStatus::default);
        if let Some(prev) = status.current.take() {
            status.history.push_front(prev);
            status.history.truncate(max_history);
        }
        status.current = Some(allocation);
    }

    /// Bare address strings of the current assignment
    pub fn current_ips(&self) -> Vec<(String, std::net::IpAddr)> {
        let Some(current) = self.status.as_ref().and_then(|s| s.current.as_ref()) else {
            return Vec::new();
        };
        current
            .ips
            .iter()
            .filter_map(|nic| {
                let addr = nic.address.split('/').next()?;
                Some((nic.pool.clone(), addr.parse().ok()?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(uid: &str, container: &str) -> EndpointAllocation {
        EndpointAllocation {
            uid: uid.to_string(),
            container_id: container.to_string(),
            node: None,
            ips: vec![NicAllocation {
                nic: "eth0".to_string(),
                version: Some(IpVersion::V4),
                address: "10.0.0.1/24".to_string(),
                pool: "p4".to_string(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_record_allocation_caps_history() {
        let mut ep = SpiderEndpoint::new("default", "pod-a");
        for i in 0..5 {
            ep.record_allocation(allocation(&format!("u{}", i), "c"), 3);
        }

        let status = ep.status.as_ref().unwrap();
        assert_eq!(status.current.as_ref().unwrap().uid, "u4");
        assert_eq!(status.history.len(), 3);
        // newest-first order
        assert_eq!(status.history[0].uid, "u3");
        assert_eq!(status.history[2].uid, "u1");
    }

    #[test]
    fn test_current_ips_strips_prefix() {
        let mut ep = SpiderEndpoint::new("default", "pod-a");
        ep.record_allocation(allocation("u1", "c"), 10);

        let ips = ep.current_ips();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].0, "p4");
        assert_eq!(ips[0].1, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }
}
