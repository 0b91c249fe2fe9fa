use super::Resource;
use crate::constants;
use crate::ip::{self, IpError};
use crate::types::IpVersion;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Cluster-wide list of addresses that must never be allocated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderReservedIP {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReservedIPSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedIPSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
    #[serde(default)]
    pub ips: Vec<String>,
}

impl Resource for SpiderReservedIP {
    const API_VERSION: &'static str = constants::API_VERSION;
    const KIND: &'static str = "SpiderReservedIP";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl SpiderReservedIP {
    pub fn version(&self) -> Result<IpVersion, IpError> {
        self.spec
            .ip_version
            .ok_or_else(|| IpError::parse("IP version", "<missing spec.ipVersion>"))
    }

    /// Expand the reserved ranges of this resource
    pub fn reserved_ips(&self) -> Result<Vec<IpAddr>, IpError> {
        ip::convert_ip_ranges_to_ips(self.version()?, &self.spec.ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ips() {
        let mut r = SpiderReservedIP::default();
        r.metadata.name = Some("reserved-a".to_string());
        r.spec.ip_version = Some(IpVersion::V4);
        r.spec.ips = vec!["10.0.0.100-10.0.0.101".to_string()];

        let ips = r.reserved_ips().unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "10.0.0.100".parse::<IpAddr>().unwrap());
    }
}
