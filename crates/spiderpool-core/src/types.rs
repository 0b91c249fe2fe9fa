use serde::{Deserialize, Serialize};
use std::fmt;

/// IP family of a pool, subnet, or address list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Construct from the numeric form used in resource specs (4 or 6)
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }

    pub fn as_number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }

    /// Whether the given address belongs to this family
    pub fn matches(self, ip: &std::net::IpAddr) -> bool {
        match self {
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = String;

    fn try_from(n: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_number(n).ok_or_else(|| format!("invalid IP version {}, expect 4 or 6", n))
    }
}

impl From<IpVersion> for u8 {
    fn from(v: IpVersion) -> u8 {
        v.as_number()
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.as_number())
    }
}

/// Kind of the controller that owns a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    StatefulSet,
    Deployment,
    ReplicaSet,
    DaemonSet,
    Job,
    /// A bare pod with no owning controller
    Pod,
    /// Any other (custom) controller kind
    Unknown(String),
}

impl OwnerKind {
    /// Classify a pod's controller owner-reference kind
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "StatefulSet" => Self::StatefulSet,
            "Deployment" => Self::Deployment,
            "ReplicaSet" => Self::ReplicaSet,
            "DaemonSet" => Self::DaemonSet,
            "Job" => Self::Job,
            "Pod" => Self::Pod,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
            Self::Job => "Job",
            Self::Pod => "Pod",
            Self::Unknown(s) => s,
        }
    }

    /// Long-lived controllers keep their pods' addresses across restarts;
    /// a Succeeded/Failed pod of a short-lived owner is reclaimable.
    pub fn is_long_lived(&self) -> bool {
        matches!(
            self,
            Self::StatefulSet | Self::Deployment | Self::ReplicaSet | Self::DaemonSet
        )
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_version_roundtrip() {
        assert_eq!(IpVersion::from_number(4), Some(IpVersion::V4));
        assert_eq!(IpVersion::from_number(6), Some(IpVersion::V6));
        assert_eq!(IpVersion::from_number(5), None);

        let json = serde_json::to_string(&IpVersion::V4).unwrap();
        assert_eq!(json, "4");
        let back: IpVersion = serde_json::from_str("6").unwrap();
        assert_eq!(back, IpVersion::V6);
        assert!(serde_json::from_str::<IpVersion>("5").is_err());
    }

    #[test]
    fn test_ip_version_matches() {
        let v4: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        let v6: std::net::IpAddr = "fd00::1".parse().unwrap();
        assert!(IpVersion::V4.matches(&v4));
        assert!(!IpVersion::V4.matches(&v6));
        assert!(IpVersion::V6.matches(&v6));
    }

    #[test]
    fn test_owner_kind_classification() {
        assert_eq!(OwnerKind::from_kind("StatefulSet"), OwnerKind::StatefulSet);
        assert_eq!(
            OwnerKind::from_kind("CloneSet"),
            OwnerKind::Unknown("CloneSet".to_string())
        );
        assert!(OwnerKind::Deployment.is_long_lived());
        assert!(!OwnerKind::Job.is_long_lived());
        assert!(!OwnerKind::Pod.is_long_lived());
    }
}
