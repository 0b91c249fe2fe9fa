pub mod endpoint;
pub mod ippool;
pub mod reservedip;
pub mod subnet;

pub use endpoint::{EndpointAllocation, EndpointStatus, NicAllocation, SpiderEndpoint};
pub use ippool::{IPPoolSpec, IPPoolStatus, PoolAllocation, Route, SpiderIPPool};
pub use reservedip::{ReservedIPSpec, SpiderReservedIP};
pub use subnet::{ControlledPool, SpiderSubnet, SubnetSpec, SubnetStatus};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

    if !is_valid_name(name) {
        return Err(ResourceError::InvalidName(name.clone()));
    }

    Ok(())
}

/// Trait for resources held in the cluster store
pub trait Resource:
    Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static
{
    /// API version, e.g. "v1" or "spiderpool.spidernet.io/v1"
    const API_VERSION: &'static str;
    /// Resource kind, e.g. "SpiderIPPool"
    const KIND: &'static str;
    /// Whether instances live inside a namespace
    const NAMESPACED: bool;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// The numeric resource version used for optimistic-concurrency writes
    fn resource_version(&self) -> Option<u64> {
        self.metadata()
            .resource_version
            .as_ref()
            .and_then(|rv| rv.parse().ok())
    }

    fn set_resource_version(&mut self, rv: u64) {
        self.metadata_mut().resource_version = Some(rv.to_string());
    }

    /// Whether the resource carries a deletion timestamp
    fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid resource name: {0}")]
    InvalidName(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-' || b == b'.')
}

// Implement Resource for the platform types the allocator and garbage
// collector read. All of them follow the same accessor shape.
macro_rules! impl_platform_resource {
    ($ty:ty, $api_version:literal, $kind:literal, $namespaced:literal) => {
        impl Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const NAMESPACED: bool = $namespaced;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};

impl_platform_resource!(Pod, "v1", "Pod", true);
impl_platform_resource!(Node, "v1", "Node", false);
impl_platform_resource!(Namespace, "v1", "Namespace", false);
impl_platform_resource!(StatefulSet, "apps/v1", "StatefulSet", true);
impl_platform_resource!(Deployment, "apps/v1", "Deployment", true);
impl_platform_resource!(ReplicaSet, "apps/v1", "ReplicaSet", true);
impl_platform_resource!(DaemonSet, "apps/v1", "DaemonSet", true);
impl_platform_resource!(Job, "batch/v1", "Job", true);
impl_platform_resource!(Lease, "coordination.k8s.io/v1", "Lease", true);
