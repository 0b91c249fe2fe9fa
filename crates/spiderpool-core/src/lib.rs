//! Spiderpool Core - Fundamental types for the Spiderpool IPAM system
//!
//! This crate provides:
//! - The custom resource data model (SpiderIPPool, SpiderSubnet,
//!   SpiderEndpoint, SpiderReservedIP)
//! - The pure IP range algebra used by allocation and validation
//! - Pod annotation parsing for pool selection
//! - The error taxonomy surfaced to IPAM callers

pub mod annotations;
pub mod config;
pub mod constants;
pub mod error;
pub mod ip;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorCode, IpamError, Result};
pub use resources::{
    is_valid_name, validate_base, ControlledPool, EndpointAllocation, IPPoolSpec, IPPoolStatus,
    NicAllocation, PoolAllocation, Resource, ResourceError, Route, SpiderEndpoint, SpiderIPPool,
    SpiderReservedIP, SpiderSubnet, SubnetSpec, SubnetStatus,
};
pub use types::{IpVersion, OwnerKind};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
pub use k8s_openapi::api::batch::v1::Job;
pub use k8s_openapi::api::coordination::v1::Lease;
pub use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
