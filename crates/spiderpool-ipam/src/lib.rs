//! Spiderpool IPAM - the per-node allocation and release engines.
//!
//! The agent receives requests from the node's network plugin over a local
//! socket, selects candidate pools per interface, allocates addresses under
//! optimistic concurrency, and records the assignment on the pod's
//! SpiderEndpoint. Release walks the recorded assignment back out of the
//! pools, guarded by the pod UID.

pub mod allocate;
pub mod candidate;
pub mod endpoint;
pub mod limiter;
pub mod metrics;
pub mod pool_locks;
pub mod release;
pub mod server;
pub mod sticky;
pub mod types;

pub use allocate::Ipam;
pub use limiter::{Limiter, LimiterError};
pub use metrics::IpamMetrics;
pub use pool_locks::PoolLocks;
pub use server::IpamServer;
pub use types::{
    AllocateRequest, AllocateResponse, AllocationResult, IpConfig, IpamConfig, PoolCandidate,
    ReleaseRequest, RouteConfig, ToBeAllocated,
};
