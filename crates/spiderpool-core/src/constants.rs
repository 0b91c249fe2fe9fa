//! Shared constant names used across the agent and controller.

/// API group of the custom resources
pub const API_GROUP: &str = "spiderpool.spidernet.io";

/// Full apiVersion of the custom resources
pub const API_VERSION: &str = "spiderpool.spidernet.io/v1";

/// Finalizer held on SpiderEndpoint resources until all of their pool
/// records are cleared
pub const SPIDERPOOL_FINALIZER: &str = "spiderpool.spidernet.io/spiderpool";

/// Default path of the local allocation socket
pub const DEFAULT_IPAM_UNIX_SOCKET_PATH: &str = "/var/run/spiderpool/spiderpool.sock";

/// Label stamped on auto-pools naming the owning application as
/// `<kind>_<namespace>_<name>`
pub const LABEL_OWNER_APPLICATION: &str = "ipam.spidernet.io/owner-application";

/// Annotation on the pod naming the CNI network it is attached through
pub const ANNO_MULTUS_DEFAULT_NETWORK: &str = "v1.multus-cni.io/default-network";

/// Default cap on SpiderEndpoint history records
pub const DEFAULT_MAX_HISTORY_RECORDS: usize = 100;

/// Default hard ceiling on allocated addresses per pool
pub const DEFAULT_MAX_ALLOCATED_IPS: usize = 5000;

/// Default budget for optimistic-write retries
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Default unit of the exponential backoff between conflict retries
pub const DEFAULT_CONFLICT_RETRY_UNIT_MS: u64 = 300;
