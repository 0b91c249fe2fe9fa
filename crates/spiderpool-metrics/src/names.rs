//! The public metric names table.

use metrics::{describe_counter, describe_gauge, describe_histogram};

// Agent IPAM allocation metrics
pub const IPAM_ALLOCATION_COUNTS: &str = "spiderpool_ipam_allocation_counts";
pub const IPAM_ALLOCATION_FAILURE_COUNTS: &str = "spiderpool_ipam_allocation_failure_counts";
pub const IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS: &str =
    "spiderpool_ipam_allocation_update_ippool_conflict_counts";
pub const IPAM_ALLOCATION_ERR_INTERNAL_COUNTS: &str =
    "spiderpool_ipam_allocation_err_internal_counts";
pub const IPAM_ALLOCATION_ERR_NO_AVAILABLE_POOL_COUNTS: &str =
    "spiderpool_ipam_allocation_err_no_available_pool_counts";
pub const IPAM_ALLOCATION_ERR_RETRIES_EXHAUSTED_COUNTS: &str =
    "spiderpool_ipam_allocation_err_retries_exhausted_counts";
pub const IPAM_ALLOCATION_ERR_IP_USED_OUT_COUNTS: &str =
    "spiderpool_ipam_allocation_err_ip_used_out_counts";

pub const IPAM_ALLOCATION_DURATION_SECONDS: &str = "spiderpool_ipam_allocation_duration_seconds";
pub const IPAM_ALLOCATION_AVERAGE_DURATION_SECONDS: &str =
    "spiderpool_ipam_allocation_average_duration_seconds";
pub const IPAM_ALLOCATION_MAX_DURATION_SECONDS: &str =
    "spiderpool_ipam_allocation_max_duration_seconds";
pub const IPAM_ALLOCATION_MIN_DURATION_SECONDS: &str =
    "spiderpool_ipam_allocation_min_duration_seconds";
pub const IPAM_ALLOCATION_LATEST_DURATION_SECONDS: &str =
    "spiderpool_ipam_allocation_latest_duration_seconds";

// Agent IPAM release metrics
pub const IPAM_RELEASE_COUNTS: &str = "spiderpool_ipam_release_counts";
pub const IPAM_RELEASE_FAILURE_COUNTS: &str = "spiderpool_ipam_release_failure_counts";
pub const IPAM_RELEASE_UPDATE_IPPOOL_CONFLICT_COUNTS: &str =
    "spiderpool_ipam_release_update_ippool_conflict_counts";
pub const IPAM_RELEASE_ERR_INTERNAL_COUNTS: &str = "spiderpool_ipam_release_err_internal_counts";
pub const IPAM_RELEASE_ERR_RETRIES_EXHAUSTED_COUNTS: &str =
    "spiderpool_ipam_release_err_retries_exhausted_counts";

pub const IPAM_RELEASE_DURATION_SECONDS: &str = "spiderpool_ipam_release_duration_seconds";
pub const IPAM_RELEASE_AVERAGE_DURATION_SECONDS: &str =
    "spiderpool_ipam_release_average_duration_seconds";
pub const IPAM_RELEASE_MAX_DURATION_SECONDS: &str =
    "spiderpool_ipam_release_max_duration_seconds";
pub const IPAM_RELEASE_MIN_DURATION_SECONDS: &str =
    "spiderpool_ipam_release_min_duration_seconds";
pub const IPAM_RELEASE_LATEST_DURATION_SECONDS: &str =
    "spiderpool_ipam_release_latest_duration_seconds";

// Controller IP GC metrics
pub const IP_GC_COUNTS: &str = "spiderpool_ip_gc_counts";
pub const IP_GC_FAILURE_COUNTS: &str = "spiderpool_ip_gc_failure_counts";

// SpiderSubnet feature metrics
pub const SUBNET_IPPOOL_COUNTS: &str = "spiderpool_subnet_ippool_counts";
pub const AUTO_POOL_WAITED_FOR_AVAILABLE_COUNTS: &str =
    "spiderpool_auto_pool_waited_for_available_counts";

/// Register descriptions for every metric
pub fn describe_all() {
    describe_counter!(IPAM_ALLOCATION_COUNTS, "IPAM allocation requests");
    describe_counter!(IPAM_ALLOCATION_FAILURE_COUNTS, "failed IPAM allocations");
    describe_counter!(
        IPAM_ALLOCATION_UPDATE_IPPOOL_CONFLICT_COUNTS,
        "IPPool write conflicts during allocation"
    );
    describe_counter!(
        IPAM_ALLOCATION_ERR_INTERNAL_COUNTS,
        "allocations failed with an internal error"
    );
    describe_counter!(
        IPAM_ALLOCATION_ERR_NO_AVAILABLE_POOL_COUNTS,
        "allocations failed with no available pool"
    );
    describe_counter!(
        IPAM_ALLOCATION_ERR_RETRIES_EXHAUSTED_COUNTS,
        "allocations failed after exhausting write retries"
    );
    describe_counter!(
        IPAM_ALLOCATION_ERR_IP_USED_OUT_COUNTS,
        "allocations failed with all candidate pools exhausted"
    );
    describe_histogram!(
        IPAM_ALLOCATION_DURATION_SECONDS,
        "IPAM allocation duration in seconds"
    );
    describe_gauge!(
        IPAM_ALLOCATION_AVERAGE_DURATION_SECONDS,
        "average IPAM allocation duration"
    );
    describe_gauge!(
        IPAM_ALLOCATION_MAX_DURATION_SECONDS,
        "max IPAM allocation duration"
    );
    describe_gauge!(
        IPAM_ALLOCATION_MIN_DURATION_SECONDS,
        "min IPAM allocation duration"
    );
    describe_gauge!(
        IPAM_ALLOCATION_LATEST_DURATION_SECONDS,
        "latest IPAM allocation duration"
    );

    describe_counter!(IPAM_RELEASE_COUNTS, "IPAM release requests");
    describe_counter!(IPAM_RELEASE_FAILURE_COUNTS, "failed IPAM releases");
    describe_counter!(
        IPAM_RELEASE_UPDATE_IPPOOL_CONFLICT_COUNTS,
        "IPPool write conflicts during release"
    );
    describe_counter!(
        IPAM_RELEASE_ERR_INTERNAL_COUNTS,
        "releases failed with an internal error"
    );
    describe_counter!(
        IPAM_RELEASE_ERR_RETRIES_EXHAUSTED_COUNTS,
        "releases failed after exhausting write retries"
    );
    describe_histogram!(
        IPAM_RELEASE_DURATION_SECONDS,
        "IPAM release duration in seconds"
    );
    describe_gauge!(
        IPAM_RELEASE_AVERAGE_DURATION_SECONDS,
        "average IPAM release duration"
    );
    describe_gauge!(IPAM_RELEASE_MAX_DURATION_SECONDS, "max IPAM release duration");
    describe_gauge!(IPAM_RELEASE_MIN_DURATION_SECONDS, "min IPAM release duration");
    describe_gauge!(
        IPAM_RELEASE_LATEST_DURATION_SECONDS,
        "latest IPAM release duration"
    );

    describe_counter!(IP_GC_COUNTS, "addresses reclaimed by the IP garbage collector");
    describe_counter!(
        IP_GC_FAILURE_COUNTS,
        "IP garbage collector reclaim failures"
    );

    describe_gauge!(SUBNET_IPPOOL_COUNTS, "IPPools controlled by subnets");
    describe_counter!(
        AUTO_POOL_WAITED_FOR_AVAILABLE_COUNTS,
        "allocations that waited for an auto-pool to become available"
    );
}
