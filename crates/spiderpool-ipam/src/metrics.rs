use metrics::counter;
use spiderpool_core::{ErrorCode, IpamError};
use spiderpool_metrics::{names, AsyncGauge, DurationRecorder};
use std::sync::Arc;

/// The agent's duration recorders, created once at startup
pub struct IpamMetrics {
    pub allocation_duration: DurationRecorder,
    pub release_duration: DurationRecorder,
}

impl IpamMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allocation_duration: DurationRecorder::new(
                names::IPAM_ALLOCATION_DURATION_SECONDS,
                names::IPAM_ALLOCATION_AVERAGE_DURATION_SECONDS,
                names::IPAM_ALLOCATION_MAX_DURATION_SECONDS,
                names::IPAM_ALLOCATION_MIN_DURATION_SECONDS,
                names::IPAM_ALLOCATION_LATEST_DURATION_SECONDS,
            ),
            release_duration: DurationRecorder::new(
                names::IPAM_RELEASE_DURATION_SECONDS,
                names::IPAM_RELEASE_AVERAGE_DURATION_SECONDS,
                names::IPAM_RELEASE_MAX_DURATION_SECONDS,
                names::IPAM_RELEASE_MIN_DURATION_SECONDS,
                names::IPAM_RELEASE_LATEST_DURATION_SECONDS,
            ),
        })
    }

    /// Gauges to register with the process-wide publisher
    pub fn gauges(&self) -> Vec<Arc<AsyncGauge>> {
        let mut gauges = self.allocation_duration.gauges();
        gauges.extend(self.release_duration.gauges());
        gauges
    }
}

/// Count one finished allocation by outcome
pub fn record_allocation_outcome(result: &Result<(), &IpamError>) {
    counter!(names::IPAM_ALLOCATION_COUNTS).increment(1);
    let Err(err) = result else { return };

    counter!(names::IPAM_ALLOCATION_FAILURE_COUNTS).increment(1);
    match err.code() {
        ErrorCode::NoAvailablePool => {
            counter!(names::IPAM_ALLOCATION_ERR_NO_AVAILABLE_POOL_COUNTS).increment(1)
        }
        ErrorCode::IPUsedOut => {
            counter!(names::IPAM_ALLOCATION_ERR_IP_USED_OUT_COUNTS).increment(1)
        }
        ErrorCode::RetriesExhausted => {
            counter!(names::IPAM_ALLOCATION_ERR_RETRIES_EXHAUSTED_COUNTS).increment(1)
        }
        ErrorCode::ServerError => {
            counter!(names::IPAM_ALLOCATION_ERR_INTERNAL_COUNTS).increment(1)
        }
        _ => {}
    }
}

/// Count one finished release by outcome
pub fn record_release_outcome(result: &Result<(), &IpamError>) {
    counter!(names::IPAM_RELEASE_COUNTS).increment(1);
    let Err(err) = result else { return };

    counter!(names::IPAM_RELEASE_FAILURE_COUNTS).increment(1);
    match err.code() {
        ErrorCode::RetriesExhausted => {
            counter!(names::IPAM_RELEASE_ERR_RETRIES_EXHAUSTED_COUNTS).increment(1)
        }
        ErrorCode::ServerError => {
            counter!(names::IPAM_RELEASE_ERR_INTERNAL_COUNTS).increment(1)
        }
        _ => {}
    }
}
