use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error code returned to the network plugin over the local socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ServerError,
    InvalidArgument,
    PoolNotFound,
    NoAvailablePool,
    IPUsedOut,
    RetriesExhausted,
    WaitingForAvailable,
    Terminating,
}

/// Error type for IPAM operations
#[derive(Error, Debug, Diagnostic)]
pub enum IpamError {
    /// Malformed request or resource field
    #[error("invalid argument: {reason}")]
    #[diagnostic(code(spiderpool::invalid_argument))]
    InvalidArgument { reason: String },

    /// A named IPPool does not exist
    #[error("IPPool {pool} not found")]
    #[diagnostic(
        code(spiderpool::pool_not_found),
        help("Verify the pool name in the pod annotation or cluster defaults")
    )]
    PoolNotFound { pool: String },

    /// No candidate pool survived selection for an enabled IP family
    #[error("no available {version} IPPool for interface {nic}")]
    #[diagnostic(
        code(spiderpool::no_available_pool),
        help("Check pool affinities, disable flags, and the cluster default pool list")
    )]
    NoAvailablePool {
        version: crate::types::IpVersion,
        nic: String,
    },

    /// Every candidate pool for a family is exhausted
    #[error("all {version} candidate IPPools {pools:?} have no free address")]
    #[diagnostic(code(spiderpool::ip_used_out))]
    IpUsedOut {
        version: crate::types::IpVersion,
        pools: Vec<String>,
    },

    /// Optimistic-write retries exceeded the per-operation budget
    #[error("retries exhausted while updating {resource}")]
    #[diagnostic(
        code(spiderpool::retries_exhausted),
        help("The resource is under heavy concurrent modification; the caller may retry")
    )]
    RetriesExhausted { resource: String },

    /// An auto-pool carved from a Subnet is not ready yet
    #[error("waiting for IPPool of subnet {subnet} to become available: {reason}")]
    #[diagnostic(code(spiderpool::waiting_for_available))]
    WaitingForAvailable { subnet: String, reason: String },

    /// The pod is being deleted
    #[error("pod {namespace}/{pod} is terminating")]
    #[diagnostic(code(spiderpool::terminating))]
    Terminating { namespace: String, pod: String },

    /// Internal store or I/O error
    #[error("internal error: {message}")]
    #[diagnostic(code(spiderpool::internal_error))]
    Internal { message: String },
}

/// Result type alias for IPAM operations
pub type Result<T> = std::result::Result<T, IpamError>;

impl IpamError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn pool_not_found(pool: impl Into<String>) -> Self {
        Self::PoolNotFound { pool: pool.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn retries_exhausted(resource: impl Into<String>) -> Self {
        Self::RetriesExhausted {
            resource: resource.into(),
        }
    }

    pub fn waiting_for_available(subnet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WaitingForAvailable {
            subnet: subnet.into(),
            reason: reason.into(),
        }
    }

    /// The wire code reported to the network plugin
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::PoolNotFound { .. } => ErrorCode::PoolNotFound,
            Self::NoAvailablePool { .. } => ErrorCode::NoAvailablePool,
            Self::IpUsedOut { .. } => ErrorCode::IPUsedOut,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::WaitingForAvailable { .. } => ErrorCode::WaitingForAvailable,
            Self::Terminating { .. } => ErrorCode::Terminating,
            Self::Internal { .. } => ErrorCode::ServerError,
        }
    }

    /// Errors the network plugin is expected to retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IpUsedOut { .. } | Self::WaitingForAvailable { .. }
        )
    }
}

impl From<crate::ip::IpError> for IpamError {
    fn from(err: crate::ip::IpError) -> Self {
        Self::InvalidArgument {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IpVersion;

    #[test]
    fn test_error_codes() {
        let err = IpamError::pool_not_found("p4");
        assert_eq!(err.code(), ErrorCode::PoolNotFound);

        let err = IpamError::IpUsedOut {
            version: IpVersion::V4,
            pools: vec!["p4".to_string()],
        };
        assert_eq!(err.code(), ErrorCode::IPUsedOut);
        assert!(err.is_retryable());

        let err = IpamError::internal("boom");
        assert_eq!(err.code(), ErrorCode::ServerError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_waiting_is_retryable() {
        let err = IpamError::waiting_for_available("subnet-a", "no free space");
        assert_eq!(err.code(), ErrorCode::WaitingForAvailable);
        assert!(err.is_retryable());
    }
}
