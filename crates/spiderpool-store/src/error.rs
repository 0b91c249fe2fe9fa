use miette::Diagnostic;
use thiserror::Error;

/// Store error type
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// Key not found
    #[error("resource not found: {key}")]
    #[diagnostic(code(store::not_found))]
    NotFound { key: String },

    /// Key already present on insert
    #[error("resource already exists: {key}")]
    #[diagnostic(
        code(store::already_exists),
        help("Update the existing resource or delete it first")
    )]
    AlreadyExists { key: String },

    /// Revision precondition failed on a conditional write
    #[error("conflict writing {key}: expected revision {expected}, store has {actual}")]
    #[diagnostic(
        code(store::conflict),
        help("Re-read the resource and retry with the latest resourceVersion")
    )]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The resource carried no resourceVersion for a conditional write
    #[error("resource {key} carries no resourceVersion")]
    #[diagnostic(code(store::missing_revision))]
    MissingRevision { key: String },

    /// Malformed key (e.g. a namespaced resource without a namespace)
    #[error("invalid resource key: {reason}")]
    #[diagnostic(code(store::invalid_key))]
    InvalidKey { reason: String },

    /// Database error
    #[error("database error: {message}")]
    #[diagnostic(
        code(store::database_error),
        help("Check database logs and ensure the data directory is accessible")
    )]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(store::serialization_error))]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    pub fn conflict(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            key: key.into(),
            expected,
            actual,
        }
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn database(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<StoreError> for spiderpool_core::IpamError {
    fn from(err: StoreError) -> Self {
        use spiderpool_core::IpamError;
        match err {
            // A conflict that escapes the retry helper means the budget ran out
            StoreError::Conflict { key, .. } => IpamError::retries_exhausted(key),
            other => IpamError::internal(other.to_string()),
        }
    }
}

macro_rules! impl_from_redb_error {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    Self::Database {
                        message: err.to_string(),
                        source: Some(Box::new(err)),
                    }
                }
            }
        )+
    };
}

impl_from_redb_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
