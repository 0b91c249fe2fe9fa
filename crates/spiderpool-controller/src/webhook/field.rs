use serde::Serialize;
use std::fmt;

/// Classification of one admission failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldErrorKind {
    Invalid,
    Forbidden,
    NotSupported,
    Duplicate,
    /// Store or I/O failure during validation; the API request may retry
    InternalError,
}

/// A structured admission failure anchored to one field path
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub path: String,
    pub kind: FieldErrorKind,
    pub message: String,
}

pub type ErrorList = Vec<FieldError>;

impl FieldError {
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, FieldErrorKind::Invalid, message)
    }

    pub fn forbidden(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, FieldErrorKind::Forbidden, message)
    }

    pub fn not_supported(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, FieldErrorKind::NotSupported, message)
    }

    pub fn duplicate(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, FieldErrorKind::Duplicate, message)
    }

    pub fn internal(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, FieldErrorKind::InternalError, message)
    }

    fn new(path: impl Into<String>, kind: FieldErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    /// Internal errors are retriable by the API machinery; the rest are
    /// terminal for the request.
    pub fn is_retriable(&self) -> bool {
        self.kind == FieldErrorKind::InternalError
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}: {}", self.path, self.kind, self.message)
    }
}
