use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    /// The instance tried to perform primary-only work without holding the lease.
    PrimaryLeaseLost,
    /// A storage transaction was aborted by the substrate and may be retried.
    TransactionAborted,
    /// Durable storage cannot be used by this instance.
    PersistenceUnavailable,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::PrimaryLeaseLost => "firestore/primary-lease-lost",
            FirestoreErrorCode::TransactionAborted => "firestore/transaction-aborted",
            FirestoreErrorCode::PersistenceUnavailable => "firestore/persistence-unavailable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

/// Maps a numeric backend status code onto [`FirestoreErrorCode`].
pub fn map_grpc_status(code: i32) -> FirestoreErrorCode {
    match code {
        1 => FirestoreErrorCode::Cancelled,
        3 => FirestoreErrorCode::InvalidArgument,
        4 => FirestoreErrorCode::DeadlineExceeded,
        5 => FirestoreErrorCode::NotFound,
        6 => FirestoreErrorCode::AlreadyExists,
        7 => FirestoreErrorCode::PermissionDenied,
        8 => FirestoreErrorCode::ResourceExhausted,
        9 => FirestoreErrorCode::FailedPrecondition,
        10 => FirestoreErrorCode::Aborted,
        11 => FirestoreErrorCode::OutOfRange,
        12 => FirestoreErrorCode::Unimplemented,
        13 => FirestoreErrorCode::Internal,
        14 => FirestoreErrorCode::Unavailable,
        15 => FirestoreErrorCode::DataLoss,
        16 => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}

/// Errors that only interrupt the current stream; the stream reconnects with backoff.
pub fn is_transient_network_error(code: FirestoreErrorCode) -> bool {
    matches!(
        code,
        FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
    )
}

/// Errors the backend will keep returning no matter how often the request is retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::PrimaryLeaseLost
        | FirestoreErrorCode::TransactionAborted
        | FirestoreErrorCode::PersistenceUnavailable => false,
        other => !is_transient_network_error(other),
    }
}

/// Write errors that reject the head batch of the pipeline instead of retrying it.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code)
}

/// Storage failures that are resolved by running the operation again.
pub fn is_retryable_storage_error(error: &FirestoreError) -> bool {
    error.code == FirestoreErrorCode::TransactionAborted
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn primary_lease_lost(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PrimaryLeaseLost, message)
}

pub fn transaction_aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::TransactionAborted, message)
}

pub fn persistence_unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PersistenceUnavailable, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_errors() {
        assert!(is_transient_network_error(FirestoreErrorCode::Unavailable));
        assert!(is_transient_network_error(FirestoreErrorCode::Unauthenticated));
        assert!(!is_permanent_error(FirestoreErrorCode::ResourceExhausted));
        assert!(is_permanent_error(FirestoreErrorCode::PermissionDenied));
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::FailedPrecondition));
        assert!(!is_permanent_error(FirestoreErrorCode::PrimaryLeaseLost));
    }

    #[test]
    fn maps_numeric_status() {
        assert_eq!(map_grpc_status(7), FirestoreErrorCode::PermissionDenied);
        assert_eq!(map_grpc_status(14), FirestoreErrorCode::Unavailable);
        assert_eq!(map_grpc_status(99), FirestoreErrorCode::Unknown);
    }

    #[test]
    fn display_includes_code() {
        let err = transaction_aborted("conflict");
        assert_eq!(err.to_string(), "conflict (firestore/transaction-aborted)");
        assert!(is_retryable_storage_error(&err));
    }
}
