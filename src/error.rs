use crate::catalog::types::TargetIdentity;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    VersionMismatch,
    InvalidMutation,
    LocaleViolation,
    CatalogNotFound,
    CatalogInWrongState,
    TransactionAlreadyClosed,
    SessionNotFound,
    SessionReadOnly,
    SubscriberOverrun,
    CaptureHistoryUnavailable,
    RestoreAlreadyTriggered,
    CatalogNameConflict,
    ConcurrentUploadViolation,
    BackupSizeExceeded,
    Persistence,
    QueueFull,
    Timeout,
    Cancelled,
    Encode,
    Decode,
    IntegrityError,
    InvalidConfig,
    Validation,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::InvalidMutation => "invalid_mutation",
            ErrorCode::LocaleViolation => "locale_violation",
            ErrorCode::CatalogNotFound => "catalog_not_found",
            ErrorCode::CatalogInWrongState => "catalog_in_wrong_state",
            ErrorCode::TransactionAlreadyClosed => "transaction_already_closed",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionReadOnly => "session_read_only",
            ErrorCode::SubscriberOverrun => "subscriber_overrun",
            ErrorCode::CaptureHistoryUnavailable => "capture_history_unavailable",
            ErrorCode::RestoreAlreadyTriggered => "restore_already_triggered",
            ErrorCode::CatalogNameConflict => "catalog_name_conflict",
            ErrorCode::ConcurrentUploadViolation => "concurrent_upload_violation",
            ErrorCode::BackupSizeExceeded => "backup_size_exceeded",
            ErrorCode::Persistence => "persistence",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::IntegrityError => "integrity_error",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RemodbError {
    #[error("version mismatch on {target}: expected {expected}, actual {actual}")]
    VersionMismatch {
        target: TargetIdentity,
        expected: u64,
        actual: u64,
    },
    #[error("invalid mutation on {target}: {reason}")]
    InvalidMutation {
        target: TargetIdentity,
        reason: String,
    },
    #[error("locale violation on {target}: field '{field}' {reason}")]
    LocaleViolation {
        target: TargetIdentity,
        field: String,
        reason: String,
    },
    #[error("catalog '{catalog}' not found")]
    CatalogNotFound { catalog: String },
    #[error("catalog '{catalog}' is {state}, expected {expected}")]
    CatalogInWrongState {
        catalog: String,
        state: String,
        expected: String,
    },
    #[error("transaction {} is already closed", transaction_id.map(|id| id.to_string()).unwrap_or_else(|| "<none>".into()))]
    TransactionAlreadyClosed { transaction_id: Option<u64> },
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: Uuid },
    #[error("session {session_id} is read-only")]
    SessionReadOnly { session_id: Uuid },
    #[error("subscriber {subscription_id} overran its buffer of {capacity} records")]
    SubscriberOverrun {
        subscription_id: Uuid,
        capacity: usize,
        last_delivered: Option<(u64, u32)>,
    },
    #[error(
        "capture history since version {requested_version} is not retained (oldest retained: {oldest_version})"
    )]
    CaptureHistoryUnavailable {
        requested_version: u64,
        oldest_version: u64,
    },
    #[error("restore for file {file_id} was already triggered")]
    RestoreAlreadyTriggered { file_id: Uuid },
    #[error("catalog '{catalog}' already exists")]
    CatalogNameConflict { catalog: String },
    #[error("concurrent chunk upload for file {file_id}")]
    ConcurrentUploadViolation { file_id: Uuid },
    #[error("backup file {file_id} exceeds declared size (expected {expected}, actual {actual} bytes)")]
    BackupSizeExceeded {
        file_id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("persistence failed for catalog '{catalog}': {message}")]
    Persistence { catalog: String, message: String },
    #[error("queue full")]
    QueueFull,
    #[error("timeout")]
    Timeout,
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("validation error: {0}")]
    Validation(String),
}

impl RemodbError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RemodbError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            RemodbError::InvalidMutation { .. } => ErrorCode::InvalidMutation,
            RemodbError::LocaleViolation { .. } => ErrorCode::LocaleViolation,
            RemodbError::CatalogNotFound { .. } => ErrorCode::CatalogNotFound,
            RemodbError::CatalogInWrongState { .. } => ErrorCode::CatalogInWrongState,
            RemodbError::TransactionAlreadyClosed { .. } => ErrorCode::TransactionAlreadyClosed,
            RemodbError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            RemodbError::SessionReadOnly { .. } => ErrorCode::SessionReadOnly,
            RemodbError::SubscriberOverrun { .. } => ErrorCode::SubscriberOverrun,
            RemodbError::CaptureHistoryUnavailable { .. } => ErrorCode::CaptureHistoryUnavailable,
            RemodbError::RestoreAlreadyTriggered { .. } => ErrorCode::RestoreAlreadyTriggered,
            RemodbError::CatalogNameConflict { .. } => ErrorCode::CatalogNameConflict,
            RemodbError::ConcurrentUploadViolation { .. } => ErrorCode::ConcurrentUploadViolation,
            RemodbError::BackupSizeExceeded { .. } => ErrorCode::BackupSizeExceeded,
            RemodbError::Persistence { .. } => ErrorCode::Persistence,
            RemodbError::QueueFull => ErrorCode::QueueFull,
            RemodbError::Timeout => ErrorCode::Timeout,
            RemodbError::Cancelled(_) => ErrorCode::Cancelled,
            RemodbError::Encode(_) => ErrorCode::Encode,
            RemodbError::Decode(_) => ErrorCode::Decode,
            RemodbError::IntegrityError { .. } => ErrorCode::IntegrityError,
            RemodbError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            RemodbError::Validation(_) => ErrorCode::Validation,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Only optimistic version conflicts may be retried automatically, after a re-read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemodbError::VersionMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, RemodbError};
    use crate::catalog::types::TargetIdentity;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::VersionMismatch.as_str(), "version_mismatch");
        assert_eq!(
            ErrorCode::TransactionAlreadyClosed.as_str(),
            "transaction_already_closed"
        );
        assert_eq!(ErrorCode::SubscriberOverrun.as_str(), "subscriber_overrun");
    }

    #[test]
    fn only_version_mismatch_is_retryable() {
        let target = TargetIdentity::entity("products", "product", 7);
        let conflict = RemodbError::VersionMismatch {
            target: target.clone(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.code_str(), "version_mismatch");
        assert!(conflict.to_string().contains("expected 3, actual 4"));

        let invalid = RemodbError::InvalidMutation {
            target,
            reason: "unknown attribute 'x'".into(),
        };
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.code(), ErrorCode::InvalidMutation);
    }
}
