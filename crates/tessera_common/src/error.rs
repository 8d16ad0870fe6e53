use thiserror::Error;

use crate::types::{ClusterId, ProcedureId, SchemaId, ShardId, TableId};

/// Convenience alias for `Result<T, MetaError>`.
pub type MetaResult<T> = Result<T, MetaError>;

/// Stable error code surfaced on every RPC/HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Internal = 1,
    NotFound = 2,
    AlreadyExists = 3,
    InvalidArgument = 4,
    Unavailable = 5,
    Conflict = 6,
    Timeout = 7,
    PermissionDenied = 8,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Internal => "internal",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Timeout => "timeout",
            ErrorCode::PermissionDenied => "permission_denied",
        }
    }
}

/// Error classification for retry/escalation decisions.
///
/// - `UserError`  — bad input or unsatisfiable request; never retried
/// - `Retryable`  — CAS conflict or leadership change; caller SHOULD retry
/// - `Transient`  — transport failure, timeout, backpressure; caller MAY
///   retry after back-off
/// - `Internal`   — should never happen; alerts, no retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    Internal,
}

/// Top-level error type for the metadata service.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("procedure not found: {0}")]
    ProcedureNotFound(ProcedureId),

    #[error("cluster already exists: {0}")]
    ClusterAlreadyExists(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not leader{}", .leader_hint.as_deref().map(|h| format!(", leader is {h}")).unwrap_or_default())]
    NotLeader { leader_hint: Option<String> },

    /// Compare-and-swap guard mismatch on a versioned record.
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// A procedure's precondition no longer holds after a conflict re-read.
    #[error("stale snapshot: {0}")]
    StaleSnapshot(String),

    /// Transport-level failure talking to the KV or a data node.
    #[error("unavailable: {reason} (retry after {retry_after_ms}ms)")]
    Unavailable { reason: String, retry_after_ms: u64 },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Flow limiter rejected the request.
    #[error("flow limited: {0}")]
    FlowLimited(String),

    /// Remote data node rejected a dispatched event.
    #[error("dispatch rejected by {endpoint}: code {code}, {message}")]
    DispatchRejected {
        endpoint: String,
        code: u32,
        message: String,
    },

    #[error("allocate id failed for {scope}: {reason}")]
    AllocId { scope: String, reason: String },

    #[error("invalid cluster view transition for {cluster}: {reason}")]
    InvalidTopology { cluster: ClusterId, reason: String },

    #[error("encode/decode failed: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetaError {
    /// Stable code surfaced to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            MetaError::ClusterNotFound(_)
            | MetaError::SchemaNotFound(_)
            | MetaError::TableNotFound(_)
            | MetaError::ShardNotFound(_)
            | MetaError::NodeNotFound(_)
            | MetaError::ProcedureNotFound(_) => ErrorCode::NotFound,

            MetaError::ClusterAlreadyExists(_) | MetaError::TableAlreadyExists(_) => {
                ErrorCode::AlreadyExists
            }

            MetaError::InvalidArgument(_) | MetaError::InvalidTopology { .. } => {
                ErrorCode::InvalidArgument
            }

            MetaError::NotLeader { .. } | MetaError::Unavailable { .. } => ErrorCode::Unavailable,

            MetaError::VersionConflict { .. } | MetaError::StaleSnapshot(_) => ErrorCode::Conflict,

            MetaError::Timeout(_) => ErrorCode::Timeout,

            MetaError::PermissionDenied(_) | MetaError::FlowLimited(_) => {
                ErrorCode::PermissionDenied
            }

            MetaError::DispatchRejected { .. }
            | MetaError::AllocId { .. }
            | MetaError::Codec(_)
            | MetaError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::ClusterNotFound(_)
            | MetaError::SchemaNotFound(_)
            | MetaError::TableNotFound(_)
            | MetaError::ShardNotFound(_)
            | MetaError::NodeNotFound(_)
            | MetaError::ProcedureNotFound(_)
            | MetaError::ClusterAlreadyExists(_)
            | MetaError::TableAlreadyExists(_)
            | MetaError::InvalidArgument(_)
            | MetaError::InvalidTopology { .. }
            | MetaError::PermissionDenied(_)
            | MetaError::FlowLimited(_)
            | MetaError::StaleSnapshot(_) => ErrorKind::UserError,

            MetaError::NotLeader { .. } | MetaError::VersionConflict { .. } => ErrorKind::Retryable,

            MetaError::Unavailable { .. } | MetaError::Timeout(_) => ErrorKind::Transient,

            MetaError::DispatchRejected { .. }
            | MetaError::AllocId { .. }
            | MetaError::Codec(_)
            | MetaError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the operation may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Transient)
    }

    /// Suggested retry delay in milliseconds (0 = retry immediately).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            MetaError::Unavailable { retry_after_ms, .. } => *retry_after_ms,
            MetaError::Timeout(_) => 100,
            MetaError::NotLeader { .. } => 200,
            _ => 0,
        }
    }

    /// Construct a transport unavailability error.
    pub fn unavailable(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        MetaError::Unavailable {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Add context to the message, preserving the variant where it carries
    /// structure and falling back to `Internal` otherwise.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            MetaError::Internal(msg) => MetaError::Internal(format!("{ctx}: {msg}")),
            MetaError::Unavailable {
                reason,
                retry_after_ms,
            } => MetaError::Unavailable {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            MetaError::StaleSnapshot(msg) => MetaError::StaleSnapshot(format!("{ctx}: {msg}")),
            MetaError::Timeout(msg) => MetaError::Timeout(format!("{ctx}: {msg}")),
            MetaError::Codec(msg) => MetaError::Codec(format!("{ctx}: {msg}")),
            other => other,
        }
    }

    pub fn table_not_found(schema: SchemaId, name: &str) -> Self {
        MetaError::TableNotFound(format!("{schema}/{name}"))
    }

    pub fn table_already_exists(table_id: TableId, name: &str) -> Self {
        MetaError::TableAlreadyExists(format!("{name} ({table_id})"))
    }
}

/// Add context to a `Result`, preserving error classification.
/// Usage: `kv.get(key).await.ctx("load cluster view")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> MetaResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> MetaResult<T>;
}

impl<T, E: Into<MetaError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> MetaResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn ctx_with(self, f: impl FnOnce() -> String) -> MetaResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Code mapping ────────────────────────────────────────────────────────

    #[test]
    fn test_not_found_codes() {
        assert_eq!(
            MetaError::SchemaNotFound("s".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            MetaError::ShardNotFound(ShardId(1)).code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_conflict_codes() {
        let e = MetaError::VersionConflict {
            key: "shard_view/1".into(),
            expected: 3,
            found: 4,
        };
        assert_eq!(e.code(), ErrorCode::Conflict);
        assert_eq!(
            MetaError::StaleSnapshot("placement changed".into()).code(),
            ErrorCode::Conflict
        );
    }

    #[test]
    fn test_unavailable_code_and_retry() {
        let e = MetaError::unavailable("kv down", 250);
        assert_eq!(e.code(), ErrorCode::Unavailable);
        assert_eq!(e.retry_after_ms(), 250);
        assert!(e.is_retryable());
    }

    // ── Classification ──────────────────────────────────────────────────────

    #[test]
    fn test_version_conflict_is_retryable() {
        let e = MetaError::VersionConflict {
            key: "k".into(),
            expected: 1,
            found: 2,
        };
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_stale_snapshot_is_terminal() {
        let e = MetaError::StaleSnapshot("shard moved".into());
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_not_leader_is_retryable_with_hint() {
        let e = MetaError::NotLeader {
            leader_hint: Some("node-1:8831".into()),
        };
        assert!(e.is_retryable());
        assert!(e.to_string().contains("node-1:8831"));
    }

    #[test]
    fn test_dispatch_rejected_is_internal() {
        let e = MetaError::DispatchRejected {
            endpoint: "node-0:8831".into(),
            code: 500,
            message: "shard busy".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert!(!e.is_retryable());
    }

    // ── Context ─────────────────────────────────────────────────────────────

    #[test]
    fn test_with_context_preserves_unavailable() {
        let e = MetaError::unavailable("dial refused", 50).with_context("open shard");
        assert_eq!(e.code(), ErrorCode::Unavailable);
        assert!(e.to_string().contains("open shard"));
        assert!(e.to_string().contains("dial refused"));
    }

    #[test]
    fn test_error_context_trait() {
        let r: Result<(), MetaError> = Err(MetaError::Internal("boom".into()));
        let err = r.ctx("loading snapshot").unwrap_err();
        assert!(err.to_string().contains("loading snapshot"));
    }

    #[test]
    fn test_code_as_str() {
        assert_eq!(ErrorCode::AlreadyExists.as_str(), "already_exists");
        assert_eq!(ErrorCode::Ok.as_str(), "ok");
    }
}
