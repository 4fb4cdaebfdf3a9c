//! Error types for Shardline
//!
//! This module defines the router's main error type and the numeric wire
//! codes shared with shards and clients. Shards report failures as
//! `{ok: 0, code, codeName, errmsg}` documents; the router surfaces its
//! own protocol failures with the same code vocabulary so a client cannot
//! tell which side of the wire rejected a statement.

use crate::cluster::ShardId;
use thiserror::Error;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Numeric wire error codes
///
/// The subset of the cluster's error-code table the router raises or
/// inspects. Codes above 50000 are internal assertions for protocol
/// violations between router and shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    Ok = 0,
    /// Unclassified server error
    InternalError = 1,
    /// Target host cannot be reached
    HostUnreachable = 6,
    /// Target host is unknown
    HostNotFound = 7,
    /// Operation is not legal in the current state
    IllegalOperation = 20,
    /// Operation exceeded its client-supplied time limit
    MaxTimeExpired = 50,
    /// Routing table for a collection is out of date
    StaleShardVersion = 63,
    /// The write was applied but the write concern could not be satisfied
    WriteConcernFailed = 64,
    /// Options on the operation are invalid or inconsistent
    InvalidOptions = 72,
    /// Network round-trip timed out
    NetworkTimeout = 89,
    /// Remote node is shutting down
    ShutdownInProgress = 91,
    /// Another operation on the session holds the transaction
    ConflictingOperationInProgress = 117,
    /// Command must run against the resolved view definition
    ViewMustBeResolved = 169,
    /// Remote primary stepped down while the request was in flight
    PrimarySteppedDown = 189,
    /// Transaction number is older than the session's current transaction
    TransactionTooOld = 225,
    /// Requested snapshot timestamp is not available on the shard
    SnapshotUnavailable = 246,
    /// Routing table for a database is out of date
    StaleDbVersion = 249,
    /// No transaction with the given number is open on the session
    NoSuchTransaction = 251,
    /// Operation exceeded a server-side time limit
    ExceededTimeLimit = 262,
    /// Low-level socket failure
    SocketException = 9001,
    /// Remote node is not the primary
    NotPrimary = 10107,
    /// Remote node was interrupted by shutdown
    InterruptedAtShutdown = 11600,
    /// Remote node was interrupted by a replica-state change
    InterruptedDueToReplStateChange = 11602,
    /// Commit recovery was requested without a recovery token
    RecoveryTokenRequired = 50940,
    /// A pre-existing participant responded without a readOnly marker
    ReadOnlyMarkerMissing = 51112,
    /// A participant claimed to be read-only after reporting a write
    ReadOnlyAfterWrite = 51113,
}

impl ErrorCode {
    /// Convert to the i32 code used on the wire
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Map a wire code back to a known `ErrorCode`
    pub fn from_i32(code: i32) -> Option<ErrorCode> {
        use ErrorCode::*;
        Some(match code {
            0 => Ok,
            1 => InternalError,
            6 => HostUnreachable,
            7 => HostNotFound,
            20 => IllegalOperation,
            50 => MaxTimeExpired,
            63 => StaleShardVersion,
            64 => WriteConcernFailed,
            72 => InvalidOptions,
            89 => NetworkTimeout,
            91 => ShutdownInProgress,
            117 => ConflictingOperationInProgress,
            169 => ViewMustBeResolved,
            189 => PrimarySteppedDown,
            225 => TransactionTooOld,
            246 => SnapshotUnavailable,
            249 => StaleDbVersion,
            251 => NoSuchTransaction,
            262 => ExceededTimeLimit,
            9001 => SocketException,
            10107 => NotPrimary,
            11600 => InterruptedAtShutdown,
            11602 => InterruptedDueToReplStateChange,
            50940 => RecoveryTokenRequired,
            51112 => ReadOnlyMarkerMissing,
            51113 => ReadOnlyAfterWrite,
            _ => return None,
        })
    }

    /// The symbolic name reported in `codeName` fields and abort causes
    pub fn code_name(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            Ok => "OK",
            InternalError => "InternalError",
            HostUnreachable => "HostUnreachable",
            HostNotFound => "HostNotFound",
            IllegalOperation => "IllegalOperation",
            MaxTimeExpired => "MaxTimeExpired",
            StaleShardVersion => "StaleShardVersion",
            WriteConcernFailed => "WriteConcernFailed",
            InvalidOptions => "InvalidOptions",
            NetworkTimeout => "NetworkTimeout",
            ShutdownInProgress => "ShutdownInProgress",
            ConflictingOperationInProgress => "ConflictingOperationInProgress",
            ViewMustBeResolved => "ViewMustBeResolved",
            PrimarySteppedDown => "PrimarySteppedDown",
            TransactionTooOld => "TransactionTooOld",
            SnapshotUnavailable => "SnapshotUnavailable",
            StaleDbVersion => "StaleDbVersion",
            NoSuchTransaction => "NoSuchTransaction",
            ExceededTimeLimit => "ExceededTimeLimit",
            SocketException => "SocketException",
            NotPrimary => "NotPrimary",
            InterruptedAtShutdown => "InterruptedAtShutdown",
            InterruptedDueToReplStateChange => "InterruptedDueToReplStateChange",
            RecoveryTokenRequired => "RecoveryTokenRequired",
            ReadOnlyMarkerMissing => "ReadOnlyMarkerMissing",
            ReadOnlyAfterWrite => "ReadOnlyAfterWrite",
        }
    }

    /// Returns true if a retryable write would retry on this code
    pub fn is_retryable_write(&self) -> bool {
        matches!(
            self,
            ErrorCode::HostUnreachable
                | ErrorCode::HostNotFound
                | ErrorCode::NetworkTimeout
                | ErrorCode::ShutdownInProgress
                | ErrorCode::PrimarySteppedDown
                | ErrorCode::SocketException
                | ErrorCode::NotPrimary
                | ErrorCode::InterruptedAtShutdown
                | ErrorCode::InterruptedDueToReplStateChange
        )
    }

    /// Returns true if this code means a time limit was exceeded
    pub fn is_exceeded_time_limit(&self) -> bool {
        matches!(self, ErrorCode::MaxTimeExpired | ErrorCode::ExceededTimeLimit)
    }

    /// Returns true if this code reports stale shard or database routing
    pub fn is_stale_routing(&self) -> bool {
        matches!(self, ErrorCode::StaleShardVersion | ErrorCode::StaleDbVersion)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code_name())
    }
}

/// Returns true if a retryable write would retry on this raw wire code
pub fn is_retryable_write_code(code: i32) -> bool {
    ErrorCode::from_i32(code).is_some_and(|c| c.is_retryable_write())
}

/// Returns true if this raw wire code means a time limit was exceeded
pub fn is_exceeded_time_limit_code(code: i32) -> bool {
    ErrorCode::from_i32(code).is_some_and(|c| c.is_exceeded_time_limit())
}

/// The symbolic name for a raw wire code, `"Location<code>"` if unknown
pub fn code_name_for(code: i32) -> String {
    match ErrorCode::from_i32(code) {
        Some(known) => known.code_name().to_string(),
        None => format!("Location{code}"),
    }
}

/// Main error type for the transaction router
#[derive(Debug, Error, Clone)]
pub enum RouterError {
    #[error("transaction too old: {0}")]
    TransactionTooOld(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("no such transaction: {0}")]
    NoSuchTransaction(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("cannot recover the transaction decision without a recovery token: {0}")]
    RecoveryTokenRequired(String),

    /// A shard violated the participant response contract (codes 51112/51113)
    #[error("participant contract violated ({code}): {message}")]
    ParticipantContract { code: ErrorCode, message: String },

    /// A shard rejected a router-issued command
    #[error("shard {shard} failed command: {message} ({code_name})")]
    ShardCommand {
        shard: ShardId,
        code: i32,
        code_name: String,
        message: String,
    },

    /// The request never produced a response from the shard
    #[error("transport to shard {shard} failed: {message}")]
    Transport { shard: ShardId, message: String },
}

impl RouterError {
    pub fn transport(shard: ShardId, message: impl Into<String>) -> Self {
        Self::Transport {
            shard,
            message: message.into(),
        }
    }

    /// The wire code this error surfaces as
    pub fn code(&self) -> i32 {
        match self {
            RouterError::TransactionTooOld(_) => ErrorCode::TransactionTooOld.as_i32(),
            RouterError::ConflictingOperationInProgress(_) => {
                ErrorCode::ConflictingOperationInProgress.as_i32()
            }
            RouterError::NoSuchTransaction(_) => ErrorCode::NoSuchTransaction.as_i32(),
            RouterError::InvalidOptions(_) => ErrorCode::InvalidOptions.as_i32(),
            RouterError::IllegalOperation(_) => ErrorCode::IllegalOperation.as_i32(),
            RouterError::RecoveryTokenRequired(_) => ErrorCode::RecoveryTokenRequired.as_i32(),
            RouterError::ParticipantContract { code, .. } => code.as_i32(),
            RouterError::ShardCommand { code, .. } => *code,
            RouterError::Transport { .. } => ErrorCode::HostUnreachable.as_i32(),
        }
    }

    /// The symbolic code name, used when recording abort causes
    pub fn code_string(&self) -> String {
        match self {
            RouterError::ShardCommand { code_name, .. } => code_name.clone(),
            other => code_name_for(other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in [
            ErrorCode::TransactionTooOld,
            ErrorCode::NoSuchTransaction,
            ErrorCode::ReadOnlyMarkerMissing,
            ErrorCode::ReadOnlyAfterWrite,
            ErrorCode::SnapshotUnavailable,
        ] {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(424242), None);
    }

    #[test]
    fn retryable_write_classification() {
        assert!(is_retryable_write_code(ErrorCode::HostUnreachable.as_i32()));
        assert!(is_retryable_write_code(ErrorCode::PrimarySteppedDown.as_i32()));
        assert!(!is_retryable_write_code(ErrorCode::NoSuchTransaction.as_i32()));
        assert!(!is_retryable_write_code(ErrorCode::WriteConcernFailed.as_i32()));
    }

    #[test]
    fn unknown_code_names_carry_the_raw_code() {
        assert_eq!(code_name_for(424242), "Location424242");
        assert_eq!(code_name_for(251), "NoSuchTransaction");
    }

    #[test]
    fn router_error_code_strings() {
        let err = RouterError::TransactionTooOld("txn 3 < 7".into());
        assert_eq!(err.code(), 225);
        assert_eq!(err.code_string(), "TransactionTooOld");

        let shard_err = RouterError::ShardCommand {
            shard: ShardId::new("shard-a"),
            code: 424242,
            code_name: "SomeVendorError".into(),
            message: "boom".into(),
        };
        assert_eq!(shard_err.code_string(), "SomeVendorError");
    }
}
