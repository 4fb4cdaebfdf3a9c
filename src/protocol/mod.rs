//! Wire document model for router ⇄ shard commands
//!
//! Commands and responses are JSON documents. The router never interprets
//! a client command's own fields; it only decorates the outgoing document
//! with the transaction envelope (`txnNumber`, `autocommit`,
//! `startTransaction`, `readConcern`, `coordinator`) and reads the
//! transaction metadata shards attach to replies (`ok`, `code`,
//! `writeConcernError`, `readOnly`).

use crate::cluster::{ClusterTime, ShardId};
use crate::error::code_name_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Transaction number field attached to every in-transaction command
pub const TXN_NUMBER_FIELD: &str = "txnNumber";
/// Autocommit marker, always `false` inside a transaction
pub const AUTOCOMMIT_FIELD: &str = "autocommit";
/// Marks the first command sent to a participant
pub const START_TRANSACTION_FIELD: &str = "startTransaction";
/// Read concern document field
pub const READ_CONCERN_FIELD: &str = "readConcern";
/// Read concern level subfield
pub const LEVEL_FIELD: &str = "level";
/// Client-requested lower bound for the snapshot timestamp
pub const AFTER_CLUSTER_TIME_FIELD: &str = "afterClusterTime";
/// The pinned snapshot timestamp attached to snapshot read concern
pub const AT_CLUSTER_TIME_FIELD: &str = "atClusterTime";
/// Marker telling a shard it coordinates two-phase commit
pub const COORDINATOR_FIELD: &str = "coordinator";
/// Write concern document field
pub const WRITE_CONCERN_FIELD: &str = "writeConcern";
/// Participant list on `coordinateCommitTransaction`
pub const PARTICIPANTS_FIELD: &str = "participants";
/// Per-statement read-only marker on participant replies
pub const READ_ONLY_FIELD: &str = "readOnly";
/// Recovery token attached to transactional replies
pub const RECOVERY_TOKEN_FIELD: &str = "recoveryToken";

/// Commit a single participant's local transaction
pub const COMMIT_TRANSACTION_CMD: &str = "commitTransaction";
/// Abort a participant's local transaction
pub const ABORT_TRANSACTION_CMD: &str = "abortTransaction";
/// Prepare phase of two-phase commit (shard internal)
pub const PREPARE_TRANSACTION_CMD: &str = "prepareTransaction";
/// Run (or answer for) two-phase commit as the coordinator
pub const COORDINATE_COMMIT_CMD: &str = "coordinateCommitTransaction";

/// Returns true for the transaction-control commands, which never carry
/// the options that start a transaction (`startTransaction`, read concern).
pub fn is_transaction_control_command(name: &str) -> bool {
    matches!(
        name,
        ABORT_TRANSACTION_CMD
            | COMMIT_TRANSACTION_CMD
            | PREPARE_TRANSACTION_CMD
            | COORDINATE_COMMIT_CMD
    )
}

/// Commands that are idempotent under transactional semantics and can be
/// blindly retried mid-transaction. Writing aggregation pipelines are
/// disallowed in a transaction, so aggregations must be read operations.
/// Cursors established by an unsuccessful attempt are best-effort killed.
pub fn is_retryable_in_transaction(name: &str) -> bool {
    matches!(name, "aggregate" | "distinct" | "find" | "getMore" | "killCursors")
}

/// Read concern levels
///
/// Only `local`, `majority`, and `snapshot` may open a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcernLevel {
    Local,
    Available,
    Majority,
    Linearizable,
    Snapshot,
}

impl ReadConcernLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ReadConcernLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read concern as declared by a client statement
///
/// The first statement of a transaction owns the read concern for the
/// transaction's whole life; later statements must not carry one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConcernArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<ReadConcernLevel>,
    #[serde(
        rename = "afterClusterTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub after_cluster_time: Option<ClusterTime>,
}

impl ReadConcernArgs {
    pub fn with_level(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            after_cluster_time: None,
        }
    }

    pub fn snapshot() -> Self {
        Self::with_level(ReadConcernLevel::Snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }

    /// Whether this level may open a transaction
    pub fn level_allowed_in_transaction(&self) -> bool {
        matches!(
            self.level,
            None | Some(
                ReadConcernLevel::Local | ReadConcernLevel::Majority | ReadConcernLevel::Snapshot
            )
        )
    }

    /// Render as the wire `readConcern` subdocument
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        if let Some(level) = self.level {
            doc.insert(LEVEL_FIELD.to_string(), json!(level.as_str()));
        }
        if let Some(after) = self.after_cluster_time {
            doc.insert(AFTER_CLUSTER_TIME_FIELD.to_string(), json!(after.as_u64()));
        }
        doc
    }
}

/// Write concern forwarded on terminal transaction commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: String,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            w: "majority".to_string(),
        }
    }
}

impl WriteConcern {
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert("w".to_string(), json!(self.w));
        doc
    }
}

/// Token returned to clients so any router can later recover the
/// transaction's commit outcome. Empty for read-only transactions, which
/// need no recovery and can simply be retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    #[serde(rename = "recoveryShardId", skip_serializing_if = "Option::is_none")]
    pub recovery_shard_id: Option<ShardId>,
}

impl RecoveryToken {
    pub fn new(recovery_shard_id: Option<ShardId>) -> Self {
        Self { recovery_shard_id }
    }

    pub fn is_empty(&self) -> bool {
        self.recovery_shard_id.is_none()
    }
}

/// An outgoing command document: the command name plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCommand {
    name: String,
    body: Map<String, Value>,
}

impl ShardCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.body.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) -> &mut Self {
        self.body.insert(field.to_string(), value);
        self
    }

    /// Builder-style field insertion
    pub fn field(mut self, field: &str, value: Value) -> Self {
        self.body.insert(field.to_string(), value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.body.remove(field)
    }

    /// Render the full wire document, command name first
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert(self.name.clone(), json!(1));
        for (key, value) in &self.body {
            doc.insert(key.clone(), value.clone());
        }
        doc
    }
}

/// A command error extracted from a shard reply
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code_name)
    }
}

/// A shard's reply document.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardResponse {
    body: Map<String, Value>,
}

impl ShardResponse {
    pub fn new(body: Map<String, Value>) -> Self {
        Self { body }
    }

    /// A plain `{ok: 1}` success reply
    pub fn ok() -> Self {
        let mut body = Map::new();
        body.insert("ok".to_string(), json!(1));
        Self { body }
    }

    /// An `{ok: 0, code, codeName, errmsg}` failure reply
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("ok".to_string(), json!(0));
        body.insert("code".to_string(), json!(code));
        body.insert("codeName".to_string(), json!(code_name_for(code)));
        body.insert("errmsg".to_string(), json!(message.into()));
        Self { body }
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }

    /// Top-level command success
    pub fn is_ok(&self) -> bool {
        match self.body.get("ok") {
            Some(Value::Number(n)) => n.as_f64() == Some(1.0),
            Some(Value::Bool(b)) => *b,
            _ => false,
        }
    }

    /// The top-level command error, if the reply is not ok
    pub fn command_error(&self) -> Option<CommandError> {
        if self.is_ok() {
            return None;
        }
        let code = self
            .body
            .get("code")
            .and_then(Value::as_i64)
            .map(|c| c as i32)
            .unwrap_or(1);
        let code_name = self
            .body
            .get("codeName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| code_name_for(code));
        let message = self
            .body
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Some(CommandError {
            code,
            code_name,
            message,
        })
    }

    /// The write concern error, which can accompany an ok reply
    pub fn write_concern_error(&self) -> Option<CommandError> {
        let wce = self.body.get("writeConcernError")?.as_object()?;
        let code = wce
            .get("code")
            .and_then(Value::as_i64)
            .map(|c| c as i32)
            .unwrap_or(64);
        let code_name = wce
            .get("codeName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| code_name_for(code));
        let message = wce
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Some(CommandError {
            code,
            code_name,
            message,
        })
    }

    /// The per-statement read-only marker participants attach
    pub fn read_only_marker(&self) -> Option<bool> {
        self.body.get(READ_ONLY_FIELD).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn command_classification() {
        assert!(is_transaction_control_command("commitTransaction"));
        assert!(is_transaction_control_command("coordinateCommitTransaction"));
        assert!(!is_transaction_control_command("find"));

        assert!(is_retryable_in_transaction("aggregate"));
        assert!(is_retryable_in_transaction("killCursors"));
        assert!(!is_retryable_in_transaction("insert"));
    }

    #[test]
    fn command_document_puts_name_first() {
        let cmd = ShardCommand::new("find").field("filter", json!({"x": 1}));
        let doc = cmd.to_document();
        let first = doc.keys().next().map(String::as_str);
        assert_eq!(first, Some("find"));
        assert_eq!(doc.get("filter"), Some(&json!({"x": 1})));
    }

    #[test]
    fn response_status_extraction() {
        let ok = ShardResponse::ok();
        assert!(ok.is_ok());
        assert!(ok.command_error().is_none());

        let err = ShardResponse::error(ErrorCode::NoSuchTransaction.as_i32(), "gone");
        assert!(!err.is_ok());
        let status = err.command_error().expect("command error");
        assert_eq!(status.code, 251);
        assert_eq!(status.code_name, "NoSuchTransaction");
    }

    #[test]
    fn write_concern_error_survives_ok_status() {
        let mut body = Map::new();
        body.insert("ok".to_string(), json!(1));
        body.insert(
            "writeConcernError".to_string(),
            json!({"code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting for replication"}),
        );
        let resp = ShardResponse::new(body);
        assert!(resp.is_ok());
        let wce = resp.write_concern_error().expect("wc error");
        assert_eq!(wce.code, 64);
    }

    #[test]
    fn read_concern_document_rendering() {
        let rc = ReadConcernArgs {
            level: Some(ReadConcernLevel::Snapshot),
            after_cluster_time: Some(ClusterTime::new(12)),
        };
        let doc = rc.to_document();
        assert_eq!(doc.get(LEVEL_FIELD), Some(&json!("snapshot")));
        assert_eq!(doc.get(AFTER_CLUSTER_TIME_FIELD), Some(&json!(12)));
        assert!(!rc.is_empty());
        assert!(ReadConcernArgs::default().is_empty());
    }

    #[test]
    fn recovery_token_serialization() {
        let empty = RecoveryToken::default();
        assert!(empty.is_empty());
        assert_eq!(serde_json::to_value(&empty).unwrap(), json!({}));

        let token = RecoveryToken::new(Some(ShardId::new("shard-b")));
        assert_eq!(
            serde_json::to_value(&token).unwrap(),
            json!({"recoveryShardId": "shard-b"})
        );
    }
}
