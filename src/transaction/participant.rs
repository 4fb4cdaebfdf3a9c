//! Per-shard participant state and outbound command decoration
//!
//! A participant exists exactly when the router has committed to sending
//! transaction fields to that shard in the current transaction. The
//! record remembers the shard's role, what the shard has reported about
//! its read/write behavior, the statement that first contacted it, and
//! the options every participant must agree on.

use crate::cluster::ClusterTime;
use crate::protocol::{
    is_transaction_control_command, ReadConcernArgs, ShardCommand, AT_CLUSTER_TIME_FIELD,
    AFTER_CLUSTER_TIME_FIELD, AUTOCOMMIT_FIELD, COORDINATOR_FIELD, READ_CONCERN_FIELD,
    START_TRANSACTION_FIELD, TXN_NUMBER_FIELD,
};
use crate::transaction::{StmtId, TxnNumber};
use serde_json::{json, Value};
use std::fmt;

/// What a participant has reported about its behavior this transaction.
///
/// Transitions out of `Unset` may go either way; after that the state is
/// monotonic for the life of the transaction. A shard that reported a
/// write can never become read-only again, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOnlyStatus {
    /// No successful response has carried a marker yet
    #[default]
    Unset,
    /// Every statement so far only read
    ReadOnly,
    /// At least one statement performed a write
    NotReadOnly,
}

impl ReadOnlyStatus {
    pub fn is_unset(&self) -> bool {
        matches!(self, ReadOnlyStatus::Unset)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, ReadOnlyStatus::ReadOnly)
    }

    pub fn did_write(&self) -> bool {
        matches!(self, ReadOnlyStatus::NotReadOnly)
    }
}

impl fmt::Display for ReadOnlyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadOnlyStatus::Unset => "unset",
            ReadOnlyStatus::ReadOnly => "readOnly",
            ReadOnlyStatus::NotReadOnly => "notReadOnly",
        })
    }
}

/// Options every participant of a transaction shares.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedTransactionOptions {
    pub txn_number: TxnNumber,
    pub read_concern: ReadConcernArgs,
    /// The pinned snapshot, captured at participant creation. Must equal
    /// the router's selected time whenever one is selected.
    pub at_cluster_time: Option<ClusterTime>,
}

/// A shard participating in the current transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// True iff this shard was elected to coordinate two-phase commit
    pub is_coordinator: bool,
    /// Read/write behavior reported by the shard so far
    pub read_only: ReadOnlyStatus,
    /// Statement id current when this shard was first contacted
    pub stmt_id_created_at: StmtId,
    pub shared_options: SharedTransactionOptions,
}

impl Participant {
    pub fn new(
        is_coordinator: bool,
        stmt_id_created_at: StmtId,
        shared_options: SharedTransactionOptions,
    ) -> Self {
        Self {
            is_coordinator,
            read_only: ReadOnlyStatus::Unset,
            stmt_id_created_at,
            shared_options,
        }
    }

    /// Decorate an outgoing command with the transaction envelope.
    ///
    /// The first command sent to a participant must start its local
    /// transaction, unless it is a transaction-control command, which
    /// does not support the options that start transactions
    /// (`startTransaction`, read concern). Any other command must not
    /// carry a read concern of its own.
    pub fn attach_txn_fields(
        &self,
        mut cmd: ShardCommand,
        is_first_command_to_participant: bool,
    ) -> ShardCommand {
        let has_start_txn = cmd.has_field(START_TRANSACTION_FIELD);
        let has_autocommit = cmd.has_field(AUTOCOMMIT_FIELD);
        let has_txn_number = cmd.has_field(TXN_NUMBER_FIELD);

        let must_start_transaction =
            is_first_command_to_participant && !is_transaction_control_command(cmd.name());

        if must_start_transaction {
            self.append_read_concern(&mut cmd);
            if !has_start_txn {
                cmd.set(START_TRANSACTION_FIELD, json!(true));
            }
        } else {
            debug_assert!(
                !cmd.has_field(READ_CONCERN_FIELD),
                "only a participant's first command may carry a read concern"
            );
        }

        if self.is_coordinator {
            cmd.set(COORDINATOR_FIELD, json!(true));
        }

        if !has_autocommit {
            cmd.set(AUTOCOMMIT_FIELD, json!(false));
        }

        if !has_txn_number {
            cmd.set(TXN_NUMBER_FIELD, json!(self.shared_options.txn_number));
        } else {
            let existing = cmd.get(TXN_NUMBER_FIELD).and_then(Value::as_i64);
            assert_eq!(
                existing,
                Some(self.shared_options.txn_number),
                "command carries a different transaction number than the session"
            );
        }

        cmd
    }

    /// Attach the transaction's read concern, pinning the snapshot time
    /// and dropping any client `afterClusterTime` (the two are mutually
    /// exclusive on the wire).
    fn append_read_concern(&self, cmd: &mut ShardCommand) {
        if let Some(existing) = cmd.get(READ_CONCERN_FIELD).cloned() {
            // The first statement of a transaction may carry its own read
            // concern; its level always matches the transaction's.
            debug_assert_eq!(
                existing
                    .as_object()
                    .and_then(|doc| doc.get("level"))
                    .and_then(Value::as_str),
                self.shared_options
                    .read_concern
                    .level
                    .map(|level| level.as_str()),
                "statement read concern level diverged from the transaction's"
            );
            if let Some(at_cluster_time) = self.shared_options.at_cluster_time {
                let mut doc = existing.as_object().cloned().unwrap_or_default();
                doc.remove(AFTER_CLUSTER_TIME_FIELD);
                doc.insert(
                    AT_CLUSTER_TIME_FIELD.to_string(),
                    json!(at_cluster_time.as_u64()),
                );
                cmd.set(READ_CONCERN_FIELD, Value::Object(doc));
            }
            return;
        }

        if self.shared_options.read_concern.is_empty() {
            return;
        }

        let mut doc = self.shared_options.read_concern.to_document();
        if let Some(at_cluster_time) = self.shared_options.at_cluster_time {
            doc.remove(AFTER_CLUSTER_TIME_FIELD);
            doc.insert(
                AT_CLUSTER_TIME_FIELD.to_string(),
                json!(at_cluster_time.as_u64()),
            );
        }
        cmd.set(READ_CONCERN_FIELD, Value::Object(doc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReadConcernLevel;

    fn snapshot_options(at: Option<u64>) -> SharedTransactionOptions {
        SharedTransactionOptions {
            txn_number: 5,
            read_concern: ReadConcernArgs::snapshot(),
            at_cluster_time: at.map(ClusterTime::new),
        }
    }

    #[test]
    fn first_command_starts_the_participant_transaction() {
        let participant = Participant::new(false, 0, snapshot_options(Some(30)));
        let cmd = participant.attach_txn_fields(ShardCommand::new("find"), true);

        assert_eq!(cmd.get(START_TRANSACTION_FIELD), Some(&json!(true)));
        assert_eq!(cmd.get(AUTOCOMMIT_FIELD), Some(&json!(false)));
        assert_eq!(cmd.get(TXN_NUMBER_FIELD), Some(&json!(5)));
        assert_eq!(
            cmd.get(READ_CONCERN_FIELD),
            Some(&json!({"level": "snapshot", "atClusterTime": 30}))
        );
        assert_eq!(cmd.get(COORDINATOR_FIELD), None);
    }

    #[test]
    fn later_commands_only_carry_the_envelope() {
        let participant = Participant::new(false, 0, snapshot_options(Some(30)));
        let cmd = participant.attach_txn_fields(ShardCommand::new("find"), false);

        assert_eq!(cmd.get(START_TRANSACTION_FIELD), None);
        assert_eq!(cmd.get(READ_CONCERN_FIELD), None);
        assert_eq!(cmd.get(AUTOCOMMIT_FIELD), Some(&json!(false)));
        assert_eq!(cmd.get(TXN_NUMBER_FIELD), Some(&json!(5)));
    }

    #[test]
    fn control_commands_never_start_a_transaction() {
        let participant = Participant::new(true, 0, snapshot_options(Some(30)));
        let cmd = participant.attach_txn_fields(ShardCommand::new("commitTransaction"), true);

        assert_eq!(cmd.get(START_TRANSACTION_FIELD), None);
        assert_eq!(cmd.get(READ_CONCERN_FIELD), None);
        assert_eq!(cmd.get(COORDINATOR_FIELD), Some(&json!(true)));
    }

    #[test]
    fn pinned_snapshot_overrides_after_cluster_time() {
        let options = SharedTransactionOptions {
            txn_number: 5,
            read_concern: ReadConcernArgs {
                level: Some(ReadConcernLevel::Snapshot),
                after_cluster_time: Some(ClusterTime::new(10)),
            },
            at_cluster_time: Some(ClusterTime::new(44)),
        };
        let participant = Participant::new(false, 0, options);
        let cmd = participant.attach_txn_fields(ShardCommand::new("find"), true);

        assert_eq!(
            cmd.get(READ_CONCERN_FIELD),
            Some(&json!({"level": "snapshot", "atClusterTime": 44}))
        );
    }

    #[test]
    fn statement_supplied_read_concern_is_rewritten_in_place() {
        let participant = Participant::new(false, 0, snapshot_options(Some(30)));
        let cmd = ShardCommand::new("find").field(
            READ_CONCERN_FIELD,
            json!({"level": "snapshot", "afterClusterTime": 12}),
        );
        let decorated = participant.attach_txn_fields(cmd, true);

        assert_eq!(
            decorated.get(READ_CONCERN_FIELD),
            Some(&json!({"level": "snapshot", "atClusterTime": 30}))
        );
    }

    #[test]
    fn non_snapshot_transactions_attach_plain_read_concern() {
        let options = SharedTransactionOptions {
            txn_number: 7,
            read_concern: ReadConcernArgs::with_level(ReadConcernLevel::Majority),
            at_cluster_time: None,
        };
        let participant = Participant::new(false, 0, options);
        let cmd = participant.attach_txn_fields(ShardCommand::new("distinct"), true);

        assert_eq!(
            cmd.get(READ_CONCERN_FIELD),
            Some(&json!({"level": "majority"}))
        );
    }
}
