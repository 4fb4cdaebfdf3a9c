//! Commit protocols
//!
//! Four direct commit variants plus the two-phase hand-off and
//! recovery-by-token. Protocol selection is a pure function of the
//! participant census; all I/O happens after the choice is made and
//! recorded.

use crate::cluster::ShardId;
use crate::error::{
    is_exceeded_time_limit_code, is_retryable_write_code, ErrorCode, Result, RouterError,
};
use crate::protocol::{
    ShardCommand, ShardResponse, WriteConcern, COMMIT_TRANSACTION_CMD, COORDINATE_COMMIT_CMD,
    PARTICIPANTS_FIELD, WRITE_CONCERN_FIELD,
};
use serde_json::{json, Value};
use std::fmt;

/// The commit protocol chosen for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitType {
    /// Commit has not been initiated
    #[default]
    NotInitiated,
    /// The transaction never targeted a shard
    NoShards,
    /// Exactly one participant; commit it directly
    SingleShard,
    /// Several participants, exactly one of which wrote
    SingleWriteShard,
    /// Several participants, all read-only
    ReadOnly,
    /// Two or more write participants; the coordinator decides
    TwoPhaseCommit,
    /// Outcome recovered from the recovery shard via a client token
    RecoverWithToken,
}

impl CommitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitType::NotInitiated => "notInitiated",
            CommitType::NoShards => "noShards",
            CommitType::SingleShard => "singleShard",
            CommitType::SingleWriteShard => "singleWriteShard",
            CommitType::ReadOnly => "readOnly",
            CommitType::TwoPhaseCommit => "twoPhaseCommit",
            CommitType::RecoverWithToken => "recoverWithToken",
        }
    }

    pub fn is_initiated(&self) -> bool {
        !matches!(self, CommitType::NotInitiated)
    }

    /// After these protocols the decision belongs to a shard, so the
    /// router must not implicitly abort.
    pub fn decision_handed_off(&self) -> bool {
        matches!(self, CommitType::TwoPhaseCommit | CommitType::RecoverWithToken)
    }
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the commit protocol from the participant census.
pub(crate) fn select_commit_type(
    is_recovering_commit: bool,
    participant_count: usize,
    write_count: usize,
) -> CommitType {
    match (is_recovering_commit, participant_count, write_count) {
        (true, _, _) => CommitType::RecoverWithToken,
        (false, 0, _) => CommitType::NoShards,
        (false, 1, _) => CommitType::SingleShard,
        (false, _, 0) => CommitType::ReadOnly,
        (false, _, 1) => CommitType::SingleWriteShard,
        (false, _, _) => CommitType::TwoPhaseCommit,
    }
}

/// A commit result is unknown when the client may retry the commit and
/// learn the real outcome: retryable-write errors, exceeded time limits,
/// `TransactionTooOld` (the command cannot have done meaningful work),
/// and write-concern failures on an otherwise ok reply.
pub(crate) fn is_commit_result_unknown(response: &ShardResponse) -> bool {
    if let Some(error) = response.command_error() {
        return is_retryable_write_code(error.code)
            || is_exceeded_time_limit_code(error.code)
            || error.code == ErrorCode::TransactionTooOld.as_i32();
    }
    response.write_concern_error().is_some()
}

/// `commitTransaction` carrying the operation's write concern.
pub(crate) fn commit_command(write_concern: &WriteConcern) -> ShardCommand {
    ShardCommand::new(COMMIT_TRANSACTION_CMD).field(
        WRITE_CONCERN_FIELD,
        Value::Object(write_concern.to_document()),
    )
}

/// `coordinateCommitTransaction` with an explicit participant list. An
/// empty list asks the recovery shard for an already-decided outcome.
pub(crate) fn coordinate_commit_command(
    participants: &[ShardId],
    write_concern: &WriteConcern,
) -> ShardCommand {
    let list: Vec<Value> = participants
        .iter()
        .map(|shard| json!({ "shardId": shard }))
        .collect();
    ShardCommand::new(COORDINATE_COMMIT_CMD)
        .field(PARTICIPANTS_FIELD, Value::Array(list))
        .field(
            WRITE_CONCERN_FIELD,
            Value::Object(write_concern.to_document()),
        )
}

/// Reduce a fan-out to one reply: the first command or write-concern
/// error if any shard produced one, otherwise the last response. A
/// transport failure on any shard fails the whole fan-out.
pub(crate) fn first_error_or_last(
    responses: Vec<(ShardId, Result<ShardResponse>)>,
) -> Result<ShardResponse> {
    let mut last = None;
    for (_, result) in responses {
        let response = result?;
        if !response.is_ok() || response.write_concern_error().is_some() {
            return Ok(response);
        }
        last = Some(response);
    }
    last.ok_or_else(|| RouterError::IllegalOperation("direct commit targeted no shards".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn selection_table() {
        assert_eq!(select_commit_type(true, 0, 0), CommitType::RecoverWithToken);
        assert_eq!(select_commit_type(false, 0, 0), CommitType::NoShards);
        assert_eq!(select_commit_type(false, 1, 0), CommitType::SingleShard);
        assert_eq!(select_commit_type(false, 1, 1), CommitType::SingleShard);
        assert_eq!(select_commit_type(false, 3, 0), CommitType::ReadOnly);
        assert_eq!(select_commit_type(false, 3, 1), CommitType::SingleWriteShard);
        assert_eq!(select_commit_type(false, 3, 2), CommitType::TwoPhaseCommit);
    }

    #[test]
    fn unknown_result_classification() {
        assert!(is_commit_result_unknown(&ShardResponse::error(
            ErrorCode::HostUnreachable.as_i32(),
            "down"
        )));
        assert!(is_commit_result_unknown(&ShardResponse::error(
            ErrorCode::MaxTimeExpired.as_i32(),
            "too slow"
        )));
        assert!(is_commit_result_unknown(&ShardResponse::error(
            ErrorCode::TransactionTooOld.as_i32(),
            "old"
        )));
        assert!(!is_commit_result_unknown(&ShardResponse::error(
            ErrorCode::NoSuchTransaction.as_i32(),
            "gone"
        )));
        assert!(!is_commit_result_unknown(&ShardResponse::ok()));

        let mut body = Map::new();
        body.insert("ok".to_string(), json!(1));
        body.insert(
            "writeConcernError".to_string(),
            json!({"code": 64, "errmsg": "replication lag"}),
        );
        assert!(is_commit_result_unknown(&ShardResponse::new(body)));
    }

    #[test]
    fn fan_out_reduction_returns_first_error() {
        let mut err_body = Map::new();
        err_body.insert("ok".to_string(), json!(0));
        err_body.insert("code".to_string(), json!(ErrorCode::NoSuchTransaction.as_i32()));
        let responses = vec![
            (ShardId::new("shard-a"), Ok(ShardResponse::ok())),
            (ShardId::new("shard-b"), Ok(ShardResponse::new(err_body))),
            (ShardId::new("shard-c"), Ok(ShardResponse::ok())),
        ];

        let reduced = first_error_or_last(responses).expect("no transport failure");
        let error = reduced.command_error().expect("error reply");
        assert_eq!(error.code, ErrorCode::NoSuchTransaction.as_i32());
    }

    #[test]
    fn fan_out_reduction_returns_last_ok() {
        let responses = vec![
            (ShardId::new("shard-a"), Ok(ShardResponse::ok())),
            (ShardId::new("shard-b"), Ok(ShardResponse::ok())),
        ];
        let reduced = first_error_or_last(responses).expect("no transport failure");
        assert!(reduced.is_ok());
    }

    #[test]
    fn fan_out_reduction_propagates_transport_failure() {
        let responses = vec![
            (ShardId::new("shard-a"), Ok(ShardResponse::ok())),
            (
                ShardId::new("shard-b"),
                Err(RouterError::transport(ShardId::new("shard-b"), "reset")),
            ),
        ];
        assert!(first_error_or_last(responses).is_err());
    }

    #[test]
    fn commit_command_carries_write_concern() {
        let cmd = commit_command(&WriteConcern::default());
        assert_eq!(cmd.name(), COMMIT_TRANSACTION_CMD);
        assert_eq!(cmd.get(WRITE_CONCERN_FIELD), Some(&json!({"w": "majority"})));
    }

    #[test]
    fn coordinate_commit_carries_participant_list() {
        let cmd = coordinate_commit_command(
            &[ShardId::new("shard-a"), ShardId::new("shard-b")],
            &WriteConcern::default(),
        );
        assert_eq!(cmd.name(), COORDINATE_COMMIT_CMD);
        assert_eq!(
            cmd.get(PARTICIPANTS_FIELD),
            Some(&json!([
                {"shardId": "shard-a"},
                {"shardId": "shard-b"}
            ]))
        );
    }
}
