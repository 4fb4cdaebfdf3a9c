//! Diagnostics for live transactions
//!
//! Two consumers share the same state walk: monitoring scans pull a
//! structured document through [`TransactionRouter::report_state`], and
//! transactions that outlive the configured slow threshold are logged as
//! a structured event when their lifecycle ends.

use crate::transaction::commit::CommitType;
use crate::transaction::router::{RouterState, TerminationCause, TransactionRouter};
use crate::transaction::timing::Tick;
use crate::transaction::UNINITIALIZED_TXN_NUMBER;
use serde_json::{json, Map, Value};
use tracing::info;

impl TransactionRouter {
    /// Structured dump of the router's state for monitoring.
    ///
    /// Returns `None` until the router has seen its first transaction.
    pub fn report_state(&self, session_is_active: bool) -> Option<Value> {
        let state = self.state.read();
        if state.txn_number == UNINITIALIZED_TXN_NUMBER {
            return None;
        }

        let current = self.env.tick_source.ticks();
        let timing = &state.timing_stats;

        let mut doc = Map::new();
        doc.insert(
            "type".to_string(),
            json!(if session_is_active { "activeSession" } else { "idleSession" }),
        );
        doc.insert(
            "desc".to_string(),
            json!(if session_is_active { "active transaction" } else { "inactive transaction" }),
        );
        doc.insert("client".to_string(), json!(state.last_client_info.host));
        doc.insert(
            "connectionId".to_string(),
            json!(state.last_client_info.connection_id),
        );
        doc.insert("appName".to_string(), json!(state.last_client_info.app_name));
        doc.insert("sessionId".to_string(), json!(self.session_id));

        let mut parameters = Map::new();
        parameters.insert("txnNumber".to_string(), json!(state.txn_number));
        parameters.insert("autocommit".to_string(), json!(false));
        if !state.read_concern.is_empty() {
            parameters.insert(
                "readConcern".to_string(),
                Value::Object(state.read_concern.to_document()),
            );
        }

        let mut transaction = Map::new();
        transaction.insert("parameters".to_string(), Value::Object(parameters));

        if let Some(global_read_timestamp) = state.selected_at_cluster_time() {
            doc.insert(
                "globalReadTimestamp".to_string(),
                json!(global_read_timestamp.as_u64()),
            );
        }
        if let Some(start) = timing.start_wall_clock {
            doc.insert("startWallClockTime".to_string(), json!(start.to_rfc3339()));
        }
        doc.insert(
            "timeOpenMicros".to_string(),
            json!(timing.duration(current).as_micros() as u64),
        );
        doc.insert(
            "timeActiveMicros".to_string(),
            json!(timing.time_active(current).as_micros() as u64),
        );
        doc.insert(
            "timeInactiveMicros".to_string(),
            json!(timing.time_inactive(current).as_micros() as u64),
        );

        let mut num_read_only = 0;
        let mut num_non_read_only = 0;

        // The participant list is unknown while recovering a commit.
        if state.commit_type != CommitType::RecoverWithToken {
            doc.insert("numParticipants".to_string(), json!(state.participants.len()));

            let mut participants = Vec::new();
            for (shard, participant) in &state.participants {
                let mut entry = Map::new();
                entry.insert("name".to_string(), json!(shard));
                entry.insert("coordinator".to_string(), json!(participant.is_coordinator));
                if participant.read_only.is_read_only() {
                    entry.insert("readOnly".to_string(), json!(true));
                    num_read_only += 1;
                } else if participant.read_only.did_write() {
                    entry.insert("readOnly".to_string(), json!(false));
                    num_non_read_only += 1;
                }
                participants.push(Value::Object(entry));
            }
            transaction.insert("participants".to_string(), Value::Array(participants));
        }

        if state.commit_type.is_initiated() {
            if let Some(commit_start) = timing.commit_start_wall_clock {
                transaction.insert(
                    "commitStartWallClockTime".to_string(),
                    json!(commit_start.to_rfc3339()),
                );
            }
            transaction.insert("commitType".to_string(), json!(state.commit_type.as_str()));
        }

        transaction.insert("numReadOnlyParticipants".to_string(), json!(num_read_only));
        transaction.insert(
            "numNonReadOnlyParticipants".to_string(),
            json!(num_non_read_only),
        );

        doc.insert("transaction".to_string(), Value::Object(transaction));
        doc.insert("active".to_string(), json!(session_is_active));

        Some(Value::Object(doc))
    }

    /// Emit the end-of-life summary for a transaction that exceeded the
    /// slow threshold.
    pub(crate) fn log_slow_transaction(
        &self,
        state: &RouterState,
        cause: TerminationCause,
        current: Tick,
    ) {
        let timing = &state.timing_stats;

        let termination_cause = match cause {
            TerminationCause::Committed => "committed",
            TerminationCause::Aborted => "aborted",
        };
        let abort_cause =
            (!state.abort_cause.is_empty()).then(|| state.abort_cause.clone());
        let commit_type = state
            .commit_type
            .is_initiated()
            .then(|| state.commit_type.as_str());
        let commit_duration_micros = state
            .commit_type
            .is_initiated()
            .then(|| timing.commit_duration(current).as_micros() as u64);
        let coordinator = (state.commit_type == CommitType::TwoPhaseCommit)
            .then(|| state.coordinator_id.clone())
            .flatten();
        let num_participants = (state.commit_type != CommitType::RecoverWithToken)
            .then(|| state.participants.len());
        let global_read_timestamp =
            state.selected_at_cluster_time().map(|time| time.as_u64());

        info!(
            target: "shardline::transaction",
            session_id = %self.session_id,
            txn_number = state.txn_number,
            read_concern = ?state.read_concern,
            global_read_timestamp,
            num_participants,
            coordinator = ?coordinator,
            termination_cause,
            abort_cause = ?abort_cause,
            commit_type = ?commit_type,
            commit_duration_micros,
            time_active_micros = timing.time_active(current).as_micros() as u64,
            time_inactive_micros = timing.time_inactive(current).as_micros() as u64,
            duration_millis = timing.duration(current).as_millis() as u64,
            "Slow transaction"
        );
    }
}
