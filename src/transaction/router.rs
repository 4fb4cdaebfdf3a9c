//! Per-session transaction router state machine
//!
//! One [`TransactionRouter`] lives in each session and turns that
//! session's statement stream into a multi-shard transaction: it
//! arbitrates transaction numbers, freezes the read concern and snapshot
//! timestamp, tracks which shards were contacted and whether they wrote,
//! retries statements where that cannot violate isolation, and drives
//! commit or abort to completion.
//!
//! # Locking
//!
//! All shared state lives in one [`RouterState`] behind a `RwLock`. The
//! operation a session is checked out to takes short write-lock sections;
//! monitoring reads a consistent snapshot through [`TransactionRouter::observe`].
//! The lock is never held across a shard round-trip.

use crate::cluster::{LogicalClock, ShardId};
use crate::config::RouterConfig;
use crate::error::{ErrorCode, Result, RouterError};
use crate::metrics::RouterTransactionsMetrics;
use crate::operation::{ClientInfo, OperationContext, TransactionAction};
use crate::protocol::{
    CommandError, ReadConcernArgs, ReadConcernLevel, RecoveryToken, ShardCommand, ShardResponse,
    ABORT_TRANSACTION_CMD, RECOVERY_TOKEN_FIELD, WRITE_CONCERN_FIELD,
};
use crate::session::SessionId;
use crate::transaction::at_cluster_time::AtClusterTime;
use crate::transaction::commit::{self, CommitType};
use crate::transaction::participant::{Participant, ReadOnlyStatus, SharedTransactionOptions};
use crate::transaction::timing::{SystemTickSource, TickSource, TimingStats};
use crate::transaction::{StmtId, TxnNumber, UNINITIALIZED_TXN_NUMBER};
use crate::transport::{scatter_gather, ShardTransport};
use parking_lot::{RwLock, RwLockReadGuard};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Collaborators shared by every router in the process.
pub struct RouterEnv {
    pub config: RouterConfig,
    pub clock: Arc<dyn LogicalClock>,
    pub transport: Arc<dyn ShardTransport>,
    pub tick_source: Arc<dyn TickSource>,
    pub metrics: Arc<RouterTransactionsMetrics>,
}

impl RouterEnv {
    pub fn new(
        config: RouterConfig,
        clock: Arc<dyn LogicalClock>,
        transport: Arc<dyn ShardTransport>,
    ) -> Self {
        Self {
            config,
            clock,
            transport,
            tick_source: Arc::new(SystemTickSource::new()),
            metrics: Arc::new(RouterTransactionsMetrics::new()),
        }
    }
}

impl std::fmt::Debug for RouterEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterEnv")
            .field("config", &self.config)
            .finish()
    }
}

/// How a tracked transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationCause {
    Committed,
    Aborted,
}

/// All per-session router state, mutated under the session's lock.
#[derive(Debug)]
pub struct RouterState {
    /// Monotonically non-decreasing transaction number for the session
    pub(crate) txn_number: TxnNumber,
    /// Read concern frozen by the transaction's first statement
    pub(crate) read_concern: ReadConcernArgs,
    /// Snapshot timestamp holder; present iff read concern is snapshot
    pub(crate) at_cluster_time: Option<AtClusterTime>,
    /// Shards contacted this transaction, ordered by shard id
    pub(crate) participants: BTreeMap<ShardId, Participant>,
    /// First participant added; runs two-phase commit if needed
    pub(crate) coordinator_id: Option<ShardId>,
    /// First participant observed to have written
    pub(crate) recovery_shard_id: Option<ShardId>,
    pub(crate) commit_type: CommitType,
    /// True iff the first action seen for this transaction was a commit
    pub(crate) is_recovering_commit: bool,
    /// Set once commit or abort is dispatched; freezes participant state
    pub(crate) termination_initiated: bool,
    pub(crate) first_stmt_id: StmtId,
    pub(crate) latest_stmt_id: StmtId,
    /// First abort signal's code string, empty until one is seen
    pub(crate) abort_cause: String,
    pub(crate) timing_stats: TimingStats,
    pub(crate) last_client_info: ClientInfo,
}

impl Default for RouterState {
    fn default() -> Self {
        Self {
            txn_number: UNINITIALIZED_TXN_NUMBER,
            read_concern: ReadConcernArgs::default(),
            at_cluster_time: None,
            participants: BTreeMap::new(),
            coordinator_id: None,
            recovery_shard_id: None,
            commit_type: CommitType::NotInitiated,
            is_recovering_commit: false,
            termination_initiated: false,
            first_stmt_id: 0,
            latest_stmt_id: 0,
            abort_cause: String::new(),
            timing_stats: TimingStats::default(),
            last_client_info: ClientInfo::default(),
        }
    }
}

impl RouterState {
    pub fn txn_number(&self) -> TxnNumber {
        self.txn_number
    }

    pub fn commit_type(&self) -> CommitType {
        self.commit_type
    }

    pub fn coordinator_id(&self) -> Option<&ShardId> {
        self.coordinator_id.as_ref()
    }

    pub fn recovery_shard_id(&self) -> Option<&ShardId> {
        self.recovery_shard_id.as_ref()
    }

    pub fn participant_ids(&self) -> Vec<ShardId> {
        self.participants.keys().cloned().collect()
    }

    pub fn participant(&self, shard: &ShardId) -> Option<&Participant> {
        self.participants.get(shard)
    }

    pub fn is_recovering_commit(&self) -> bool {
        self.is_recovering_commit
    }

    pub fn latest_stmt_id(&self) -> StmtId {
        self.latest_stmt_id
    }

    /// The pinned snapshot timestamp, if one has been selected.
    pub fn selected_at_cluster_time(&self) -> Option<crate::cluster::ClusterTime> {
        self.at_cluster_time.as_ref().and_then(AtClusterTime::time)
    }

    /// Whether this transaction reads at a global snapshot.
    pub fn must_use_at_cluster_time(&self) -> bool {
        self.at_cluster_time.is_some()
    }

    fn pending_participants(&self) -> Vec<ShardId> {
        self.participants
            .iter()
            .filter(|(_, p)| p.stmt_id_created_at == self.latest_stmt_id)
            .map(|(shard, _)| shard.clone())
            .collect()
    }
}

/// The per-session router.
pub struct TransactionRouter {
    pub(crate) session_id: SessionId,
    pub(crate) env: Arc<RouterEnv>,
    pub(crate) state: RwLock<RouterState>,
}

impl TransactionRouter {
    pub fn new(session_id: SessionId, env: Arc<RouterEnv>) -> Self {
        Self {
            session_id,
            env,
            state: RwLock::new(RouterState::default()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Read-only view of the router state for monitoring. Writers block
    /// while the guard is held, so keep it short.
    pub fn observe(&self) -> RwLockReadGuard<'_, RouterState> {
        self.state.read()
    }

    fn txn_id(&self, state: &RouterState) -> String {
        format!("{}:{}", self.session_id, state.txn_number)
    }

    /// Arbitrate a statement's transaction number against the session's.
    ///
    /// Decides whether the statement starts a new transaction, continues
    /// the one in progress, or begins commit recovery, and fails the
    /// client-protocol violations (`TransactionTooOld`,
    /// `ConflictingOperationInProgress`, `NoSuchTransaction`).
    pub fn begin_or_continue(
        &self,
        ctx: &mut OperationContext,
        txn_number: TxnNumber,
        action: TransactionAction,
    ) -> Result<()> {
        let mut state = self.state.write();

        if txn_number < state.txn_number {
            return Err(RouterError::TransactionTooOld(format!(
                "txnNumber {txn_number} is less than last txnNumber {} seen in session {}",
                state.txn_number, self.session_id
            )));
        }

        if txn_number == state.txn_number {
            match action {
                TransactionAction::Start => {
                    return Err(RouterError::ConflictingOperationInProgress(format!(
                        "txnNumber {} for session {} already started",
                        state.txn_number, self.session_id
                    )));
                }
                TransactionAction::Continue => {
                    if !ctx.read_concern.is_empty() {
                        return Err(RouterError::InvalidOptions(
                            "only the first command in a transaction may specify a readConcern"
                                .to_string(),
                        ));
                    }
                    ctx.read_concern = state.read_concern.clone();
                    state.latest_stmt_id += 1;
                    self.on_continue(&mut state);
                }
                TransactionAction::Commit => {
                    state.latest_stmt_id += 1;
                    self.on_continue(&mut state);
                }
            }
        } else {
            match action {
                TransactionAction::Start => {
                    if !ctx.read_concern.level_allowed_in_transaction() {
                        return Err(RouterError::InvalidOptions(
                            "the first command in a transaction cannot specify a readConcern \
                             level other than local, majority, or snapshot"
                                .to_string(),
                        ));
                    }

                    self.reset_router_state(&mut state, txn_number);
                    state.read_concern = ctx.read_concern.clone();
                    if state.read_concern.level == Some(ReadConcernLevel::Snapshot) {
                        state.at_cluster_time = Some(AtClusterTime::new());
                    }

                    self.env.metrics.increment_total_started();
                    debug!(txn = %self.txn_id(&state), "New transaction started");
                }
                TransactionAction::Continue => {
                    return Err(RouterError::NoSuchTransaction(format!(
                        "cannot continue txnId {} for session {} with txnId {txn_number}",
                        state.txn_number, self.session_id
                    )));
                }
                TransactionAction::Commit => {
                    self.reset_router_state(&mut state, txn_number);
                    // The first action seen for this transaction is a
                    // commit: the client is recovering a commit decision.
                    state.is_recovering_commit = true;

                    self.env.metrics.increment_total_started();
                    debug!(txn = %self.txn_id(&state), "Commit recovery started");
                }
            }
        }

        state.last_client_info = ctx.client.clone();
        Ok(())
    }

    /// Select the transaction's snapshot timestamp for the current
    /// statement: `max(cluster time, client afterClusterTime)`. No-op for
    /// non-snapshot transactions or once the timestamp is frozen.
    pub fn set_default_at_cluster_time(&self, ctx: &OperationContext) {
        let mut state = self.state.write();
        let stmt_id = state.latest_stmt_id;
        let txn = self.txn_id(&state);

        let candidate = self.env.clock.cluster_time();
        let after_cluster_time = ctx.read_concern.after_cluster_time;

        let Some(holder) = state.at_cluster_time.as_mut() else {
            return;
        };
        if !holder.can_change(stmt_id) {
            return;
        }

        let chosen = match after_cluster_time {
            Some(after) if after > candidate => after,
            _ => candidate,
        };

        debug!(
            txn = %txn,
            time = %chosen,
            stmt_id,
            "Setting global snapshot timestamp"
        );
        holder.set_time(chosen, stmt_id);
    }

    /// Decorate an outgoing command for a shard, creating the participant
    /// on first contact. The first participant becomes the coordinator.
    pub fn attach_txn_fields_if_needed(
        &self,
        shard_id: &ShardId,
        cmd: ShardCommand,
    ) -> Result<ShardCommand> {
        self.env.metrics.increment_total_requests_targeted();

        let mut state = self.state.write();

        if let Some(participant) = Self::get_participant(&state, shard_id) {
            debug!(
                txn = %self.txn_id(&state),
                shard = %shard_id,
                "Sending transaction fields to existing participant"
            );
            return Ok(participant.attach_txn_fields(cmd, false));
        }

        let participant = Self::create_participant(&mut state, shard_id);
        let decorated = participant.attach_txn_fields(cmd, true);
        debug!(
            txn = %self.txn_id(&state),
            shard = %shard_id,
            "Sending transaction fields to new participant"
        );
        if !state.is_recovering_commit {
            // The participant list is unknown during recovery, so its
            // stats are not meaningful there.
            self.env.metrics.increment_total_contacted_participants();
        }
        Ok(decorated)
    }

    /// Look up a participant, checking that it carries the transaction's
    /// pinned snapshot whenever one is selected.
    fn get_participant<'a>(state: &'a RouterState, shard_id: &ShardId) -> Option<&'a Participant> {
        let participant = state.participants.get(shard_id)?;
        if let Some(selected) = state.selected_at_cluster_time() {
            assert_eq!(
                participant.shared_options.at_cluster_time,
                Some(selected),
                "participant {shard_id} does not carry the transaction's snapshot timestamp"
            );
        }
        Some(participant)
    }

    fn create_participant<'a>(
        state: &'a mut RouterState,
        shard_id: &ShardId,
    ) -> &'a Participant {
        // The first participant is chosen as the coordinator.
        let is_first_participant = state.participants.is_empty();
        if is_first_participant {
            debug_assert!(state.coordinator_id.is_none());
            state.coordinator_id = Some(shard_id.clone());
        }

        let shared_options = SharedTransactionOptions {
            txn_number: state.txn_number,
            read_concern: state.read_concern.clone(),
            at_cluster_time: state.selected_at_cluster_time(),
        };

        let stmt_id = state.latest_stmt_id;
        state
            .participants
            .entry(shard_id.clone())
            .or_insert_with(|| Participant::new(is_first_participant, stmt_id, shared_options))
    }

    /// Fold a participant's reply into the router's read-only tracking.
    ///
    /// Ignored entirely once termination has been initiated, and when the
    /// reply is a command failure (the caller handles the error; the
    /// participant's state is left untouched).
    pub fn process_participant_response(
        &self,
        shard_id: &ShardId,
        response: &ShardResponse,
    ) -> Result<()> {
        let mut state = self.state.write();

        if state.termination_initiated {
            // Participant state is partially reset by commit and abort.
            return Ok(());
        }

        let Some(participant) = Self::get_participant(&state, shard_id) else {
            return Err(RouterError::IllegalOperation(format!(
                "processing response from {shard_id}, which is not a participant"
            )));
        };

        if !response.is_ok() {
            return Ok(());
        }

        if participant.stmt_id_created_at != state.latest_stmt_id
            && participant.read_only.is_unset()
        {
            return Err(RouterError::ParticipantContract {
                code: ErrorCode::ReadOnlyMarkerMissing,
                message: format!(
                    "readOnly field for participant {shard_id} should have been set on the \
                     participant's first successful response"
                ),
            });
        }

        let current = participant.read_only;
        match response.read_only_marker() {
            Some(true) => match current {
                ReadOnlyStatus::Unset => {
                    debug!(
                        txn = %self.txn_id(&state),
                        shard = %shard_id,
                        "Marking participant as read-only"
                    );
                    Self::set_read_only(&mut state, shard_id, ReadOnlyStatus::ReadOnly);
                }
                ReadOnlyStatus::ReadOnly => {}
                ReadOnlyStatus::NotReadOnly => {
                    return Err(RouterError::ParticipantContract {
                        code: ErrorCode::ReadOnlyAfterWrite,
                        message: format!(
                            "participant shard {shard_id} claimed to be read-only for a \
                             transaction after previously claiming to have done a write"
                        ),
                    });
                }
            },
            Some(false) => {
                if !current.did_write() {
                    debug!(
                        txn = %self.txn_id(&state),
                        shard = %shard_id,
                        "Marking participant as having done a write"
                    );
                    Self::set_read_only(&mut state, shard_id, ReadOnlyStatus::NotReadOnly);

                    if state.recovery_shard_id.is_none() {
                        debug!(
                            txn = %self.txn_id(&state),
                            shard = %shard_id,
                            "Choosing recovery shard"
                        );
                        state.recovery_shard_id = Some(shard_id.clone());
                    }
                }
            }
            None => {}
        }

        Ok(())
    }

    fn set_read_only(state: &mut RouterState, shard_id: &ShardId, read_only: ReadOnlyStatus) {
        debug_assert!(!read_only.is_unset());
        if let Some(participant) = state.participants.get_mut(shard_id) {
            participant.read_only = read_only;
        }
    }

    /// Whether the current statement may be silently retried after a
    /// stale shard or stale database routing error.
    pub fn can_continue_on_stale_shard_or_db_error(&self, cmd_name: &str) -> bool {
        if !self.env.config.enable_stale_version_and_snapshot_retries {
            return false;
        }

        let state = self.state.read();

        // The first overall statement can always be retried: every
        // targeted participant must be pending, so the retry restarts the
        // local transaction on each one.
        if state.latest_stmt_id == state.first_stmt_id {
            return true;
        }

        // Later statements may target non-pending participants, which
        // would re-apply a non-idempotent operation on retry.
        crate::protocol::is_retryable_in_transaction(cmd_name)
    }

    /// Retry a statement after a stale routing error by clearing the
    /// participants it created.
    pub async fn on_stale_shard_or_db_error(
        &self,
        cmd_name: &str,
        error: &RouterError,
    ) -> Result<()> {
        debug_assert!(self.can_continue_on_stale_shard_or_db_error(cmd_name));
        debug!(
            error = %error,
            "Clearing pending participants after stale version error"
        );
        self.clear_pending_participants().await
    }

    /// Retry after a view resolution error. Always allowed: the retry on
    /// the resolved namespace does not have to re-target the same shards.
    pub async fn on_view_resolution_error(&self, namespace: &str) -> Result<()> {
        debug!(
            namespace,
            "Clearing pending participants after view resolution error"
        );
        self.clear_pending_participants().await
    }

    /// Whether the current statement may be retried after a shard
    /// reported the snapshot timestamp unavailable.
    pub fn can_continue_on_snapshot_error(&self) -> bool {
        if !self.env.config.enable_stale_version_and_snapshot_retries {
            return false;
        }

        let state = self.state.read();
        state
            .at_cluster_time
            .as_ref()
            .is_some_and(|holder| holder.can_change(state.latest_stmt_id))
    }

    /// Retry after a snapshot error: all participants restart against a
    /// freshly selected timestamp.
    pub async fn on_snapshot_error(&self, error: &RouterError) -> Result<()> {
        debug_assert!(self.can_continue_on_snapshot_error());
        debug!(
            error = %error,
            "Clearing pending participants and resetting global snapshot timestamp"
        );

        // A new read timestamp will be selected, so every participant
        // must restart. Snapshot errors are only retryable while the
        // timestamp can still change, which means no participant can
        // predate the current statement.
        self.clear_pending_participants().await?;

        let mut state = self.state.write();
        debug_assert!(state.participants.is_empty());
        debug_assert!(state.coordinator_id.is_none());
        state.at_cluster_time = Some(AtClusterTime::new());
        Ok(())
    }

    /// Abort and remove every participant created by the current
    /// statement, so a retry re-targets them with correct options.
    async fn clear_pending_participants(&self) -> Result<()> {
        let (pending, latest_stmt_id) = {
            let state = self.state.read();
            (state.pending_participants(), state.latest_stmt_id)
        };

        // Abort each pending participant first, so no shard transaction
        // is left open if the retry does not re-target it.
        if !pending.is_empty() {
            let requests =
                self.decorated_abort_requests(&pending, ShardCommand::new(ABORT_TRANSACTION_CMD));
            let responses = scatter_gather(self.env.transport.as_ref(), requests).await;
            for (shard, result) in responses {
                let response = result?;
                match response.command_error() {
                    None => {}
                    // The shard may have already aborted implicitly.
                    Some(error)
                        if error.code == ErrorCode::NoSuchTransaction.as_i32() => {}
                    Some(error) => {
                        return Err(RouterError::NoSuchTransaction(format!(
                            "transaction aborted between retries of statement \
                             {latest_stmt_id} due to error {error} from shard {shard}"
                        )));
                    }
                }
            }
        }

        let mut state = self.state.write();
        for shard in &pending {
            // A pending participant cannot have been returned in a
            // recovery token on an earlier statement, so un-electing it
            // is safe.
            if state.recovery_shard_id.as_ref() == Some(shard) {
                state.recovery_shard_id = None;
            }
            state.participants.remove(shard);
        }

        if state.participants.is_empty() {
            // A new coordinator must be chosen by the retry.
            state.coordinator_id = None;
        } else {
            debug_assert!(state
                .coordinator_id
                .as_ref()
                .is_some_and(|id| state.participants.contains_key(id)));
        }
        Ok(())
    }

    /// Commit the transaction, choosing the protocol from the participant
    /// census (or recovering the outcome via the client's token).
    ///
    /// An `Err` or an unknown-result reply leaves the transaction's
    /// lifecycle open: the client may retry commit and learn the outcome.
    pub async fn commit_transaction(
        &self,
        ctx: &OperationContext,
        recovery_token: Option<&RecoveryToken>,
    ) -> Result<ShardResponse> {
        self.state.write().termination_initiated = true;

        let response = self.run_commit(ctx, recovery_token).await?;

        if commit::is_commit_result_unknown(&response) {
            // The client may retry commit, which will update stats once
            // the result is determined.
            return Ok(response);
        }

        match response.command_error() {
            None => self.on_successful_commit(),
            Some(error) => self.on_non_retryable_commit_error(&error),
        }

        Ok(response)
    }

    async fn run_commit(
        &self,
        ctx: &OperationContext,
        recovery_token: Option<&RecoveryToken>,
    ) -> Result<ShardResponse> {
        enum Plan {
            NoShards,
            Recover { recovery_shard: ShardId },
            Direct { shards: Vec<ShardId> },
            SingleWriteShard {
                read_only_shards: Vec<ShardId>,
                write_shards: Vec<ShardId>,
            },
            TwoPhase {
                coordinator: ShardId,
                participants: Vec<ShardId>,
            },
        }

        let plan = {
            let mut state = self.state.write();

            if state.is_recovering_commit {
                let token = recovery_token.ok_or_else(|| {
                    RouterError::RecoveryTokenRequired(self.txn_id(&state))
                })?;
                self.start_commit(&mut state, CommitType::RecoverWithToken);
                let recovery_shard = token.recovery_shard_id.clone().ok_or_else(|| {
                    RouterError::NoSuchTransaction(
                        "recovery token is empty, meaning the transaction only performed \
                         reads and can be safely retried"
                            .to_string(),
                    )
                })?;
                Plan::Recover { recovery_shard }
            } else if state.participants.is_empty() {
                // Legal when the transaction never targeted a host, e.g.
                // a find against a non-existent database.
                if state.txn_number == UNINITIALIZED_TXN_NUMBER {
                    return Err(RouterError::IllegalOperation(
                        "cannot commit without participants".to_string(),
                    ));
                }
                self.start_commit(&mut state, CommitType::NoShards);
                Plan::NoShards
            } else {
                let mut read_only_shards = Vec::new();
                let mut write_shards = Vec::new();
                for (shard, participant) in &state.participants {
                    match participant.read_only {
                        ReadOnlyStatus::Unset => {
                            return Err(RouterError::NoSuchTransaction(format!(
                                "{} failed to commit transaction because a previous \
                                 statement on the transaction participant {shard} was \
                                 unsuccessful",
                                self.txn_id(&state)
                            )));
                        }
                        ReadOnlyStatus::ReadOnly => read_only_shards.push(shard.clone()),
                        ReadOnlyStatus::NotReadOnly => write_shards.push(shard.clone()),
                    }
                }

                let commit_type = commit::select_commit_type(
                    false,
                    state.participants.len(),
                    write_shards.len(),
                );
                self.start_commit(&mut state, commit_type);

                match commit_type {
                    CommitType::SingleShard => {
                        let shards = state.participant_ids();
                        debug!(
                            txn = %self.txn_id(&state),
                            shard = %shards[0],
                            "Committing single-shard transaction"
                        );
                        Plan::Direct { shards }
                    }
                    CommitType::ReadOnly => {
                        debug!(
                            txn = %self.txn_id(&state),
                            shards = read_only_shards.len(),
                            "Committing read-only transaction"
                        );
                        Plan::Direct {
                            shards: read_only_shards,
                        }
                    }
                    CommitType::SingleWriteShard => {
                        debug!(
                            txn = %self.txn_id(&state),
                            read_only_shards = read_only_shards.len(),
                            write_shard = %write_shards[0],
                            "Committing single-write-shard transaction"
                        );
                        Plan::SingleWriteShard {
                            read_only_shards,
                            write_shards,
                        }
                    }
                    CommitType::TwoPhaseCommit => {
                        let coordinator = state.coordinator_id.clone().ok_or_else(|| {
                            RouterError::IllegalOperation(
                                "two-phase commit requires a coordinator".to_string(),
                            )
                        })?;
                        debug!(
                            txn = %self.txn_id(&state),
                            coordinator = %coordinator,
                            "Committing using two-phase commit"
                        );
                        Plan::TwoPhase {
                            coordinator,
                            participants: state.participant_ids(),
                        }
                    }
                    CommitType::NotInitiated
                    | CommitType::NoShards
                    | CommitType::RecoverWithToken => unreachable!(
                        "direct commit selection cannot yield {commit_type}"
                    ),
                }
            }
        };

        match plan {
            Plan::NoShards => Ok(ShardResponse::ok()),
            Plan::Recover { recovery_shard } => {
                self.commit_with_recovery_token(ctx, recovery_shard).await
            }
            Plan::Direct { shards } => self.send_commit_directly(ctx, &shards).await,
            Plan::SingleWriteShard {
                read_only_shards,
                write_shards,
            } => {
                // Read-only participants hold no locks worth coordinating;
                // commit them first and stop on any failure.
                let read_only_response =
                    self.send_commit_directly(ctx, &read_only_shards).await?;
                if !read_only_response.is_ok()
                    || read_only_response.write_concern_error().is_some()
                {
                    return Ok(read_only_response);
                }
                self.send_commit_directly(ctx, &write_shards).await
            }
            Plan::TwoPhase {
                coordinator,
                participants,
            } => {
                let cmd = commit::coordinate_commit_command(&participants, &ctx.write_concern);
                let cmd = self.attach_txn_fields_if_needed(&coordinator, cmd)?;
                self.env.transport.send_command(&coordinator, cmd).await
            }
        }
    }

    /// Send `commitTransaction` to every listed shard and reduce the
    /// replies to the first error or the last response.
    async fn send_commit_directly(
        &self,
        ctx: &OperationContext,
        shards: &[ShardId],
    ) -> Result<ShardResponse> {
        let mut requests = Vec::with_capacity(shards.len());
        for shard in shards {
            let cmd = commit::commit_command(&ctx.write_concern);
            requests.push((shard.clone(), self.attach_txn_fields_if_needed(shard, cmd)?));
        }
        let responses = scatter_gather(self.env.transport.as_ref(), requests).await;
        commit::first_error_or_last(responses)
    }

    /// Decorate an abort for each listed participant without going
    /// through participant creation or targeting stats.
    fn decorated_abort_requests(
        &self,
        shards: &[ShardId],
        template: ShardCommand,
    ) -> Vec<(ShardId, ShardCommand)> {
        let state = self.state.read();
        shards
            .iter()
            .filter_map(|shard| {
                state
                    .participants
                    .get(shard)
                    .map(|participant| {
                        (shard.clone(), participant.attach_txn_fields(template.clone(), false))
                    })
            })
            .collect()
    }

    async fn commit_with_recovery_token(
        &self,
        ctx: &OperationContext,
        recovery_shard: ShardId,
    ) -> Result<ShardResponse> {
        // An empty participant list asks the recovery shard for the
        // already-decided outcome.
        let cmd = commit::coordinate_commit_command(&[], &ctx.write_concern);
        let cmd = self.attach_txn_fields_if_needed(&recovery_shard, cmd)?;
        self.env.transport.send_command(&recovery_shard, cmd).await
    }

    fn start_commit(&self, state: &mut RouterState, commit_type: CommitType) {
        debug_assert!(commit_type.is_initiated());
        state.commit_type = commit_type;

        // Only the first initiation stamps timing and stats; a retried
        // commit keeps measuring from the original attempt.
        if state.timing_stats.commit_start_ticks.is_some() {
            return;
        }
        state
            .timing_stats
            .try_set_commit_start(self.env.tick_source.ticks());

        self.env.metrics.increment_commit_initiated(commit_type);
        if commit_type != CommitType::RecoverWithToken {
            // The participant list is only known outside recovery.
            self.env
                .metrics
                .add_to_total_participants_at_commit(state.participants.len() as u64);
        }
    }

    /// Explicitly abort the transaction on every participant.
    pub async fn abort_transaction(&self, ctx: &OperationContext) -> Result<ShardResponse> {
        let result = self.run_abort(ctx).await;
        // The transaction counts as active while waiting on abort
        // responses, and is considered terminated as soon as explicit
        // abort is observed, error or not.
        self.on_explicit_abort();
        result
    }

    async fn run_abort(&self, ctx: &OperationContext) -> Result<ShardResponse> {
        let participants = {
            let mut state = self.state.write();
            if state.participants.is_empty() {
                // Return the same error a shard would have returned.
                return Err(RouterError::NoSuchTransaction(
                    "no known command has been sent by this router for this transaction"
                        .to_string(),
                ));
            }
            state.termination_initiated = true;
            debug!(
                txn = %self.txn_id(&state),
                shards = state.participants.len(),
                "Aborting transaction"
            );
            state.participant_ids()
        };

        let abort_cmd = ShardCommand::new(ABORT_TRANSACTION_CMD).field(
            WRITE_CONCERN_FIELD,
            Value::Object(ctx.write_concern.to_document()),
        );
        let requests = self.decorated_abort_requests(&participants, abort_cmd);
        let responses = scatter_gather(self.env.transport.as_ref(), requests).await;
        commit::first_error_or_last(responses)
    }

    /// Best-effort abort after a transactional failure. A no-op once the
    /// commit decision was handed off to a shard; all shard errors are
    /// swallowed.
    pub async fn implicitly_abort_transaction(&self, _ctx: &OperationContext, error: &RouterError) {
        let (handed_off, participants) = {
            let mut state = self.state.write();
            if state.commit_type.decision_handed_off() {
                debug!(
                    txn = %self.txn_id(&state),
                    commit_type = %state.commit_type,
                    "Not sending implicit abort; commit may have been handed off"
                );
                (true, Vec::new())
            } else if state.participants.is_empty() {
                (false, Vec::new())
            } else {
                state.termination_initiated = true;
                debug!(
                    txn = %self.txn_id(&state),
                    shards = state.participants.len(),
                    error = %error,
                    "Implicitly aborting transaction"
                );
                (false, state.participant_ids())
            }
        };

        if !handed_off && !participants.is_empty() {
            // Responses are ignored; the router has done its best.
            let requests = self
                .decorated_abort_requests(&participants, ShardCommand::new(ABORT_TRANSACTION_CMD));
            let _ = scatter_gather(self.env.transport.as_ref(), requests).await;
        }

        self.on_implicit_abort(error);
    }

    /// Attach the recovery token to a transactional reply. Empty for
    /// read-only transactions, which can simply be retried.
    pub fn append_recovery_token(&self, reply: &mut Map<String, Value>) {
        let state = self.state.read();
        let token = match &state.recovery_shard_id {
            Some(shard) => {
                assert!(
                    state
                        .participants
                        .get(shard)
                        .is_some_and(|p| p.read_only.did_write()),
                    "recovery shard {shard} must be a write participant"
                );
                json!({ "recoveryShardId": shard })
            }
            None => json!({}),
        };
        reply.insert(RECOVERY_TOKEN_FIELD.to_string(), token);
    }

    /// Mark the session inactive as it is checked back in.
    pub fn stash(&self) {
        let mut state = self.state.write();
        state
            .timing_stats
            .try_set_inactive(self.env.tick_source.ticks());
    }

    fn on_continue(&self, state: &mut RouterState) {
        state
            .timing_stats
            .try_set_active(self.env.tick_source.ticks());
    }

    fn reset_router_state(&self, state: &mut RouterState, txn_number: TxnNumber) {
        let last_client_info = std::mem::take(&mut state.last_client_info);
        *state = RouterState {
            txn_number,
            last_client_info,
            ..RouterState::default()
        };
        state
            .timing_stats
            .try_set_active(self.env.tick_source.ticks());
    }

    fn on_successful_commit(&self) {
        self.end_transaction_tracking(TerminationCause::Committed);
    }

    fn on_non_retryable_commit_error(&self, error: &CommandError) {
        // A commit that failed with a non-retryable command error can
        // never eventually commit, so the transaction is over from the
        // router's perspective.
        {
            let mut state = self.state.write();
            if state.abort_cause.is_empty() {
                state.abort_cause = error.code_name.clone();
            }
        }
        self.end_transaction_tracking(TerminationCause::Aborted);
    }

    fn on_explicit_abort(&self) {
        {
            let mut state = self.state.write();
            if state.abort_cause.is_empty() {
                // The abort came from a client abort command.
                state.abort_cause = "abort".to_string();
            }
        }
        self.end_transaction_tracking(TerminationCause::Aborted);
    }

    fn on_implicit_abort(&self, error: &RouterError) {
        {
            let mut state = self.state.write();
            // A misbehaving client may keep sending statements after an
            // error; only the first abort cause is kept.
            if state.abort_cause.is_empty() {
                state.abort_cause = error.code_string();
            }
            if state.commit_type.is_initiated() && !state.timing_stats.has_ended() {
                // Commit started but its outcome is unknown; the
                // transaction is not over until a commit retry decides it.
                return;
            }
        }
        self.end_transaction_tracking(TerminationCause::Aborted);
    }

    fn end_transaction_tracking(&self, cause: TerminationCause) {
        let current = self.env.tick_source.ticks();
        let mut state = self.state.write();

        if state.timing_stats.has_ended() {
            return;
        }

        // In some error contexts the transaction may not have become
        // active yet; activation is a no-op when it already is.
        state.timing_stats.try_set_active(current);
        state.timing_stats.try_set_inactive(current);
        state.timing_stats.end_ticks = Some(current);

        if state.timing_stats.duration(current) > self.env.config.slow_transaction_threshold() {
            self.log_slow_transaction(&state, cause, current);
        }

        match cause {
            TerminationCause::Aborted => {
                self.env.metrics.increment_total_aborted();
                self.env.metrics.increment_abort_cause(state.abort_cause.clone());
            }
            TerminationCause::Committed => {
                self.env.metrics.increment_total_committed();
                self.env.metrics.increment_commit_successful(
                    state.commit_type,
                    state.timing_stats.commit_duration(current),
                );
            }
        }
    }
}
