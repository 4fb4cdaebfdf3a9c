#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Shardline
//!
//! Shardline is the coordinator-side transaction state machine of a
//! stateless query router for a sharded cluster. It turns a stream of
//! client statements — each carrying a session id and a transaction
//! number — into a consistent multi-shard distributed transaction: it
//! tracks which shards a transaction touched, pins a cluster-wide
//! snapshot read timestamp, chooses among four structurally different
//! commit protocols based on the observed read/write behavior, and
//! drives commit or abort to completion.
//!
//! ## What lives here
//!
//! - [`transaction`]: the per-session router state machine, participant
//!   bookkeeping, snapshot selection, commit protocols, and diagnostics
//! - [`session`]: the session registry with exclusive per-operation
//!   checkout and observer scans
//! - [`protocol`]: the JSON wire-document model for commands, replies,
//!   read/write concern, and recovery tokens
//! - [`transport`]: the seam through which commands reach shards
//! - [`cluster`]: shard identities and the logical clock
//! - [`metrics`]: process-wide transaction counters
//! - [`config`], [`error`], [`operation`]: configuration, error surface,
//!   and per-statement context
//!
//! ## Statement flow
//!
//! ```no_run
//! use shardline::cluster::{ShardId, SystemLogicalClock};
//! use shardline::operation::{OperationContext, TransactionAction};
//! use shardline::protocol::{ReadConcernArgs, ShardCommand};
//! use shardline::session::{SessionId, SessionStore};
//! use shardline::transaction::RouterEnv;
//! use shardline::RouterConfig;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn shardline::transport::ShardTransport>) -> shardline::Result<()> {
//! let env = Arc::new(RouterEnv::new(
//!     RouterConfig::default(),
//!     Arc::new(SystemLogicalClock::default()),
//!     transport,
//! ));
//! let sessions = SessionStore::new(Arc::clone(&env));
//!
//! let session_id = SessionId::new();
//! let mut ctx = OperationContext::new(session_id)
//!     .with_read_concern(ReadConcernArgs::snapshot());
//!
//! let checked_out = sessions.check_out(session_id).await;
//! let router = checked_out.router();
//!
//! router.begin_or_continue(&mut ctx, 1, TransactionAction::Start)?;
//! router.set_default_at_cluster_time(&ctx);
//!
//! let shard = ShardId::new("shard-a");
//! let cmd = router.attach_txn_fields_if_needed(&shard, ShardCommand::new("find"))?;
//! // ... dispatch `cmd`, then feed the reply back:
//! // router.process_participant_response(&shard, &reply)?;
//! // router.commit_transaction(&ctx, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Boundaries
//!
//! The router holds no durable state: recovery of an unknown commit
//! outcome is driven entirely by the client-supplied recovery token, and
//! a router restart forgets all in-flight transactions. Shard discovery,
//! wire framing, and command parsing live outside this crate behind the
//! [`transport::ShardTransport`] seam.

pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod protocol;
pub mod session;
pub mod transaction;
pub mod transport;

pub use cluster::{ClusterTime, LogicalClock, ShardId, SystemLogicalClock};
pub use config::RouterConfig;
pub use error::{ErrorCode, Result, RouterError};
pub use metrics::{MetricsSnapshot, RouterTransactionsMetrics};
pub use operation::{ClientInfo, OperationContext, TransactionAction};
pub use protocol::{
    ReadConcernArgs, ReadConcernLevel, RecoveryToken, ShardCommand, ShardResponse, WriteConcern,
};
pub use session::{CheckedOutSession, Session, SessionId, SessionStore};
pub use transaction::{CommitType, RouterEnv, TransactionRouter};
pub use transport::ShardTransport;
