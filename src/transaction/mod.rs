//! Multi-shard transaction coordination
//!
//! The router side of distributed transactions: each client session owns
//! a [`TransactionRouter`] that tracks which shards its current
//! transaction touched, freezes a cluster-wide snapshot timestamp for
//! snapshot reads, decides between four structurally different commit
//! protocols from the observed read/write behavior, and recovers unknown
//! commit outcomes through a client-carried token.
//!
//! Statement flow: `begin_or_continue` arbitrates the transaction number,
//! `set_default_at_cluster_time` runs before shard targeting,
//! `attach_txn_fields_if_needed` decorates each outgoing command, and
//! `process_participant_response` folds each reply back in. A terminal
//! statement goes through `commit_transaction` or `abort_transaction`.

pub mod at_cluster_time;
pub mod commit;
pub mod participant;
pub mod reporter;
pub mod router;
pub mod timing;


pub use at_cluster_time::AtClusterTime;
pub use commit::CommitType;
pub use participant::{Participant, ReadOnlyStatus, SharedTransactionOptions};
pub use router::{RouterEnv, RouterState, TransactionRouter};
pub use timing::{SystemTickSource, Tick, TickSource, TimingStats};

/// Statement counter within one transaction.
pub type StmtId = i32;

/// Per-session transaction counter.
pub type TxnNumber = i64;

/// Sentinel for a router that has not seen a transaction yet.
pub const UNINITIALIZED_TXN_NUMBER: TxnNumber = -1;
