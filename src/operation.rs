//! Per-statement operation context
//!
//! Every client statement reaching the router is wrapped in an
//! [`OperationContext`]: the session it belongs to, the read concern the
//! client sent on this statement (which the router may replace with the
//! transaction's own), the write concern to forward on terminal commands,
//! and the client descriptor recorded for diagnostics.

use crate::protocol::{ReadConcernArgs, WriteConcern};
use crate::session::SessionId;
use std::fmt;

/// How a statement relates to the session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    /// First statement of a new transaction
    Start,
    /// Subsequent statement of the transaction in progress
    Continue,
    /// Terminal commit statement
    Commit,
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionAction::Start => "start",
            TransactionAction::Continue => "continue",
            TransactionAction::Commit => "commit",
        })
    }
}

/// Descriptor of the client driving the session, for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Remote host and port of the client connection
    pub host: String,
    /// Server-assigned connection id
    pub connection_id: u64,
    /// Application name from the client handshake
    pub app_name: String,
}

/// Context for one client statement.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Session the statement is addressed to
    pub session_id: SessionId,
    /// Read concern as sent by the client on this statement. On a
    /// mid-transaction statement the router reinstalls the transaction's
    /// frozen read concern here.
    pub read_concern: ReadConcernArgs,
    /// Write concern forwarded on commit and abort
    pub write_concern: WriteConcern,
    /// Client descriptor, copied into the router's last-client record
    pub client: ClientInfo,
}

impl OperationContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            read_concern: ReadConcernArgs::default(),
            write_concern: WriteConcern::default(),
            client: ClientInfo::default(),
        }
    }

    pub fn with_read_concern(mut self, read_concern: ReadConcernArgs) -> Self {
        self.read_concern = read_concern;
        self
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }
}
