//! Snapshot timestamp holder
//!
//! A snapshot transaction carries an [`AtClusterTime`] from its first
//! statement: present but empty until targeting selects a timestamp,
//! then pinned to the statement that selected it. "Holder present, time
//! not yet fixed" is a distinct state from "not a snapshot transaction"
//! (no holder at all), which is why the router stores an
//! `Option<AtClusterTime>` whose record carries its own optional time.

use crate::cluster::ClusterTime;
use crate::transaction::StmtId;

/// The transaction's global read timestamp, once selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtClusterTime {
    selected: Option<Selection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Selection {
    time: ClusterTime,
    stmt_id: StmtId,
}

impl AtClusterTime {
    /// An empty holder: snapshot read concern declared, no time yet.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_has_been_set(&self) -> bool {
        self.selected.is_some()
    }

    /// The selected timestamp, if one has been fixed.
    pub fn time(&self) -> Option<ClusterTime> {
        self.selected.map(|s| s.time)
    }

    /// The statement id the timestamp was fixed at.
    pub fn stmt_id_selected_at(&self) -> Option<StmtId> {
        self.selected.map(|s| s.stmt_id)
    }

    /// The timestamp may still change while no statement other than the
    /// current one has observed it: either nothing is selected yet, or
    /// the selection happened on this very statement.
    pub fn can_change(&self, current_stmt_id: StmtId) -> bool {
        match self.selected {
            None => true,
            Some(selection) => selection.stmt_id == current_stmt_id,
        }
    }

    /// Fix the timestamp at the given statement.
    pub fn set_time(&mut self, time: ClusterTime, current_stmt_id: StmtId) {
        debug_assert!(time.is_initialized(), "cannot select the zero timestamp");
        self.selected = Some(Selection {
            time,
            stmt_id: current_stmt_id,
        });
    }
}
