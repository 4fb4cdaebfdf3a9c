//! Cluster identity and logical time
//!
//! The router only needs two things from the surrounding cluster: stable
//! shard identities to key participant state by, and a cluster-wide
//! logical clock to select snapshot read timestamps from. Shard discovery
//! and topology management live outside this crate; commands reach shards
//! through the [`crate::transport`] seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a single shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A cluster-wide logical timestamp.
///
/// Value zero is the uninitialized sentinel and never names a valid
/// snapshot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClusterTime(u64);

impl ClusterTime {
    pub const UNINITIALIZED: ClusterTime = ClusterTime(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_initialized(&self) -> bool {
        *self != Self::UNINITIALIZED
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the cluster's current logical time.
///
/// Implementations are expected to be monotonic: once a time has been
/// observed, `cluster_time` never goes backwards.
pub trait LogicalClock: Send + Sync {
    /// The latest cluster time known to this node.
    fn cluster_time(&self) -> ClusterTime;

    /// Fold in a time observed from another node (gossip, command reply).
    fn observe(&self, observed: ClusterTime);
}

/// Process-local logical clock advanced by observation.
#[derive(Debug, Default)]
pub struct SystemLogicalClock {
    now: AtomicU64,
}

impl SystemLogicalClock {
    pub fn new(initial: ClusterTime) -> Self {
        Self {
            now: AtomicU64::new(initial.as_u64()),
        }
    }
}

impl LogicalClock for SystemLogicalClock {
    fn cluster_time(&self) -> ClusterTime {
        ClusterTime(self.now.load(Ordering::SeqCst))
    }

    fn observe(&self, observed: ClusterTime) {
        self.now.fetch_max(observed.as_u64(), Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Manually driven clock for deterministic tests.
    #[derive(Debug, Default)]
    pub struct ManualLogicalClock {
        now: AtomicU64,
    }

    impl ManualLogicalClock {
        pub fn new(initial: ClusterTime) -> Self {
            Self {
                now: AtomicU64::new(initial.as_u64()),
            }
        }

        pub fn set(&self, time: ClusterTime) {
            self.now.store(time.as_u64(), Ordering::SeqCst);
        }
    }

    impl LogicalClock for ManualLogicalClock {
        fn cluster_time(&self) -> ClusterTime {
            ClusterTime(self.now.load(Ordering::SeqCst))
        }

        fn observe(&self, observed: ClusterTime) {
            self.now.fetch_max(observed.as_u64(), Ordering::SeqCst);
        }
    }
}
