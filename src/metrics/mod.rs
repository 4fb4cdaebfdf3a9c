//! Router transaction metrics
//!
//! Process-wide counters describing the router's transaction workload.
//! All counters are relaxed atomics updated inline on the hot path; a
//! [`MetricsSnapshot`] can be taken at any time for scraping without
//! stopping writers.

use crate::transaction::CommitType;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One counter per initiated commit protocol.
#[derive(Debug, Default)]
struct CommitTypeCounters {
    no_shards: AtomicU64,
    single_shard: AtomicU64,
    single_write_shard: AtomicU64,
    read_only: AtomicU64,
    two_phase_commit: AtomicU64,
    recover_with_token: AtomicU64,
}

impl CommitTypeCounters {
    fn counter(&self, commit_type: CommitType) -> Option<&AtomicU64> {
        match commit_type {
            CommitType::NotInitiated => None,
            CommitType::NoShards => Some(&self.no_shards),
            CommitType::SingleShard => Some(&self.single_shard),
            CommitType::SingleWriteShard => Some(&self.single_write_shard),
            CommitType::ReadOnly => Some(&self.read_only),
            CommitType::TwoPhaseCommit => Some(&self.two_phase_commit),
            CommitType::RecoverWithToken => Some(&self.recover_with_token),
        }
    }

    fn increment(&self, commit_type: CommitType) {
        if let Some(counter) = self.counter(commit_type) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn add(&self, commit_type: CommitType, value: u64) {
        if let Some(counter) = self.counter(commit_type) {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> HashMap<String, u64> {
        [
            CommitType::NoShards,
            CommitType::SingleShard,
            CommitType::SingleWriteShard,
            CommitType::ReadOnly,
            CommitType::TwoPhaseCommit,
            CommitType::RecoverWithToken,
        ]
        .into_iter()
        .map(|t| {
            let value = self
                .counter(t)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or_default();
            (t.as_str().to_string(), value)
        })
        .collect()
    }
}

/// Transaction counters maintained by every router in the process.
#[derive(Debug, Default)]
pub struct RouterTransactionsMetrics {
    /// Transactions started, including begun commit recoveries
    total_started: AtomicU64,
    /// Transactions that ended committed
    total_committed: AtomicU64,
    /// Transactions that ended aborted
    total_aborted: AtomicU64,
    /// Participants added across all transactions
    total_contacted_participants: AtomicU64,
    /// Participants across all initiated commits with a known list
    total_participants_at_commit: AtomicU64,
    /// Commands decorated with transaction fields
    total_requests_targeted: AtomicU64,
    /// Commit initiations by protocol
    commit_initiated: CommitTypeCounters,
    /// Successful commits by protocol
    commit_successful: CommitTypeCounters,
    /// Cumulative successful commit duration by protocol (micros)
    commit_duration_micros: CommitTypeCounters,
    /// Abort frequency by cause string
    abort_causes: DashMap<String, u64>,
}

impl RouterTransactionsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total_started(&self) {
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_total_committed(&self) {
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_total_aborted(&self) {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_total_contacted_participants(&self) {
        self.total_contacted_participants
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_to_total_participants_at_commit(&self, count: u64) {
        self.total_participants_at_commit
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_total_requests_targeted(&self) {
        self.total_requests_targeted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commit_initiated(&self, commit_type: CommitType) {
        self.commit_initiated.increment(commit_type);
    }

    pub fn increment_commit_successful(&self, commit_type: CommitType, duration: Duration) {
        self.commit_successful.increment(commit_type);
        self.commit_duration_micros
            .add(commit_type, duration.as_micros() as u64);
    }

    pub fn increment_abort_cause(&self, cause: impl Into<String>) {
        *self.abort_causes.entry(cause.into()).or_insert(0) += 1;
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }

    /// Consistent-enough view of all counters for scraping
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_started: self.total_started.load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_contacted_participants: self
                .total_contacted_participants
                .load(Ordering::Relaxed),
            total_participants_at_commit: self
                .total_participants_at_commit
                .load(Ordering::Relaxed),
            total_requests_targeted: self.total_requests_targeted.load(Ordering::Relaxed),
            commit_initiated: self.commit_initiated.snapshot(),
            commit_successful: self.commit_successful.snapshot(),
            commit_duration_micros: self.commit_duration_micros.snapshot(),
            abort_causes: self
                .abort_causes
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

/// Point-in-time copy of [`RouterTransactionsMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_started: u64,
    pub total_committed: u64,
    pub total_aborted: u64,
    pub total_contacted_participants: u64,
    pub total_participants_at_commit: u64,
    pub total_requests_targeted: u64,
    pub commit_initiated: HashMap<String, u64>,
    pub commit_successful: HashMap<String, u64>,
    pub commit_duration_micros: HashMap<String, u64>,
    pub abort_causes: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RouterTransactionsMetrics::new();
        metrics.increment_total_started();
        metrics.increment_total_started();
        metrics.increment_total_committed();
        metrics.increment_commit_initiated(CommitType::SingleShard);
        metrics.increment_commit_successful(CommitType::SingleShard, Duration::from_micros(250));
        metrics.increment_abort_cause("NoSuchTransaction");
        metrics.increment_abort_cause("NoSuchTransaction");
        metrics.increment_abort_cause("abort");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_started, 2);
        assert_eq!(snapshot.total_committed, 1);
        assert_eq!(snapshot.commit_initiated["singleShard"], 1);
        assert_eq!(snapshot.commit_successful["singleShard"], 1);
        assert_eq!(snapshot.commit_duration_micros["singleShard"], 250);
        assert_eq!(snapshot.abort_causes["NoSuchTransaction"], 2);
        assert_eq!(snapshot.abort_causes["abort"], 1);
    }

    #[test]
    fn not_initiated_is_never_counted() {
        let metrics = RouterTransactionsMetrics::new();
        metrics.increment_commit_initiated(CommitType::NotInitiated);
        let snapshot = metrics.snapshot();
        assert!(snapshot.commit_initiated.values().all(|&v| v == 0));
    }
}
