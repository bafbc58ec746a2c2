use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::truncate_reason;

/// Upper bounds (inclusive, ms) of the confirmation latency buckets.
/// Anything slower lands in a final overflow bucket.
pub const LATENCY_BUCKETS_MS: [u64; 17] = [
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 60_000, 120_000,
    300_000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Submit,
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub sender: String,
    pub sequence: u64,
    pub stage: ErrorStage,
    pub reason: String,
}

#[derive(Debug)]
struct ErrorLog {
    capacity: usize,
    entries: Vec<ErrorRecord>,
    dropped: u64,
}

/// Fixed-bucket latency histogram, lock-free on the record path.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: Vec<AtomicU64>,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS.partition_point(|&bound| bound < ms);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Percentile (0-100) over bucket counts, reported as the bucket's upper bound in ms.
fn percentile(counts: &[u64], p: u64) -> u64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total * p) / 100).max(1);
    let mut cumulative = 0u64;

    for (bucket_idx, &count) in counts.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return LATENCY_BUCKETS_MS
                .get(bucket_idx)
                .copied()
                .unwrap_or(u64::MAX);
        }
    }

    u64::MAX
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accumulator for one test run, shared by the submitter and the tracker.
#[derive(Debug)]
pub struct RunCounters {
    attempted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    confirmed: AtomicU64,
    confirm_failed: AtomicU64,
    timed_out: AtomicU64,
    errors: Mutex<ErrorLog>,
    groups: Mutex<BTreeMap<u64, u64>>,
    latency: LatencyHistogram,
}

impl RunCounters {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            attempted: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            confirm_failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            errors: Mutex::new(ErrorLog {
                capacity: error_capacity,
                entries: Vec::new(),
                dropped: 0,
            }),
            groups: Mutex::new(BTreeMap::new()),
            latency: LatencyHistogram::new(),
        }
    }

    pub fn record_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// A request was confirmed successfully inside `group`.
    pub fn record_confirmed(&self, group: u64, latency: Duration) {
        *lock(&self.groups).entry(group).or_insert(0) += 1;
        self.latency.record(latency);
        self.confirmed.fetch_add(1, Ordering::SeqCst);
    }

    /// The target processed a request but marked it unsuccessful, or tracking itself failed.
    pub fn record_confirm_failed(&self) {
        self.confirm_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
    }

    /// Append to the bounded error log; errors past capacity are only counted.
    pub fn record_error(&self, sender: &str, sequence: u64, stage: ErrorStage, reason: &str) {
        let mut log = lock(&self.errors);
        if log.entries.len() < log.capacity {
            log.entries.push(ErrorRecord {
                sender: sender.to_string(),
                sequence,
                stage,
                reason: truncate_reason(reason),
            });
        } else {
            log.dropped += 1;
        }
    }

    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn confirm_failed(&self) -> u64 {
        self.confirm_failed.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Accepted requests that have not reached a terminal confirmation result yet.
    pub fn in_flight(&self) -> u64 {
        let terminal = self.confirmed() + self.confirm_failed() + self.timed_out();
        self.accepted().saturating_sub(terminal)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let (errors, errors_dropped) = {
            let log = lock(&self.errors);
            (log.entries.clone(), log.dropped)
        };
        let counts = self.latency.counts();

        CountersSnapshot {
            total_attempted: self.attempted(),
            total_accepted: self.accepted(),
            total_rejected: self.rejected(),
            total_confirmed: self.confirmed(),
            total_confirm_failed: self.confirm_failed(),
            total_timed_out: self.timed_out(),
            in_flight: self.in_flight(),
            groups: lock(&self.groups).clone(),
            errors,
            errors_dropped,
            latency: LatencySnapshot {
                samples: counts.iter().sum(),
                p50_ms: percentile(&counts, 50),
                p95_ms: percentile(&counts, 95),
                p99_ms: percentile(&counts, 99),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Point-in-time copy of `RunCounters`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub total_attempted: u64,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_confirmed: u64,
    pub total_confirm_failed: u64,
    pub total_timed_out: u64,
    pub in_flight: u64,
    pub groups: BTreeMap<u64, u64>,
    pub errors: Vec<ErrorRecord>,
    pub errors_dropped: u64,
    pub latency: LatencySnapshot,
}
