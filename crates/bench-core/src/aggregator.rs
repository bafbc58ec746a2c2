use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::counters::{CountersSnapshot, ErrorRecord, LatencySnapshot};
use crate::sequence::SenderRange;

/// Everything the aggregator needs once sending and tracking have finished.
#[derive(Debug, Clone)]
pub struct SummaryInput<'a> {
    pub test_type: &'a str,
    pub worker_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub counters: &'a CountersSnapshot,
    /// Sequence numbers consumed, per sender
    pub senders: &'a [SenderRange],
    pub sending: Duration,
    pub total: Duration,
    /// Dispatch duration of each round (round-based pacing only)
    pub rounds: &'a [Duration],
    pub round_size: Option<u64>,
    pub target_tps: Option<u64>,
    /// Set when the run was aborted
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub groups: u64,
    pub mean_per_group: f64,
    pub max_per_group: u64,
    pub mean_group_interval_secs: f64,
    /// Max per group divided by the mean group interval
    pub theoretical_max_tps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub rounds: u64,
    pub round_size: u64,
    pub mean_round_ms: f64,
    pub min_round_ms: u64,
    pub max_round_ms: u64,
    pub mean_round_tps: Option<f64>,
}

/// Flat record handed to result sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub test_type: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub senders: Vec<SenderRange>,
    pub total_attempted: u64,
    pub total_accepted: u64,
    pub total_confirmed: u64,
    pub total_confirm_failed: u64,
    pub total_rejected: u64,
    pub total_timed_out: u64,
    pub sending_duration_ms: u64,
    pub total_duration_ms: u64,
    pub throughput_attempted: f64,
    pub throughput_confirmed: f64,
    /// Accepted over attempted; absent when nothing was attempted
    pub success_rate: Option<f64>,
    pub target_tps: Option<u64>,
    pub deviation_percent: Option<f64>,
    pub latency: LatencySnapshot,
    pub per_group_histogram: BTreeMap<u64, u64>,
    pub group_stats: Option<GroupStats>,
    pub round_stats: Option<RoundStats>,
    pub errors: Vec<ErrorRecord>,
    pub errors_dropped: u64,
    pub incomplete: bool,
    pub fatal_error: Option<String>,
}

fn per_second(count: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn group_stats(histogram: &BTreeMap<u64, u64>, sending: Duration) -> Option<GroupStats> {
    if histogram.is_empty() {
        return None;
    }
    let groups = histogram.len() as u64;
    let total: u64 = histogram.values().sum();
    let max_per_group = histogram.values().copied().max().unwrap_or(0);
    let mean_group_interval_secs = sending.as_secs_f64() / groups as f64;
    let theoretical_max_tps = if mean_group_interval_secs > 0.0 {
        Some(max_per_group as f64 / mean_group_interval_secs)
    } else {
        None
    };

    Some(GroupStats {
        groups,
        mean_per_group: total as f64 / groups as f64,
        max_per_group,
        mean_group_interval_secs,
        theoretical_max_tps,
    })
}

fn round_stats(rounds: &[Duration], round_size: Option<u64>) -> Option<RoundStats> {
    let round_size = round_size?;
    if rounds.is_empty() {
        return None;
    }
    let total: Duration = rounds.iter().sum();
    let mean = total / rounds.len() as u32;
    let millis = |d: &Duration| d.as_millis() as u64;

    Some(RoundStats {
        rounds: rounds.len() as u64,
        round_size,
        mean_round_ms: mean.as_secs_f64() * 1000.0,
        min_round_ms: rounds.iter().map(millis).min().unwrap_or(0),
        max_round_ms: rounds.iter().map(millis).max().unwrap_or(0),
        mean_round_tps: (!mean.is_zero()).then(|| round_size as f64 / mean.as_secs_f64()),
    })
}

/// Derive the run summary. No side effects; the error log passes through untouched.
pub fn aggregate(input: &SummaryInput<'_>) -> RunSummary {
    let c = input.counters;

    let throughput_attempted = per_second(c.total_attempted, input.sending);
    let success_rate = if c.total_attempted == 0 {
        None
    } else {
        Some(c.total_accepted as f64 / c.total_attempted as f64)
    };
    let deviation_percent = input
        .target_tps
        .filter(|&tps| tps > 0)
        .map(|tps| (throughput_attempted - tps as f64) / tps as f64 * 100.0);

    RunSummary {
        test_type: input.test_type.to_string(),
        worker_id: input.worker_id.to_string(),
        timestamp: input.timestamp,
        senders: input.senders.to_vec(),
        total_attempted: c.total_attempted,
        total_accepted: c.total_accepted,
        total_confirmed: c.total_confirmed,
        total_confirm_failed: c.total_confirm_failed,
        total_rejected: c.total_rejected,
        total_timed_out: c.total_timed_out,
        sending_duration_ms: input.sending.as_millis() as u64,
        total_duration_ms: input.total.as_millis() as u64,
        throughput_attempted,
        throughput_confirmed: per_second(c.total_confirmed, input.total),
        success_rate,
        target_tps: input.target_tps,
        deviation_percent,
        latency: c.latency.clone(),
        per_group_histogram: c.groups.clone(),
        group_stats: group_stats(&c.groups, input.sending),
        round_stats: round_stats(input.rounds, input.round_size),
        errors: c.errors.clone(),
        errors_dropped: c.errors_dropped,
        incomplete: input.fatal.is_some() || c.in_flight > 0,
        fatal_error: input.fatal.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(counters: &'a CountersSnapshot, rounds: &'a [Duration]) -> SummaryInput<'a> {
        SummaryInput {
            test_type: "native-transfer",
            worker_id: "w0",
            timestamp: Utc::now(),
            counters,
            senders: &[],
            sending: Duration::from_secs(10),
            total: Duration::from_secs(20),
            rounds,
            round_size: None,
            target_tps: None,
            fatal: None,
        }
    }

    #[test]
    fn test_throughput_and_success_rate() {
        let counters = CountersSnapshot {
            total_attempted: 100,
            total_accepted: 80,
            total_rejected: 20,
            total_confirmed: 60,
            total_confirm_failed: 10,
            total_timed_out: 10,
            ..Default::default()
        };
        let mut input = input(&counters, &[]);
        input.target_tps = Some(8);

        let summary = aggregate(&input);
        assert_eq!(summary.throughput_attempted, 10.0);
        assert_eq!(summary.throughput_confirmed, 3.0);
        assert_eq!(summary.success_rate, Some(0.8));
        assert_eq!(summary.deviation_percent, Some(25.0));
        assert!(!summary.incomplete);
        assert!(summary.group_stats.is_none());
        assert!(summary.round_stats.is_none());
    }

    #[test]
    fn test_nothing_attempted() {
        let counters = CountersSnapshot::default();
        let mut input = input(&counters, &[]);
        input.sending = Duration::ZERO;
        input.total = Duration::ZERO;

        let summary = aggregate(&input);
        assert_eq!(summary.success_rate, None);
        assert_eq!(summary.throughput_attempted, 0.0);
        assert_eq!(summary.throughput_confirmed, 0.0);
    }

    #[test]
    fn test_group_stats() {
        let counters = CountersSnapshot {
            total_attempted: 60,
            total_accepted: 60,
            total_confirmed: 60,
            groups: BTreeMap::from([(100, 10), (101, 30), (102, 15), (103, 5)]),
            ..Default::default()
        };
        let summary = aggregate(&input(&counters, &[]));

        let stats = summary.group_stats.unwrap();
        assert_eq!(stats.groups, 4);
        assert_eq!(stats.mean_per_group, 15.0);
        assert_eq!(stats.max_per_group, 30);
        assert_eq!(stats.mean_group_interval_secs, 2.5);
        assert_eq!(stats.theoretical_max_tps, Some(12.0));
        assert_eq!(summary.per_group_histogram.get(&101), Some(&30));
    }

    #[test]
    fn test_round_stats() {
        let counters = CountersSnapshot {
            total_attempted: 30,
            total_accepted: 30,
            ..Default::default()
        };
        let rounds = [
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(200),
        ];
        let mut input = input(&counters, &rounds);
        input.round_size = Some(10);

        let stats = aggregate(&input).round_stats.unwrap();
        assert_eq!(stats.rounds, 3);
        assert_eq!(stats.min_round_ms, 100);
        assert_eq!(stats.max_round_ms, 300);
        assert!((stats.mean_round_ms - 200.0).abs() < 1e-9);
        assert!((stats.mean_round_tps.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_fatal_marks_incomplete() {
        let counters = CountersSnapshot {
            total_attempted: 3,
            total_rejected: 3,
            ..Default::default()
        };
        let mut input = input(&counters, &[]);
        input.fatal = Some("target unreachable".into());

        let summary = aggregate(&input);
        assert!(summary.incomplete);
        assert_eq!(summary.fatal_error.as_deref(), Some("target unreachable"));
        assert_eq!(summary.success_rate, Some(0.0));
    }

    #[test]
    fn test_histogram_serializes_with_string_keys() {
        let counters = CountersSnapshot {
            total_attempted: 3,
            total_accepted: 3,
            total_confirmed: 3,
            groups: BTreeMap::from([(1, 3)]),
            ..Default::default()
        };
        let summary = aggregate(&input(&counters, &[]));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["per_group_histogram"]["1"], 3);
        assert_eq!(json["success_rate"], 1.0);
    }
}
