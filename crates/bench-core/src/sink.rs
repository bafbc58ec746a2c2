use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::aggregator::RunSummary;

/// Receives the summary of a finished run.
pub trait ResultSink {
    fn write(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Writes each summary as pretty JSON into a results directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `<dir>/<test_type>_<worker>_<YYYYmmdd_HHMMSS>.json`
    pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
        let timestamp = summary.timestamp.format("%Y%m%d_%H%M%S");
        self.dir.join(format!(
            "{}_{}_{}.json",
            summary.test_type, summary.worker_id, timestamp
        ))
    }
}

impl ResultSink for JsonFileSink {
    fn write(&self, summary: &RunSummary) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create results dir {:?}", self.dir))?;
        let path = self.path_for(summary);
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Results written to {}", path.display());
        Ok(())
    }
}

/// Prints a human-readable summary to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl ResultSink for ConsoleSink {
    fn write(&self, summary: &RunSummary) -> anyhow::Result<()> {
        println!("{}", render(summary));
        Ok(())
    }
}

fn render(s: &RunSummary) -> String {
    let mut lines = vec![
        format!("\n=== {} Summary (worker {}) ===", s.test_type, s.worker_id),
        format!("Sending duration: {}ms", s.sending_duration_ms),
        format!("Total duration: {}ms", s.total_duration_ms),
        format!("Attempted: {}", s.total_attempted),
        format!("Accepted: {}", s.total_accepted),
        format!("Rejected: {}", s.total_rejected),
        format!("Confirmed: {}", s.total_confirmed),
        format!("Confirm failed: {}", s.total_confirm_failed),
        format!("Timed out: {}", s.total_timed_out),
        format!("Attempted TPS: {:.2}", s.throughput_attempted),
        format!("Confirmed TPS: {:.2}", s.throughput_confirmed),
    ];

    for range in &s.senders {
        lines.push(format!(
            "Sender {}: sequences {}..{}",
            range.sender, range.start_sequence, range.end_sequence
        ));
    }
    match s.success_rate {
        Some(rate) => lines.push(format!("Success rate: {:.2}%", rate * 100.0)),
        None => lines.push("Success rate: n/a".to_string()),
    }
    if let (Some(target), Some(deviation)) = (s.target_tps, s.deviation_percent) {
        lines.push(format!("Target TPS: {} (deviation {:.1}%)", target, deviation));
    }
    if s.latency.samples > 0 {
        lines.push(format!(
            "Confirmation latency p50/p95/p99: {}ms / {}ms / {}ms",
            s.latency.p50_ms, s.latency.p95_ms, s.latency.p99_ms
        ));
    }
    if let Some(g) = &s.group_stats {
        lines.push(format!("Groups: {}", g.groups));
        lines.push(format!("Avg per group: {:.2}", g.mean_per_group));
        lines.push(format!("Max per group: {}", g.max_per_group));
        lines.push(format!("Avg group interval: {:.2}s", g.mean_group_interval_secs));
        if let Some(max) = g.theoretical_max_tps {
            lines.push(format!("Theoretical max: {:.2} TPS", max));
        }
    }
    if let Some(r) = &s.round_stats {
        lines.push(format!(
            "Rounds: {} x {} requests, {:.0}ms avg ({}..{}ms)",
            r.rounds, r.round_size, r.mean_round_ms, r.min_round_ms, r.max_round_ms
        ));
    }
    if !s.errors.is_empty() {
        lines.push(format!(
            "Errors logged: {} (+{} dropped)",
            s.errors.len(),
            s.errors_dropped
        ));
    }
    if s.incomplete {
        lines.push(format!(
            "INCOMPLETE: {}",
            s.fatal_error.as_deref().unwrap_or("requests still in flight")
        ));
    }
    lines.join("\n")
}
