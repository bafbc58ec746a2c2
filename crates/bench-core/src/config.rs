use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Payload memos longer than this are truncated.
pub const MAX_MEMO_BYTES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub schedule: ScheduleConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scenario.duration_ms.is_none() && self.scenario.total_count.is_none() {
            anyhow::bail!("scenario: one of duration_ms or total_count must be set");
        }
        match self.schedule {
            ScheduleConfig::FixedInterval { tps, per_tick } => {
                if tps == 0 {
                    anyhow::bail!("schedule.tps must be non-zero");
                }
                if per_tick == 0 {
                    anyhow::bail!("schedule.per_tick must be non-zero");
                }
            }
            ScheduleConfig::RoundBased {
                batch_size,
                concurrency,
                ..
            } => {
                if batch_size == 0 || concurrency == 0 {
                    anyhow::bail!("schedule.batch_size and schedule.concurrency must be non-zero");
                }
            }
        }
        if self.target.senders.is_empty() {
            anyhow::bail!("target.senders must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.target.senders.iter().find(|s| !seen.insert(s.as_str())) {
            anyhow::bail!("target.senders lists {dup} more than once");
        }
        if self.target.destinations.is_empty() {
            anyhow::bail!("target.destinations must not be empty");
        }
        if self.target.confirm_timeout_ms == 0 {
            anyhow::bail!("target.confirm_timeout_ms must be non-zero");
        }
        if self.tracking.batch_size == 0 {
            anyhow::bail!("tracking.batch_size must be non-zero");
        }
        if let Some(sim) = &self.simulation {
            for (name, p) in [
                ("reject_probability", sim.reject_probability),
                ("failure_probability", sim.failure_probability),
            ] {
                if !(0.0..=1.0).contains(&p) {
                    anyhow::bail!("simulation.{name} must be within [0, 1] (got {p})");
                }
            }
        }
        Ok(())
    }

    /// Memo truncated to `MAX_MEMO_BYTES`, or `None` when empty.
    pub fn memo(&self) -> Option<String> {
        let memo = &self.scenario.memo;
        if memo.is_empty() {
            return None;
        }
        let mut end = memo.len().min(MAX_MEMO_BYTES);
        while !memo.is_char_boundary(end) {
            end -= 1;
        }
        Some(memo[..end].to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Label copied into the run summary
    #[serde(default = "default_test_type")]
    pub test_type: String,
    /// Deterministic seed for reproducible simulation
    #[serde(default)]
    pub seed: u64,
    /// Stop dispatching after this many milliseconds
    pub duration_ms: Option<u64>,
    /// Stop dispatching after this many requests
    pub total_count: Option<u64>,
    /// Memo string to include in requests (truncated to 256 bytes)
    #[serde(default)]
    pub memo: String,
}

/// Pacing policy for the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// `per_tick` requests every `per_tick * 1000 / tps` milliseconds
    FixedInterval {
        tps: u64,
        #[serde(default = "default_per_tick")]
        per_tick: u64,
    },
    /// `batch_size * concurrency` requests per round, rounds back-to-back
    RoundBased {
        batch_size: u64,
        concurrency: u64,
        #[serde(default)]
        round_delay_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Sending identities. Requests rotate across them round-robin and each
    /// consumes its own sequence numbers.
    pub senders: Vec<String>,
    /// Destinations, used round-robin by request
    pub destinations: Vec<String>,
    /// Value carried by each request (string to preserve precision)
    pub value: String,
    /// Resource limit attached to every request
    pub resource_limit: u64,
    pub max_fee: u64,
    pub priority_fee: u64,
    /// Confirmations required before a request counts as confirmed
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Per-request confirmation timeout in milliseconds
    pub confirm_timeout_ms: u64,
    /// Consecutive unreachable submissions before the run is aborted
    #[serde(default = "default_max_consecutive_unreachable")]
    pub max_consecutive_unreachable: u64,
}

impl TargetConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Confirmation waits issued together
    #[serde(default = "default_tracking_batch")]
    pub batch_size: usize,
    /// Errors retained in the run's error log
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,
    /// Log progress every N newly confirmed requests
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_tracking_batch(),
            error_log_capacity: default_error_log_capacity(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier used in logs and result file names
    pub id: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    /// Progress log period in milliseconds
    #[serde(default = "default_print_every_ms")]
    pub print_every_ms: u64,
}

/// Behaviour of the in-process simulated target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub starting_sequence: u64,
    pub submit_latency_ms: u64,
    pub confirm_delay_ms: u64,
    /// Wall-clock length of one processing unit (block)
    pub group_interval_ms: u64,
    pub first_group: u64,
    pub reject_probability: f64,
    pub failure_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            starting_sequence: 0,
            submit_latency_ms: 5,
            confirm_delay_ms: 1_000,
            group_interval_ms: 2_000,
            first_group: 1,
            reject_probability: 0.0,
            failure_probability: 0.0,
        }
    }
}

fn default_test_type() -> String {
    "throughput".to_string()
}

fn default_per_tick() -> u64 {
    1
}

fn default_confirmations() -> u64 {
    1
}

fn default_max_consecutive_unreachable() -> u64 {
    50
}

fn default_tracking_batch() -> usize {
    50
}

fn default_error_log_capacity() -> usize {
    100
}

fn default_progress_every() -> u64 {
    500
}

fn default_results_dir() -> String {
    "results".to_string()
}

fn default_print_every_ms() -> u64 {
    1_000
}
