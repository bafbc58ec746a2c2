use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregator::{aggregate, RunSummary, SummaryInput};
use crate::config::Config;
use crate::counters::{CountersSnapshot, RunCounters};
use crate::error::FatalError;
use crate::rate_controller::{RateController, StopCondition};
use crate::sequence::SenderPool;
use crate::submitter::{RequestTemplate, Submitter, TargetSystem};
use crate::tracker::{ConfirmationTracker, TrackerConfig};

/// What the dispatch loop hands back once it stops.
struct SendingPhase {
    duration: Duration,
    rounds: Vec<Duration>,
    fatal: Option<FatalError>,
}

/// One load test against one target: pace, submit, track, aggregate.
pub struct LoadRun {
    config: Config,
    target: Arc<dyn TargetSystem>,
}

impl LoadRun {
    pub fn new(config: Config, target: Arc<dyn TargetSystem>) -> Self {
        Self { config, target }
    }

    /// Run to completion. Always yields a summary.
    ///
    /// If a starting sequence cannot be fetched nothing is sent, and the summary is
    /// empty and flagged incomplete. A target that becomes unreachable mid-run stops
    /// dispatch, and the summary comes back flagged incomplete once every dispatched
    /// request has been tracked.
    pub async fn run(self, cancel: CancellationToken) -> RunSummary {
        let config = &self.config;
        let target = self.target.clone();

        let pool = match SenderPool::from_target(target.as_ref(), &config.target.senders).await {
            Ok(pool) => pool,
            Err(fatal) => {
                error!(error = %fatal, "Cannot start run, nothing was sent");
                return self.not_started(&fatal);
            }
        };
        for range in pool.ranges() {
            info!(
                target_system = target.name(),
                sender = %range.sender,
                start_sequence = range.start_sequence,
                "Starting {} run",
                config.scenario.test_type
            );
        }

        let counters = Arc::new(RunCounters::new(config.tracking.error_log_capacity));
        let (handle_tx, handle_rx) = mpsc::unbounded_channel();
        let submitter = Submitter::new(
            target.clone(),
            counters.clone(),
            RequestTemplate::from_config(config),
            config.target.max_consecutive_unreachable,
        )
        .with_handoff(handle_tx);
        let tracker = ConfirmationTracker::new(
            target.clone(),
            counters.clone(),
            TrackerConfig::from_config(config),
        );

        let load_start = Instant::now();
        let mut controller = RateController::new(
            config.schedule,
            StopCondition::from_scenario(&config.scenario, cancel),
        );
        let target_tps = controller.nominal_rate();
        let round_size = controller
            .is_round_based()
            .then(|| controller.window_size());

        let progress_done = CancellationToken::new();

        let sending = async {
            while let Some(window) = controller.next_window().await {
                let slots = pool.next(window.size);
                submitter.submit_window(slots).await;

                if controller.is_round_based() {
                    let took = window.opened_at.elapsed();
                    controller.record_round(took);
                    info!(
                        round = window.index + 1,
                        size = window.size,
                        took_ms = took.as_millis() as u64,
                        accepted = counters.accepted(),
                        rejected = counters.rejected(),
                        "Round dispatched"
                    );
                }

                if submitter.fatal().is_some() {
                    controller.halt();
                    break;
                }
            }

            let phase = SendingPhase {
                duration: load_start.elapsed(),
                rounds: controller.rounds().to_vec(),
                fatal: submitter.fatal(),
            };
            info!(
                sent = pool.issued(),
                duration_ms = phase.duration.as_millis() as u64,
                stop = ?controller.stop_reason(),
                in_flight = counters.in_flight(),
                "Sending complete, waiting for confirmations"
            );
            // Closes the handoff channel so the tracker can drain and finish.
            drop(submitter);
            phase
        };

        let tracking = async {
            let tracked = tracker.run(handle_rx).await;
            progress_done.cancel();
            tracked
        };

        let progress = report_progress(
            &counters,
            target.as_ref(),
            Duration::from_millis(config.worker.print_every_ms),
            &progress_done,
            load_start,
        );

        let (phase, tracked, ()) = tokio::join!(sending, tracking, progress);
        let total = load_start.elapsed();

        if let Some(fatal) = &phase.fatal {
            error!(error = %fatal, tracked, "Run aborted, summary is incomplete");
        } else {
            info!(tracked, total_ms = total.as_millis() as u64, "Tracking complete");
        }

        let snapshot = counters.snapshot();
        aggregate(&SummaryInput {
            test_type: &config.scenario.test_type,
            worker_id: &config.worker.id,
            timestamp: chrono::Utc::now(),
            counters: &snapshot,
            senders: &pool.ranges(),
            sending: phase.duration,
            total,
            rounds: &phase.rounds,
            round_size,
            target_tps,
            fatal: phase.fatal.as_ref().map(|e| e.to_string()),
        })
    }

    fn not_started(&self, fatal: &FatalError) -> RunSummary {
        aggregate(&SummaryInput {
            test_type: &self.config.scenario.test_type,
            worker_id: &self.config.worker.id,
            timestamp: chrono::Utc::now(),
            counters: &CountersSnapshot::default(),
            senders: &[],
            sending: Duration::ZERO,
            total: Duration::ZERO,
            rounds: &[],
            round_size: None,
            target_tps: None,
            fatal: Some(fatal.to_string()),
        })
    }
}

/// Periodic progress log until `done` fires. Diagnostic only.
async fn report_progress(
    counters: &RunCounters,
    target: &dyn TargetSystem,
    period: Duration,
    done: &CancellationToken,
    start: Instant,
) {
    if period.is_zero() {
        return;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let elapsed = start.elapsed().as_secs_f64();
        let attempted = counters.attempted();
        let rate = if elapsed > 0.0 {
            attempted as f64 / elapsed
        } else {
            0.0
        };
        let group = target.current_group_number().await;
        info!(
            attempted,
            accepted = counters.accepted(),
            rejected = counters.rejected(),
            confirmed = counters.confirmed(),
            timed_out = counters.timed_out(),
            in_flight = counters.in_flight(),
            elapsed_s = %format!("{:.2}", elapsed),
            tps = %format!("{:.2}", rate),
            group = ?group,
            "Progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScenarioConfig, ScheduleConfig, TargetConfig, TrackingConfig, WorkerConfig};
    use crate::simulated::SimulatedTarget;

    fn test_config(schedule: ScheduleConfig, total: u64) -> Config {
        Config {
            scenario: ScenarioConfig {
                test_type: "unit".to_string(),
                seed: 1,
                duration_ms: None,
                total_count: Some(total),
                memo: String::new(),
            },
            schedule,
            target: TargetConfig {
                senders: vec!["sender".to_string()],
                destinations: vec!["dest".to_string()],
                value: "1000".to_string(),
                resource_limit: 21_000,
                max_fee: 50,
                priority_fee: 1,
                confirmations: 1,
                confirm_timeout_ms: 1_000,
                max_consecutive_unreachable: 5,
            },
            tracking: TrackingConfig::default(),
            worker: WorkerConfig {
                id: "w0".to_string(),
                results_dir: "results".to_string(),
                print_every_ms: 0,
            },
            simulation: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_accounts_for_every_request() {
        let config = test_config(ScheduleConfig::FixedInterval { tps: 100, per_tick: 5 }, 42);
        let target = Arc::new(SimulatedTarget::new(9).with_starting_sequence(1_000));

        let summary = LoadRun::new(config, target.clone())
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.senders.len(), 1);
        assert_eq!(summary.senders[0].start_sequence, 1_000);
        assert_eq!(summary.senders[0].end_sequence, 1_042);
        assert_eq!(summary.total_attempted, 42);
        assert_eq!(summary.total_confirmed, 42);
        assert_eq!(summary.target_tps, Some(100));
        assert!(!summary.incomplete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_sequence_failure_still_summarizes() {
        let config = test_config(ScheduleConfig::FixedInterval { tps: 10, per_tick: 1 }, 3);
        let target = Arc::new(SimulatedTarget::new(9));
        target.set_unreachable(true);

        let summary = LoadRun::new(config, target.clone())
            .run(CancellationToken::new())
            .await;

        assert!(summary.incomplete);
        let fatal = summary.fatal_error.unwrap();
        assert!(fatal.contains("starting sequence for sender"), "{}", fatal);
        assert_eq!(summary.test_type, "unit");
        assert_eq!(summary.total_attempted, 0);
        assert_eq!(summary.success_rate, None);
        assert!(summary.senders.is_empty());
        assert!(target.submitted_sequences().is_empty());
    }
}
