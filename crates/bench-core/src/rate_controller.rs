use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{ScenarioConfig, ScheduleConfig};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// When the dispatch loop must stop opening windows.
#[derive(Debug, Clone, Default)]
pub struct StopCondition {
    pub duration: Option<Duration>,
    pub total: Option<u64>,
    pub cancel: CancellationToken,
}

impl StopCondition {
    pub fn from_scenario(scenario: &ScenarioConfig, cancel: CancellationToken) -> Self {
        Self {
            duration: scenario.duration_ms.map(Duration::from_millis),
            total: scenario.total_count,
            cancel,
        }
    }

    pub fn total(total: u64) -> Self {
        Self {
            total: Some(total),
            ..Default::default()
        }
    }

    pub fn duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    TotalReached,
    Cancelled,
    Halted,
}

/// One dispatch window: every request in it may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: u64,
    pub size: u64,
    pub opened_at: Instant,
}

/// Paces the dispatch loop according to a `ScheduleConfig`.
///
/// Fixed-interval pacing waits only for whatever is left of the nominal interval
/// since the previous window opened, so slow submissions eat into the wait instead
/// of stretching the schedule. Round-based pacing opens rounds back-to-back with an
/// optional fixed delay; its realized rate is measured through `record_round`.
#[derive(Debug)]
pub struct RateController {
    schedule: ScheduleConfig,
    stop: StopCondition,
    start: Instant,
    issued: u64,
    windows: u64,
    last_dispatch: Option<Instant>,
    rounds: Vec<Duration>,
    stopped: Option<StopReason>,
}

impl RateController {
    pub fn new(schedule: ScheduleConfig, stop: StopCondition) -> Self {
        Self {
            schedule,
            stop,
            start: Instant::now(),
            issued: 0,
            windows: 0,
            last_dispatch: None,
            rounds: Vec::new(),
            stopped: None,
        }
    }

    /// Requests in a full window.
    pub fn window_size(&self) -> u64 {
        match self.schedule {
            ScheduleConfig::FixedInterval { per_tick, .. } => per_tick,
            ScheduleConfig::RoundBased {
                batch_size,
                concurrency,
                ..
            } => batch_size.saturating_mul(concurrency),
        }
    }

    /// Nominal spacing between fixed-interval windows.
    pub fn interval(&self) -> Option<Duration> {
        match self.schedule {
            ScheduleConfig::FixedInterval { tps, per_tick } if tps > 0 => Some(
                Duration::from_micros(per_tick.saturating_mul(MICROS_PER_SECOND) / tps),
            ),
            _ => None,
        }
    }

    /// Target rate, when the policy has one.
    pub fn nominal_rate(&self) -> Option<u64> {
        match self.schedule {
            ScheduleConfig::FixedInterval { tps, .. } => Some(tps),
            ScheduleConfig::RoundBased { .. } => None,
        }
    }

    /// Wait for the next window to open. `None` once the stop condition holds.
    pub async fn next_window(&mut self) -> Option<Window> {
        if self.check_stop() {
            return None;
        }

        let wait = self.pacing_delay();
        if !wait.is_zero() {
            tokio::select! {
                _ = self.stop.cancel.cancelled() => {}
                _ = sleep(wait) => {}
            }
            if self.check_stop() {
                return None;
            }
        }

        let mut size = self.window_size();
        if let Some(total) = self.stop.total {
            size = size.min(total - self.issued);
        }

        let now = Instant::now();
        let window = Window {
            index: self.windows,
            size,
            opened_at: now,
        };
        self.last_dispatch = Some(now);
        self.issued += size;
        self.windows += 1;
        Some(window)
    }

    fn pacing_delay(&self) -> Duration {
        match self.schedule {
            ScheduleConfig::FixedInterval { .. } => {
                match (self.last_dispatch, self.interval()) {
                    (Some(last), Some(interval)) => interval.saturating_sub(last.elapsed()),
                    _ => Duration::ZERO,
                }
            }
            ScheduleConfig::RoundBased { round_delay_ms, .. } => {
                if self.windows > 0 {
                    Duration::from_millis(round_delay_ms)
                } else {
                    Duration::ZERO
                }
            }
        }
    }

    fn check_stop(&mut self) -> bool {
        if self.stopped.is_some() {
            return true;
        }
        let reason = if self.stop.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.stop.total.is_some_and(|total| self.issued >= total) {
            Some(StopReason::TotalReached)
        } else if self
            .stop
            .duration
            .is_some_and(|duration| self.start.elapsed() >= duration)
        {
            Some(StopReason::DurationElapsed)
        } else {
            None
        };
        self.stopped = reason;
        reason.is_some()
    }

    /// Stop opening windows, e.g. after a fatal error.
    pub fn halt(&mut self) {
        if self.stopped.is_none() {
            self.stopped = Some(StopReason::Halted);
        }
    }

    /// Record the wall-clock time a round took to dispatch.
    pub fn record_round(&mut self, duration: Duration) {
        self.rounds.push(duration);
    }

    pub fn rounds(&self) -> &[Duration] {
        &self.rounds
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Requests issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn windows(&self) -> u64 {
        self.windows
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn is_round_based(&self) -> bool {
        matches!(self.schedule, ScheduleConfig::RoundBased { .. })
    }

    pub fn plan(&self) -> SchedulePlan {
        SchedulePlan {
            schedule: self.schedule,
            window_size: self.window_size(),
            interval: self.interval(),
            duration: self.stop.duration,
            total: self.stop.total,
        }
    }
}

/// Static description of a schedule, printed before a run.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub schedule: ScheduleConfig,
    pub window_size: u64,
    pub interval: Option<Duration>,
    pub duration: Option<Duration>,
    pub total: Option<u64>,
}

impl SchedulePlan {
    /// Requests the schedule would issue if it ran to its bound, when that is knowable.
    pub fn expected_requests(&self) -> Option<u64> {
        let by_duration = match (self.schedule, self.duration) {
            (ScheduleConfig::FixedInterval { tps, .. }, Some(d)) => {
                Some(tps.saturating_mul(d.as_millis() as u64) / 1000)
            }
            _ => None,
        };
        match (by_duration, self.total) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl fmt::Display for SchedulePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.schedule {
            ScheduleConfig::FixedInterval { tps, per_tick } => {
                writeln!(f, "Policy: fixed-interval, {} TPS", tps)?;
                writeln!(f, "Window: {} request(s) per tick", per_tick)?;
                if let Some(interval) = self.interval {
                    writeln!(f, "Interval: {}us", interval.as_micros())?;
                }
            }
            ScheduleConfig::RoundBased {
                batch_size,
                concurrency,
                round_delay_ms,
            } => {
                writeln!(f, "Policy: round-based")?;
                writeln!(
                    f,
                    "Round: {} x {} = {} requests",
                    batch_size, concurrency, self.window_size
                )?;
                writeln!(f, "Inter-round delay: {}ms", round_delay_ms)?;
            }
        }
        if let Some(d) = self.duration {
            writeln!(f, "Duration: {}ms", d.as_millis())?;
        }
        if let Some(total) = self.total {
            writeln!(f, "Total cap: {}", total)?;
        }
        match self.expected_requests() {
            Some(n) => write!(f, "Expected requests: {}", n),
            None => write!(f, "Expected requests: bounded by realized round rate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(tps: u64, per_tick: u64) -> ScheduleConfig {
        ScheduleConfig::FixedInterval { tps, per_tick }
    }

    fn rounds(batch_size: u64, concurrency: u64, round_delay_ms: u64) -> ScheduleConfig {
        ScheduleConfig::RoundBased {
            batch_size,
            concurrency,
            round_delay_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_paces_total() {
        let mut controller = RateController::new(fixed(10, 1), StopCondition::total(100));
        let start = Instant::now();

        let mut count = 0;
        while let Some(window) = controller.next_window().await {
            assert_eq!(window.size, 1);
            count += window.size;
        }

        assert_eq!(count, 100);
        assert_eq!(controller.issued(), 100);
        assert_eq!(controller.stop_reason(), Some(StopReason::TotalReached));

        let elapsed = start.elapsed().as_secs_f64();
        assert!((elapsed - 10.0).abs() <= 1.0, "elapsed: {}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_subtracts_dispatch_time() {
        let mut controller = RateController::new(fixed(10, 1), StopCondition::total(3));

        let first = controller.next_window().await.unwrap();
        // Dispatch takes 60ms of the 100ms interval.
        sleep(Duration::from_millis(60)).await;
        let second = controller.next_window().await.unwrap();
        let gap = second.opened_at - first.opened_at;
        assert!(
            gap >= Duration::from_millis(100) && gap <= Duration::from_millis(101),
            "gap: {:?}",
            gap
        );

        // Dispatch overran the interval: no extra wait.
        sleep(Duration::from_millis(150)).await;
        let before = Instant::now();
        let third = controller.next_window().await.unwrap();
        assert!(third.opened_at - before <= Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_batched_ticks() {
        // 500 TPS in 50-request ticks: one tick every 100ms.
        let mut controller = RateController::new(fixed(500, 50), StopCondition::total(120));
        assert_eq!(controller.interval(), Some(Duration::from_millis(100)));

        let mut sizes = Vec::new();
        while let Some(window) = controller.next_window().await {
            sizes.push(window.size);
        }
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_based_counts() {
        let mut controller = RateController::new(rounds(5, 2, 0), StopCondition::total(35));

        let mut sent = 0;
        for k in 1..=3u64 {
            let window = controller.next_window().await.unwrap();
            assert_eq!(window.size, 10);
            sent += window.size;
            assert_eq!(sent, 10 * k);
            assert_eq!(controller.issued(), 10 * k);
        }

        // Final round is clamped to the remaining total.
        assert_eq!(controller.next_window().await.unwrap().size, 5);
        assert!(controller.next_window().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_based_delay_and_duration() {
        let mut controller = RateController::new(
            rounds(1, 1, 100),
            StopCondition::duration(Duration::from_millis(350)),
        );

        let mut opened = Vec::new();
        while let Some(window) = controller.next_window().await {
            opened.push(window.opened_at);
            controller.record_round(Duration::from_millis(1));
        }

        // Rounds open at 0, 100, 200, 300ms.
        assert_eq!(opened.len(), 4);
        assert_eq!(controller.rounds().len(), 4);
        assert_eq!(controller.stop_reason(), Some(StopReason::DurationElapsed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let stop = StopCondition {
            cancel: cancel.clone(),
            ..Default::default()
        };
        let mut controller = RateController::new(fixed(1, 1), stop);
        assert!(controller.next_window().await.is_some());

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        assert!(controller.next_window().await.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.stop_reason(), Some(StopReason::Cancelled));
        canceller.await.unwrap();
    }

    #[test]
    fn test_plan_expected_requests() {
        let controller = RateController::new(
            fixed(500, 50),
            StopCondition::duration(Duration::from_secs(30)),
        );
        let plan = controller.plan();
        assert_eq!(plan.expected_requests(), Some(15_000));
        assert!(plan.to_string().contains("500 TPS"));

        let controller = RateController::new(rounds(500, 2, 100), StopCondition::total(7));
        assert_eq!(controller.plan().expected_requests(), Some(7));
        assert_eq!(controller.window_size(), 1000);
        assert_eq!(controller.nominal_rate(), None);
    }
}
