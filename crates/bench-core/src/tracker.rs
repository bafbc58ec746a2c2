use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::counters::{ErrorStage, RunCounters};
use crate::error::ConfirmError;
use crate::submitter::{PendingHandle, TargetSystem};

/// Terminal result of tracking one accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// Processed by the target. `status_ok == false` counts as confirm-failed.
    Confirmed {
        grouping_key: u64,
        confirmed_at: Instant,
        status_ok: bool,
        latency: Duration,
    },
    TimedOut,
    TrackingError {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub timeout: Duration,
    pub confirmations: u64,
    /// Confirmation waits kept in flight at once
    pub batch_size: usize,
    pub progress_every: u64,
}

impl TrackerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.target.confirm_timeout(),
            confirmations: config.target.confirmations,
            batch_size: config.tracking.batch_size.max(1),
            progress_every: config.tracking.progress_every,
        }
    }
}

/// Waits for confirmation of accepted requests and classifies each exactly once.
pub struct ConfirmationTracker {
    target: Arc<dyn TargetSystem>,
    counters: Arc<RunCounters>,
    config: TrackerConfig,
    claimed: Mutex<HashSet<String>>,
    progress_mark: AtomicU64,
}

impl ConfirmationTracker {
    pub fn new(
        target: Arc<dyn TargetSystem>,
        counters: Arc<RunCounters>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            target,
            counters,
            config,
            claimed: Mutex::new(HashSet::new()),
            progress_mark: AtomicU64::new(0),
        }
    }

    fn claim(&self, handle: &PendingHandle) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone())
    }

    /// Wait for `handle` to confirm and fold the result into the counters.
    ///
    /// Returns `None` if the handle was already tracked; a second wait never counts twice.
    pub async fn track(&self, handle: PendingHandle) -> Option<ConfirmationResult> {
        if !self.claim(&handle) {
            debug!(sequence = handle.sequence, "Handle already tracked, ignoring");
            return None;
        }

        let wait = self.target.await_confirmation(
            &handle,
            self.config.confirmations,
            self.config.timeout,
        );

        let result = match timeout(self.config.timeout, wait).await {
            Err(_) | Ok(Err(ConfirmError::TimedOut)) => {
                self.counters.record_timed_out();
                self.counters.record_error(
                    &handle.sender,
                    handle.sequence,
                    ErrorStage::Confirm,
                    &ConfirmError::TimedOut.to_string(),
                );
                debug!(sequence = handle.sequence, "Confirmation timed out");
                ConfirmationResult::TimedOut
            }
            Ok(Err(ConfirmError::Tracking(reason))) => {
                self.counters.record_confirm_failed();
                self.counters.record_error(
                    &handle.sender,
                    handle.sequence,
                    ErrorStage::Confirm,
                    &reason,
                );
                ConfirmationResult::TrackingError { reason }
            }
            Ok(Ok(receipt)) => {
                let confirmed_at = Instant::now();
                let latency = confirmed_at.saturating_duration_since(handle.accepted_at);
                if receipt.status_ok {
                    self.counters.record_confirmed(receipt.grouping_key, latency);
                } else {
                    self.counters.record_confirm_failed();
                    self.counters.record_error(
                        &handle.sender,
                        handle.sequence,
                        ErrorStage::Confirm,
                        &format!("processed with failure status in group {}", receipt.grouping_key),
                    );
                }
                ConfirmationResult::Confirmed {
                    grouping_key: receipt.grouping_key,
                    confirmed_at,
                    status_ok: receipt.status_ok,
                    latency,
                }
            }
        };

        self.report_progress();
        Some(result)
    }

    /// Track every handle concurrently and wait for all of them, whatever their outcome.
    pub async fn track_batch(&self, handles: Vec<PendingHandle>) -> Vec<Option<ConfirmationResult>> {
        join_all(handles.into_iter().map(|handle| self.track(handle))).await
    }

    /// Drain handles from the submitter until the channel closes.
    ///
    /// Up to `batch_size` waits run at once, and a new handle takes the place of
    /// whichever wait finishes first, so a slow handle only ever holds its own slot.
    /// Returns the number of handles tracked.
    pub async fn run(&self, mut handles: mpsc::UnboundedReceiver<PendingHandle>) -> u64 {
        let tracked = AtomicU64::new(0);
        stream::poll_fn(|cx| handles.poll_recv(cx))
            .for_each_concurrent(self.config.batch_size.max(1), |handle| {
                let tracked = &tracked;
                async move {
                    if self.track(handle).await.is_some() {
                        tracked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;
        tracked.into_inner()
    }

    fn report_progress(&self) {
        let every = self.config.progress_every;
        if every == 0 {
            return;
        }
        let confirmed = self.counters.confirmed();
        let mark = confirmed / every;
        let prev = self.progress_mark.fetch_max(mark, Ordering::Relaxed);
        if mark > prev {
            info!(
                confirmed,
                accepted = self.counters.accepted(),
                in_flight = self.counters.in_flight(),
                "Confirmations progress"
            );
        }
    }
}
