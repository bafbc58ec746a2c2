use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::counters::{ErrorStage, RunCounters};
use crate::error::{ConfirmError, FatalError, TargetError};
use crate::sequence::Slot;

/// Submission errors past this count are logged at debug level only.
const LOGGED_SUBMIT_ERRORS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingParams {
    pub max_fee: u64,
    pub priority_fee: u64,
}

/// One unit of work. Immutable once built.
#[derive(Debug, Clone)]
pub struct Request {
    pub sequence: u64,
    pub sender: String,
    pub destination: String,
    pub value: String,
    pub memo: Option<String>,
    pub resource_limit: u64,
    pub pricing: PricingParams,
    pub created_at: Instant,
}

/// Handle for a request the target accepted and has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub sender: String,
    pub sequence: u64,
    pub id: String,
    pub accepted_at: Instant,
}

/// What the target reports once a request has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Processing unit (e.g. block number) that included the request
    pub grouping_key: u64,
    pub status_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted {
        handle: PendingHandle,
        dispatched_at: Instant,
    },
    Rejected {
        sender: String,
        sequence: u64,
        reason: String,
        dispatched_at: Instant,
    },
}

impl SubmissionOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            SubmissionOutcome::Accepted { handle, .. } => handle.sequence,
            SubmissionOutcome::Rejected { sequence, .. } => *sequence,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }
}

/// The system under test, reachable only through submit / await-confirmation.
pub trait TargetSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Next sequence number the target expects from `sender`.
    fn get_starting_sequence<'a>(
        &'a self,
        sender: &'a str,
    ) -> BoxFuture<'a, Result<u64, TargetError>>;

    /// Submit a request; returns the target's identifier for it.
    fn submit<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<String, TargetError>>;

    fn await_confirmation<'a>(
        &'a self,
        handle: &'a PendingHandle,
        confirmations: u64,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Receipt, ConfirmError>>;

    /// Current processing unit number, for progress reporting only.
    fn current_group_number(&self) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async { None })
    }
}

/// Everything except the slot that goes into a request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub senders: Vec<String>,
    pub destinations: Vec<String>,
    pub value: String,
    pub memo: Option<String>,
    pub resource_limit: u64,
    pub pricing: PricingParams,
}

impl RequestTemplate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            senders: config.target.senders.clone(),
            destinations: config.target.destinations.clone(),
            value: config.target.value.clone(),
            memo: config.memo(),
            resource_limit: config.target.resource_limit,
            pricing: PricingParams {
                max_fee: config.target.max_fee,
                priority_fee: config.target.priority_fee,
            },
        }
    }

    /// Build the request for `slot`; destinations rotate round-robin by request index.
    pub fn build(&self, slot: Slot) -> Request {
        let pick = |list: &[String], idx: u64| {
            if list.is_empty() {
                String::new()
            } else {
                list[(idx % list.len() as u64) as usize].clone()
            }
        };
        Request {
            sequence: slot.sequence,
            sender: pick(&self.senders, slot.sender as u64),
            destination: pick(&self.destinations, slot.index),
            value: self.value.clone(),
            memo: self.memo.clone(),
            resource_limit: self.resource_limit,
            pricing: self.pricing,
            created_at: Instant::now(),
        }
    }
}

/// Issues one submission per sequence number and tallies the outcome.
///
/// Accepted handles are forwarded to the confirmation tracker through the handoff
/// channel; dropping the submitter closes it.
pub struct Submitter {
    target: Arc<dyn TargetSystem>,
    counters: Arc<RunCounters>,
    template: RequestTemplate,
    handoff: Option<mpsc::UnboundedSender<PendingHandle>>,
    max_consecutive_unreachable: u64,
    consecutive_unreachable: AtomicU64,
    fatal: Mutex<Option<FatalError>>,
}

impl Submitter {
    pub fn new(
        target: Arc<dyn TargetSystem>,
        counters: Arc<RunCounters>,
        template: RequestTemplate,
        max_consecutive_unreachable: u64,
    ) -> Self {
        Self {
            target,
            counters,
            template,
            handoff: None,
            max_consecutive_unreachable,
            consecutive_unreachable: AtomicU64::new(0),
            fatal: Mutex::new(None),
        }
    }

    pub fn with_handoff(mut self, handoff: mpsc::UnboundedSender<PendingHandle>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn build_request(&self, slot: Slot) -> Request {
        self.template.build(slot)
    }

    /// Submit exactly once for `slot`. Never retried, never reused.
    pub async fn submit(&self, slot: Slot) -> SubmissionOutcome {
        let request = self.build_request(slot);
        let sequence = request.sequence;
        self.counters.record_attempted();
        let dispatched_at = Instant::now();

        let result = self.target.submit(&request).await;
        match result {
            Ok(id) => {
                self.consecutive_unreachable.store(0, Ordering::SeqCst);
                self.counters.record_accepted();
                let handle = PendingHandle {
                    sender: request.sender.clone(),
                    sequence,
                    id,
                    accepted_at: Instant::now(),
                };
                if let Some(handoff) = &self.handoff {
                    if handoff.send(handle.clone()).is_err() {
                        warn!(sequence, "Confirmation tracker is gone, handle not tracked");
                    }
                }
                debug!(sequence, id = %handle.id, "Request accepted");
                SubmissionOutcome::Accepted {
                    handle,
                    dispatched_at,
                }
            }
            Err(e) => {
                match &e {
                    TargetError::Unreachable(reason) => self.note_unreachable(reason),
                    TargetError::Rejected(_) => {
                        self.consecutive_unreachable.store(0, Ordering::SeqCst);
                    }
                }

                let reason = e.to_string();
                self.counters.record_rejected();
                self.counters
                    .record_error(&request.sender, sequence, ErrorStage::Submit, &reason);
                if self.counters.rejected() <= LOGGED_SUBMIT_ERRORS {
                    warn!(sender = %request.sender, sequence, error = %e, "Submission failed");
                } else {
                    debug!(sender = %request.sender, sequence, error = %e, "Submission failed");
                }

                SubmissionOutcome::Rejected {
                    sender: request.sender,
                    sequence,
                    reason,
                    dispatched_at,
                }
            }
        }
    }

    /// Submit every slot concurrently and wait for all outcomes.
    pub async fn submit_window(&self, slots: Vec<Slot>) -> Vec<SubmissionOutcome> {
        join_all(slots.into_iter().map(|slot| self.submit(slot))).await
    }

    fn note_unreachable(&self, reason: &str) {
        let consecutive = self.consecutive_unreachable.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_consecutive_unreachable == 0 || consecutive < self.max_consecutive_unreachable {
            return;
        }

        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            error!(consecutive, error = reason, "Target unreachable, aborting run");
            *fatal = Some(FatalError::TargetUnreachable {
                consecutive,
                last_error: reason.to_string(),
            });
        }
    }

    /// Set once the target has been unreachable for too long.
    pub fn fatal(&self) -> Option<FatalError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
