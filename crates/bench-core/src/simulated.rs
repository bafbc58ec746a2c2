use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::SimulationConfig;
use crate::error::{ConfirmError, TargetError};
use crate::submitter::{PendingHandle, Receipt, Request, TargetSystem};

#[derive(Debug, Clone, Copy)]
struct Planned {
    ready_at: Instant,
    status_ok: bool,
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    submitted: Vec<(String, u64)>,
    used: HashSet<(String, u64)>,
    planned: HashMap<String, Planned>,
}

/// In-process target with configurable latency, grouping and failure behaviour.
///
/// Confirmations land in groups of `group_interval` wall-clock time, numbered from
/// `first_group`, unless a fixed group is set. Each sender can use a sequence number
/// only once; resubmitting it is rejected the way a real target rejects a stale nonce.
#[derive(Debug)]
pub struct SimulatedTarget {
    starting_sequence: u64,
    starting_sequences: HashMap<String, u64>,
    submit_latency: Duration,
    confirm_delay: Duration,
    group_interval: Duration,
    first_group: u64,
    fixed_group: Option<u64>,
    reject_probability: f64,
    failure_probability: f64,
    reject_sequences: HashSet<u64>,
    fail_sequences: HashSet<u64>,
    confirm_delays: HashMap<u64, Duration>,
    unreachable: AtomicBool,
    started: Instant,
    state: Mutex<SimState>,
}

impl SimulatedTarget {
    pub fn new(seed: u64) -> Self {
        Self {
            starting_sequence: 0,
            starting_sequences: HashMap::new(),
            submit_latency: Duration::ZERO,
            confirm_delay: Duration::from_millis(10),
            group_interval: Duration::from_secs(1),
            first_group: 1,
            fixed_group: None,
            reject_probability: 0.0,
            failure_probability: 0.0,
            reject_sequences: HashSet::new(),
            fail_sequences: HashSet::new(),
            confirm_delays: HashMap::new(),
            unreachable: AtomicBool::new(false),
            started: Instant::now(),
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                submitted: Vec::new(),
                used: HashSet::new(),
                planned: HashMap::new(),
            }),
        }
    }

    pub fn from_config(config: &SimulationConfig, seed: u64) -> Self {
        Self::new(seed)
            .with_starting_sequence(config.starting_sequence)
            .with_submit_latency(Duration::from_millis(config.submit_latency_ms))
            .with_confirm_delay(Duration::from_millis(config.confirm_delay_ms))
            .with_group_interval(Duration::from_millis(config.group_interval_ms), config.first_group)
            .with_reject_probability(config.reject_probability)
            .with_failure_probability(config.failure_probability)
    }

    pub fn with_starting_sequence(mut self, sequence: u64) -> Self {
        self.starting_sequence = sequence;
        self
    }

    /// Starting sequence of one sender, overriding the shared default.
    pub fn with_starting_sequence_for(mut self, sender: &str, sequence: u64) -> Self {
        self.starting_sequences.insert(sender.to_string(), sequence);
        self
    }

    pub fn with_submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = latency;
        self
    }

    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    /// Override the confirmation delay of one sequence number.
    pub fn with_confirm_delay_for(mut self, sequence: u64, delay: Duration) -> Self {
        self.confirm_delays.insert(sequence, delay);
        self
    }

    pub fn with_group_interval(mut self, interval: Duration, first_group: u64) -> Self {
        self.group_interval = interval;
        self.first_group = first_group;
        self
    }

    /// Confirm everything into one group.
    pub fn with_fixed_group(mut self, group: u64) -> Self {
        self.fixed_group = Some(group);
        self
    }

    pub fn with_reject_probability(mut self, p: f64) -> Self {
        self.reject_probability = p.clamp(0.0, 1.0);
        self
    }

    pub fn with_failure_probability(mut self, p: f64) -> Self {
        self.failure_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Reject this sequence number at submission.
    pub fn reject_sequence(mut self, sequence: u64) -> Self {
        self.reject_sequences.insert(sequence);
        self
    }

    /// Accept this sequence number but process it with a failure status.
    pub fn fail_sequence(mut self, sequence: u64) -> Self {
        self.fail_sequences.insert(sequence);
        self
    }

    /// Make every submission fail as if the connection were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every sequence number ever submitted, in arrival order, whatever the sender.
    pub fn submitted_sequences(&self) -> Vec<u64> {
        self.state().submitted.iter().map(|(_, seq)| *seq).collect()
    }

    /// Sequence numbers submitted by `sender`, in arrival order.
    pub fn submitted_by(&self, sender: &str) -> Vec<u64> {
        self.state()
            .submitted
            .iter()
            .filter(|(s, _)| s == sender)
            .map(|(_, seq)| *seq)
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn group_at(&self, at: Instant) -> u64 {
        if let Some(group) = self.fixed_group {
            return group;
        }
        let interval_ms = self.group_interval.as_millis().max(1);
        let elapsed_ms = at.saturating_duration_since(self.started).as_millis();
        self.first_group + (elapsed_ms / interval_ms) as u64
    }

    fn accept(&self, request: &Request) -> Result<String, TargetError> {
        let key = (request.sender.clone(), request.sequence);
        let mut state = self.state();
        state.submitted.push(key.clone());

        if state.used.contains(&key) {
            return Err(TargetError::Rejected(format!(
                "nonce too low: sequence {} already used by {}",
                request.sequence, request.sender
            )));
        }
        let p = self.reject_probability;
        if self.reject_sequences.contains(&request.sequence) || state.rng.gen_bool(p) {
            return Err(TargetError::Rejected(
                "replacement transaction underpriced".to_string(),
            ));
        }
        state.used.insert(key);

        let id = format!("0x{:016x}{:016x}", request.sequence, state.rng.gen::<u64>());
        let p = self.failure_probability;
        let status_ok = !(self.fail_sequences.contains(&request.sequence) || state.rng.gen_bool(p));
        let delay = self
            .confirm_delays
            .get(&request.sequence)
            .copied()
            .unwrap_or(self.confirm_delay);
        state.planned.insert(
            id.clone(),
            Planned {
                ready_at: Instant::now() + delay,
                status_ok,
            },
        );
        Ok(id)
    }
}

impl TargetSystem for SimulatedTarget {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn get_starting_sequence<'a>(
        &'a self,
        sender: &'a str,
    ) -> BoxFuture<'a, Result<u64, TargetError>> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(TargetError::Unreachable("connection refused".to_string()));
            }
            Ok(self
                .starting_sequences
                .get(sender)
                .copied()
                .unwrap_or(self.starting_sequence))
        })
    }

    fn submit<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<String, TargetError>> {
        Box::pin(async move {
            if !self.submit_latency.is_zero() {
                sleep(self.submit_latency).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(TargetError::Unreachable("connection refused".to_string()));
            }
            self.accept(request)
        })
    }

    fn await_confirmation<'a>(
        &'a self,
        handle: &'a PendingHandle,
        confirmations: u64,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Receipt, ConfirmError>> {
        Box::pin(async move {
            let planned = self.state().planned.get(&handle.id).copied();
            let Some(planned) = planned else {
                return Err(ConfirmError::Tracking(format!("unknown handle {}", handle.id)));
            };

            let extra = self.group_interval * confirmations.saturating_sub(1) as u32;
            let ready_at = planned.ready_at + extra;
            let deadline = Instant::now() + timeout;
            if ready_at > deadline {
                sleep_until(deadline).await;
                return Err(ConfirmError::TimedOut);
            }

            sleep_until(ready_at).await;
            Ok(Receipt {
                grouping_key: self.group_at(planned.ready_at),
                status_ok: planned.status_ok,
            })
        })
    }

    fn current_group_number(&self) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move { Some(self.group_at(Instant::now())) })
    }
}
