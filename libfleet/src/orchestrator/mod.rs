//! The Fleet Orchestrator. Runs one [`FleetAction`] against many targets with
//! a bounded number in flight, reports progress as [`JobEvent`]s and honors
//! cooperative cancellation.
//!
//! All job bookkeeping happens on a single driver task. Workers are spawned
//! per target and hand their [`TargetResult`] back through a completion
//! stream; they never touch the job directly.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionError, FleetAction};
use crate::executor::{ExecError, TargetExecutor};
use crate::job::{FleetJob, JobId, TargetResult, TargetState};
use crate::log::*;
use crate::target::TargetDescriptor;

/// Per-target budget used when no positive timeout is configured.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(90);

/// Extra time an executor gets past its own deadline before the orchestrator
/// gives up on it.
pub const EXECUTOR_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub type JobEventTx = mpsc::Sender<JobEvent>;
pub type JobEventRx = mpsc::Receiver<JobEvent>;

/// Notifications for one job, in order: one `Started`, one `Progress` per
/// target reaching a terminal state, then one `Finished`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started(FleetJob),
    Progress {
        job: FleetJob,
        done: usize,
        total: usize,
    },
    Finished(FleetJob),
}

/// Rejections from [`Orchestrator::start`] and configuration setters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("a job is already running")]
    AlreadyRunning,
    #[error("no targets selected")]
    NoTargets,
    #[error("target index {index} is out of range ({len} targets)")]
    TargetOutOfRange { index: usize, len: usize },
    #[error("target index {0} was selected more than once")]
    DuplicateTarget(usize),
    #[error("max concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("invalid action: {0}")]
    InvalidAction(#[from] ActionError),
    #[error("no tokio runtime available to drive the job")]
    NoRuntime,
}

/// Create the event channel an [`Orchestrator`] reports on.
pub fn events(capacity: usize) -> (JobEventTx, JobEvents) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, JobEvents::new(rx))
}

/// Consumer side of the event channel.
#[derive(Debug)]
pub struct JobEvents {
    rx: JobEventRx,
}

impl JobEvents {
    pub fn new(rx: JobEventRx) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Skip ahead to the next `Finished` event.
    pub async fn finished(&mut self) -> Option<FleetJob> {
        while let Some(event) = self.rx.recv().await {
            if let JobEvent::Finished(job) = event {
                return Some(job);
            }
        }
        None
    }

    pub fn into_inner(self) -> JobEventRx {
        self.rx
    }
}

#[derive(Debug)]
pub struct Orchestrator<E: TargetExecutor> {
    executor: Arc<E>,
    events: JobEventTx,
    max_concurrency: usize,
    command_timeout: Duration,
    running: Arc<AtomicBool>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl<E: TargetExecutor> Orchestrator<E> {
    pub fn new(executor: E, events: JobEventTx) -> Self {
        Self {
            executor: Arc::new(executor),
            events,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Bound the number of targets in flight for subsequent jobs.
    pub fn set_max_concurrency(&mut self, n: usize) -> Result<(), OrchestratorError> {
        if n == 0 {
            return Err(OrchestratorError::InvalidConcurrency);
        }
        self.max_concurrency = n;
        Ok(())
    }

    /// Per-target wall-clock budget for subsequent jobs. Zero selects
    /// [`DEFAULT_COMMAND_TIMEOUT`].
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = if timeout.is_zero() {
            DEFAULT_COMMAND_TIMEOUT
        } else {
            timeout
        };
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// True from a successful [`Orchestrator::start`] until the job's
    /// `Finished` event has been queued. Once this reads false the next job
    /// may start; its events follow the previous `Finished`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation of the running job. Targets not yet
    /// dispatched end up `Canceled`; in-flight ones finish normally.
    pub fn cancel(&self) {
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_running() {
            return;
        }
        info!("cancellation requested");
        token.cancel();
    }

    /// Start running `action` against `targets[i]` for every `i` in
    /// `selection`. Returns as soon as the job is scheduled; everything else
    /// is reported through [`JobEvent`]s.
    #[tracing::instrument(skip(self, targets))]
    pub fn start(
        &self,
        targets: &[TargetDescriptor],
        selection: &[usize],
        action: FleetAction,
    ) -> Result<JobId, OrchestratorError> {
        if selection.is_empty() {
            return Err(OrchestratorError::NoTargets);
        }
        action.validate()?;
        let mut selection = selection.to_vec();
        selection.sort_unstable();
        let mut seen = HashSet::with_capacity(selection.len());
        for &index in &selection {
            if index >= targets.len() {
                return Err(OrchestratorError::TargetOutOfRange {
                    index,
                    len: targets.len(),
                });
            }
            if !seen.insert(index) {
                return Err(OrchestratorError::DuplicateTarget(index));
            }
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;

        // Swap in the new job's token under the same lock `cancel` takes, so
        // a cancel racing this start lands on the new job.
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        *token = cancel.clone();
        drop(token);

        let selected: Vec<(usize, TargetDescriptor)> = selection
            .iter()
            .map(|&index| (index, targets[index].clone()))
            .collect();
        let job = FleetJob::new(action, &selected);
        let id = job.id().clone();

        let driver = Driver {
            job,
            targets: selected.into_iter().map(|(_, target)| target).collect(),
            executor: self.executor.clone(),
            events: self.events.clone(),
            max_concurrency: self.max_concurrency,
            timeout: self.command_timeout,
            cancel,
            running: self.running.clone(),
            token_slot: self.cancel.clone(),
        };
        info!("starting job {} on {} targets", &id, selection.len());
        runtime.spawn(driver.run());
        Ok(id)
    }
}

type Unit = Pin<Box<dyn Future<Output = (usize, TargetResult)> + Send>>;

/// Owns one job from `Started` to `Finished`.
struct Driver<E: TargetExecutor> {
    job: FleetJob,
    /// Descriptors by slot, aligned with `job.results`.
    targets: Vec<TargetDescriptor>,
    executor: Arc<E>,
    events: JobEventTx,
    max_concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    /// The orchestrator's token slot, held while `running` is cleared.
    token_slot: Arc<Mutex<CancellationToken>>,
}

impl<E: TargetExecutor> Driver<E> {
    async fn run(mut self) {
        audit_job_started(&self.job);
        self.emit(JobEvent::Started(self.job.clone())).await;

        let total = self.targets.len();
        let mut pending: VecDeque<usize> = (0..total).collect();
        let mut in_flight: FuturesUnordered<Unit> = FuturesUnordered::new();
        let mut done = 0;
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                while let Some(slot) = pending.pop_front() {
                    self.cancel_slot(slot);
                    done += 1;
                    self.progress(slot, done, total).await;
                }
            }
            while in_flight.len() < self.max_concurrency {
                let Some(slot) = pending.pop_front() else {
                    break;
                };
                in_flight.push(self.dispatch(slot));
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((slot, result)) = in_flight.next() => {
                    self.job.set_result(slot, result);
                    done += 1;
                    self.progress(slot, done, total).await;
                }
                _ = cancel.cancelled(), if !pending.is_empty() => {
                    debug!("job {} canceled with {} targets pending", self.job.id(), pending.len());
                }
            }
        }

        self.job.finish();
        audit_job_finished(&self.job);
        self.finish().await;
    }

    /// Queue `Finished` and clear `running` together, under the lock `start`
    /// takes, so a following job's `Started` can never overtake it.
    async fn finish(&self) {
        let finished = JobEvent::Finished(self.job.clone());
        match self.events.reserve().await {
            Ok(permit) => {
                let _slot = self.token_slot.lock().unwrap_or_else(PoisonError::into_inner);
                self.running.store(false, Ordering::SeqCst);
                permit.send(finished);
            }
            Err(_) => {
                debug!("event receiver dropped for job {}", self.job.id());
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn cancel_slot(&mut self, slot: usize) {
        if let Some(result) = self.job.result_mut(slot) {
            if let Err(err) = result.cancel() {
                error!("{}", err);
            }
        }
    }

    /// Move `slot` to `Running` and spawn its worker.
    fn dispatch(&mut self, slot: usize) -> Unit {
        let index = self.job.targets()[slot];
        if let Some(result) = self.job.result_mut(slot) {
            if let Err(err) = result.start() {
                error!("{}", err);
            }
        }
        let target = self.targets[slot].clone();
        let executor = self.executor.clone();
        let action = self.job.action().clone();
        let timeout = self.timeout;
        debug!("dispatching {} (index {})", target.name(), index);

        Box::pin(async move {
            let started = Instant::now();
            let worker_target = target.clone();
            let mut handle = tokio::spawn(async move {
                executor.run(index, &worker_target, &action, timeout).await
            });

            let deadline = timeout.saturating_add(EXECUTOR_GRACE);
            let result = match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(result)) => checked(result, index, &target, started),
                Ok(Err(join_error)) => {
                    let mut result = TargetResult::running(index, &target);
                    result.force_fail(
                        format!("executor panicked: {}", join_error),
                        started.elapsed(),
                    );
                    result
                }
                Err(_) => {
                    warn!("executor overran its deadline for {}; aborting", target);
                    handle.abort();
                    let mut result = TargetResult::running(index, &target);
                    result.force_fail(ExecError::TimedOut.to_string(), started.elapsed());
                    result
                }
            };
            (slot, result)
        })
    }

    async fn progress(&mut self, slot: usize, done: usize, total: usize) {
        if let Some(result) = self.job.results().get(slot) {
            audit_target_finished(&self.job, result);
        }
        self.emit(JobEvent::Progress {
            job: self.job.clone(),
            done,
            total,
        })
        .await;
    }

    async fn emit(&self, event: JobEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped for job {}", self.job.id());
        }
    }
}

/// Repair executor output that breaks the contract: wrong index or a
/// non-terminal state.
fn checked(
    mut result: TargetResult,
    index: usize,
    target: &TargetDescriptor,
    started: Instant,
) -> TargetResult {
    if *result.target_index() != index {
        error!(
            "executor returned result for index {} instead of {}",
            result.target_index(),
            index
        );
        let mut repaired = TargetResult::running(index, target);
        repaired.force_fail("executor returned a result for the wrong target", started.elapsed());
        return repaired;
    }
    // `Canceled` is only reachable from `Queued`, never after dispatch.
    if !result.is_terminal() || *result.state() == TargetState::Canceled {
        error!("executor returned a {} result for {}", result.state(), target);
        result.force_fail("executor returned without a final state", started.elapsed());
    }
    result
}

#[cfg(test)]
mod tests;
