//! Fleet jobs and per-target results.
//!
//! A [`FleetJob`] is owned by the orchestrator for its whole lifetime; callers
//! only ever see clones of it, taken at each notification.

use std::fmt;
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::action::FleetAction;
use crate::target::{Port, TargetDescriptor};

/// Error string carried by targets skipped due to cancellation.
pub const CANCELED_BEFORE_START: &str = "canceled before start";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-target state. `Queued → Running → {Ok | Failed}`, or
/// `Queued → Canceled` when cancellation is observed before dispatch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Queued,
    Running,
    Ok,
    Failed,
    Canceled,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TargetState::Ok | TargetState::Failed | TargetState::Canceled)
    }

    pub fn can_transition_to(self, next: TargetState) -> bool {
        matches!(
            (self, next),
            (TargetState::Queued, TargetState::Running)
                | (TargetState::Queued, TargetState::Canceled)
                | (TargetState::Running, TargetState::Ok)
                | (TargetState::Running, TargetState::Failed)
        )
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetState::Queued => "queued",
            TargetState::Running => "running",
            TargetState::Ok => "ok",
            TargetState::Failed => "failed",
            TargetState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid transition for target {index}: {from} -> {to}")]
    InvalidTransition {
        index: usize,
        from: TargetState,
        to: TargetState,
    },
}

/// The outcome of one fleet action against one target. Identity fields are
/// copied from the descriptor so the result stays readable after the job.
#[derive(Getters, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetResult {
    target_index: usize,
    name: String,
    group: String,
    user: String,
    host: String,
    port: Port,
    state: TargetState,
    duration: Duration,
    stdout: String,
    stderr: String,
    /// High-level failure description, distinct from the remote stderr.
    error: Option<String>,
}

impl TargetResult {
    pub fn queued(target_index: usize, target: &TargetDescriptor) -> Self {
        Self {
            target_index,
            name: target.name().clone(),
            group: target.group().clone(),
            user: target.user().clone(),
            host: target.host().clone(),
            port: *target.port(),
            state: TargetState::Queued,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }

    /// A result already in `Running`, as handed to an executor.
    pub fn running(target_index: usize, target: &TargetDescriptor) -> Self {
        let mut result = Self::queued(target_index, target);
        result.state = TargetState::Running;
        result
    }

    fn transition(&mut self, next: TargetState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                index: self.target_index,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition(TargetState::Running)
    }

    pub fn cancel(&mut self) -> Result<(), JobError> {
        self.transition(TargetState::Canceled)?;
        self.duration = Duration::ZERO;
        self.stdout.clear();
        self.stderr.clear();
        self.error = Some(CANCELED_BEFORE_START.into());
        Ok(())
    }

    pub fn succeed(
        &mut self,
        stdout: String,
        stderr: String,
        duration: Duration,
    ) -> Result<(), JobError> {
        self.transition(TargetState::Ok)?;
        self.stdout = stdout;
        self.stderr = stderr;
        self.duration = duration;
        self.error = None;
        Ok(())
    }

    pub fn fail<S: Into<String>>(
        &mut self,
        error: S,
        stdout: String,
        stderr: String,
        duration: Duration,
    ) -> Result<(), JobError> {
        self.transition(TargetState::Failed)?;
        self.stdout = stdout;
        self.stderr = stderr;
        self.duration = duration;
        self.error = Some(error.into());
        Ok(())
    }

    /// Mark a result failed regardless of its current state. Used by the
    /// orchestrator to repair results an executor got wrong.
    pub(crate) fn force_fail<S: Into<String>>(&mut self, error: S, duration: Duration) {
        self.state = TargetState::Failed;
        self.duration = duration;
        self.error = Some(error.into());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Counts of results by state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Queued or running.
    pub pending: usize,
}

impl JobSummary {
    pub fn all_ok(&self) -> bool {
        self.ok == self.total
    }
}

/// One run of a fleet action against a set of targets.
#[derive(Getters, Clone, Debug, Serialize, Deserialize)]
pub struct FleetJob {
    id: JobId,
    title: String,
    /// Selected target indices, ascending. `results[i]` describes `targets[i]`.
    targets: Vec<usize>,
    action: FleetAction,
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    finished_at: Option<OffsetDateTime>,
    results: Vec<TargetResult>,
}

impl FleetJob {
    /// Create a job with every target `Queued`. `selected` pairs each target
    /// index with its descriptor, in dispatch order.
    pub fn new(action: FleetAction, selected: &[(usize, TargetDescriptor)]) -> Self {
        Self {
            id: JobId::generate(),
            title: action.title(),
            targets: selected.iter().map(|(index, _)| *index).collect(),
            action,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            results: selected
                .iter()
                .map(|(index, target)| TargetResult::queued(*index, target))
                .collect(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        let mut summary = JobSummary {
            total: self.results.len(),
            ..Default::default()
        };
        for result in &self.results {
            match result.state() {
                TargetState::Ok => summary.ok += 1,
                TargetState::Failed => summary.failed += 1,
                TargetState::Canceled => summary.canceled += 1,
                TargetState::Queued | TargetState::Running => summary.pending += 1,
            }
        }
        summary
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(TargetResult::is_terminal)
    }

    pub(crate) fn result_mut(&mut self, slot: usize) -> Option<&mut TargetResult> {
        self.results.get_mut(slot)
    }

    pub(crate) fn set_result(&mut self, slot: usize, result: TargetResult) {
        if let Some(existing) = self.results.get_mut(slot) {
            *existing = result;
        }
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(OffsetDateTime::now_utc());
    }
}
