//! The Remote Target Executor: connect, authenticate, run one action and
//! capture its output under a deadline.
//!
//! [`TargetExecutor`] is the contract the orchestrator drives.
//! [`RemoteTargetExecutor`] implements it on top of a [`Connector`], which is
//! the seam toward the actual transport ([`ssh`] or [`local`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::action::FleetAction;
use crate::job::TargetResult;
use crate::log::*;
use crate::target::{TargetDescriptor, TransportKind};

pub mod local;
pub mod ssh;

/// Runs one action against one target. Implementations always return a
/// terminal [`TargetResult`] for `index` and never panic; every fault is
/// folded into the result's state and error.
#[async_trait]
pub trait TargetExecutor: std::fmt::Debug + Send + Sync + 'static {
    async fn run(
        &self,
        index: usize,
        target: &TargetDescriptor,
        action: &FleetAction,
        timeout: Duration,
    ) -> TargetResult;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("auth failed: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out")]
    TimedOut,
    #[error("exited with status {status}{}", stderr_summary(.stderr))]
    RemoteExit { status: u32, stderr: String },
}

fn stderr_summary(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// Captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

/// An established, authenticated connection to one target. Dropping the
/// session tears the connection down.
#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, ExecError>;
}

/// Opens sessions. Connection and authentication failures are reported as
/// [`ExecError::Connect`] and [`ExecError::Auth`] respectively.
#[async_trait]
pub trait Connector: std::fmt::Debug + Send + Sync + 'static {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteSession>, ExecError>;
}

/// Picks the SSH or local connector per target.
#[derive(Debug, Clone, Default)]
pub struct FleetConnector {
    ssh: ssh::SshConnector,
    local: local::LocalConnector,
}

impl FleetConnector {
    pub fn new(ssh: ssh::SshConnector, local: local::LocalConnector) -> Self {
        Self { ssh, local }
    }
}

#[async_trait]
impl Connector for FleetConnector {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteSession>, ExecError> {
        match target.transport() {
            TransportKind::Ssh => self.ssh.connect(target).await,
            TransportKind::Local => self.local.connect(target).await,
        }
    }
}

/// [`TargetExecutor`] over any [`Connector`]. Each call opens its own
/// session, so concurrent calls share nothing mutable.
#[derive(Debug, Clone)]
pub struct RemoteTargetExecutor<C: Connector = FleetConnector> {
    connector: Arc<C>,
}

impl<C: Connector> RemoteTargetExecutor<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
        }
    }

    async fn execute(&self, target: &TargetDescriptor, command: &str) -> Result<ExecOutput, ExecError> {
        debug!("connecting to {}", target);
        let mut session = self.connector.connect(target).await?;
        debug!("connected to {}, executing: {}", target, command);
        session.exec(command).await
    }
}

impl Default for RemoteTargetExecutor<FleetConnector> {
    fn default() -> Self {
        Self::new(FleetConnector::default())
    }
}

#[async_trait]
impl<C: Connector> TargetExecutor for RemoteTargetExecutor<C> {
    #[tracing::instrument(skip(self, action))]
    async fn run(
        &self,
        index: usize,
        target: &TargetDescriptor,
        action: &FleetAction,
        timeout: Duration,
    ) -> TargetResult {
        let mut result = TargetResult::running(index, target);
        let command = action.remote_command();
        let started = Instant::now();

        // The whole connect/auth/exec sequence shares one deadline. On expiry
        // the future is dropped, which drops the session and its connection.
        let outcome = tokio::time::timeout(timeout, self.execute(target, &command)).await;
        let elapsed = started.elapsed();

        let recorded = match outcome {
            Ok(Ok(output)) if output.exit_status == 0 => {
                result.succeed(output.stdout, output.stderr, elapsed)
            }
            Ok(Ok(output)) => {
                let error = ExecError::RemoteExit {
                    status: output.exit_status,
                    stderr: output.stderr.clone(),
                };
                result.fail(error.to_string(), output.stdout, output.stderr, elapsed)
            }
            Ok(Err(err)) => {
                warn!("{} failed: {}", target, err);
                result.fail(err.to_string(), String::new(), String::new(), elapsed)
            }
            Err(_) => {
                warn!("{} timed out after {:?}", target, timeout);
                result.fail(
                    ExecError::TimedOut.to_string(),
                    String::new(),
                    String::new(),
                    elapsed,
                )
            }
        };
        if let Err(err) = recorded {
            // Unreachable from `running`, but never hand back a live result.
            error!("{}", err);
            result.force_fail(err.to_string(), elapsed);
        }
        result
    }
}
