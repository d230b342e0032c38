use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{Connector, ExecError, ExecOutput, RemoteSession};
use crate::log::*;
use crate::target::TargetDescriptor;

/// Runs actions on this machine through `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    shell: String,
}

impl LocalConnector {
    pub fn new<S: Into<String>>(shell: S) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl Connector for LocalConnector {
    #[tracing::instrument(skip(self))]
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteSession>, ExecError> {
        let shell = which::which(&self.shell)
            .map_err(|e| ExecError::Connect(format!("shell `{}` not found: {}", self.shell, e)))?;
        debug!("local target {} using shell {}", target.name(), shell.display());
        Ok(Box::new(LocalSession { shell }))
    }
}

#[derive(Debug)]
struct LocalSession {
    shell: PathBuf,
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, ExecError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out call drops this future; take the process with it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Connect(format!("spawning `{}` failed: {}", command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Transport("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Transport("stderr was not captured".into()))?;

        let (stdout, stderr, status) = tokio::try_join!(collect(stdout), collect(stderr), async {
            child
                .wait()
                .await
                .map_err(|e| ExecError::Transport(format!("waiting for `{}` failed: {}", command, e)))
        })?;

        // No exit code means the process died to a signal; report it the way
        // a shell would.
        let exit_status = match status.code() {
            Some(code) => code as u32,
            None => 128 + signal_number(&status),
        };
        Ok(ExecOutput {
            exit_status,
            stdout,
            stderr,
        })
    }
}

async fn collect<R: AsyncRead + Unpin>(reader: R) -> Result<String, ExecError> {
    let mut frames = FramedRead::new(reader, BytesCodec::new());
    let mut buf = Vec::new();
    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(|e| ExecError::Transport(format!("reading output failed: {}", e)))?;
        buf.extend_from_slice(&frame);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(unix)]
fn signal_number(status: &std::process::ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0) as u32
}

#[cfg(not(unix))]
fn signal_number(_status: &std::process::ExitStatus) -> u32 {
    0
}
