use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use super::{Connector, ExecError, ExecOutput, RemoteSession};
use crate::log::*;
use crate::target::{AuthRef, TargetDescriptor};

/// Opens one SSH connection per call with `thrussh`.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<thrussh::client::Config>,
}

impl SshConnector {
    pub fn new(config: thrussh::client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(thrussh::client::Config::default())
    }
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[tracing::instrument(skip(self))]
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteSession>, ExecError> {
        let addr = target.address();
        debug!("connecting to {}", &addr);
        let mut handle = thrussh::client::connect(self.config.clone(), addr.as_str(), SshClient)
            .await
            .map_err(|e| ExecError::Connect(format!("{}: {}", addr, e)))?;

        let user = target.user().as_str();
        let authenticated = match target.auth() {
            AuthRef::KeyFile {
                path,
                passphrase_file,
            } => {
                let key = fs::read_to_string(path)
                    .await
                    .map_err(|e| ExecError::Auth(format!("reading key {}: {}", path.display(), e)))?;
                let passphrase = match passphrase_file {
                    Some(file) => Some(fs::read_to_string(file).await.map_err(|e| {
                        ExecError::Auth(format!("reading passphrase {}: {}", file.display(), e))
                    })?),
                    None => None,
                };
                let keypair = thrussh_keys::decode_secret_key(
                    key.as_str(),
                    passphrase.as_deref().map(str::trim_end),
                )
                .map_err(|e| ExecError::Auth(format!("decoding key {}: {}", path.display(), e)))?;
                handle
                    .authenticate_publickey(user, Arc::new(keypair))
                    .await
                    .map_err(|e| ExecError::Auth(e.to_string()))?
            }
            AuthRef::Password { password } => handle
                .authenticate_password(user, password.as_str())
                .await
                .map_err(|e| ExecError::Auth(e.to_string()))?,
            AuthRef::None => {
                return Err(ExecError::Auth(format!(
                    "no credentials configured for {}",
                    target.name()
                )))
            }
        };

        if !authenticated {
            return Err(ExecError::Auth(format!("rejected for user {}", user)));
        }
        debug!("authenticated to {} as {}", &addr, user);
        Ok(Box::new(SshSession { handle }))
    }
}

struct SshSession {
    handle: thrussh::client::Handle<SshClient>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, ExecError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Transport(format!("opening channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::Transport(format!("exec: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(frame) = channel.wait().await {
            match frame {
                thrussh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data[..]),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                thrussh::ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    stderr.extend_from_slice(&data[..])
                }
                thrussh::ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                }
                thrussh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_status = exit_status
            .ok_or_else(|| ExecError::Transport("channel closed without an exit status".into()))?;
        Ok(ExecOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

struct SshClient;

impl thrussh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Report;
    type FutureUnit = futures::future::Ready<Result<(Self, thrussh::client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    // TODO: verify host keys against a known_hosts source once profiles
    // carry one.
    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}
