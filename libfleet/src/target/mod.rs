//! Connection identity for the hosts a fleet action runs against.

use std::fmt;
use std::path::PathBuf;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

pub type Port = u16;

pub fn default_ssh_port() -> Port {
    22
}

fn default_group() -> String {
    "default".into()
}

/// How the executor reaches a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connect over SSH.
    #[default]
    Ssh,
    /// Run through `sh -c` on this machine. Useful for localhost targets and
    /// smoke tests; the auth reference is ignored.
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

/// Credentials for a target. Only the transport looks inside; the
/// orchestrator treats this as opaque.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRef {
    #[default]
    None,
    /// A private key on disk, optionally encrypted. The passphrase is read
    /// from `passphrase_file` when present.
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase_file: Option<PathBuf>,
    },
    Password {
        password: String,
    },
}

// Keep secrets out of logs and `#[instrument]` spans.
impl fmt::Debug for AuthRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRef::None => write!(f, "None"),
            AuthRef::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
            AuthRef::Password { .. } => write!(f, "Password(<redacted>)"),
        }
    }
}

/// Immutable connection identity for one host.
#[derive(Getters, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetDescriptor {
    name: String,
    #[serde(default = "self::default_group")]
    group: String,
    user: String,
    host: String,
    #[serde(default = "self::default_ssh_port")]
    port: Port,
    #[serde(default)]
    auth: AuthRef,
    #[serde(default)]
    transport: TransportKind,
}

impl TargetDescriptor {
    pub fn new<S: Into<String>>(name: S, user: S, host: S) -> Self {
        Self {
            name: name.into(),
            group: default_group(),
            user: user.into(),
            host: host.into(),
            port: default_ssh_port(),
            auth: AuthRef::None,
            transport: TransportKind::Ssh,
        }
    }

    /// A target that runs on this machine instead of over SSH.
    pub fn local<S: Into<String>>(name: S) -> Self {
        let mut target = Self::new(name.into(), whoami(), "localhost".into());
        target.transport = TransportKind::Local;
        target
    }

    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: AuthRef) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".into())
}
