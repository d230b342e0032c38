use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status command used for [`FleetAction::CheckService`]. Exit status 0 means
/// the unit is active.
const SERVICE_STATUS: &str = "systemctl is-active";
const SERVICE_RESTART: &str = "systemctl restart";

/// The single operation applied to every selected target in one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetAction {
    /// A shell command line, run as one remote shell invocation.
    RunCommand { command: String },
    /// Report whether a service is active.
    CheckService { service: String },
    /// Restart a service and confirm it came back up.
    RestartService { service: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("action payload is empty")]
    EmptyPayload,
    #[error("invalid service name `{0}`")]
    InvalidServiceName(String),
}

impl FleetAction {
    pub fn run_command<S: Into<String>>(command: S) -> Self {
        FleetAction::RunCommand {
            command: command.into(),
        }
    }

    pub fn check_service<S: Into<String>>(service: S) -> Self {
        FleetAction::CheckService {
            service: service.into(),
        }
    }

    pub fn restart_service<S: Into<String>>(service: S) -> Self {
        FleetAction::RestartService {
            service: service.into(),
        }
    }

    /// Human-readable title, used as the job title.
    pub fn title(&self) -> String {
        match self {
            FleetAction::RunCommand { command } => format!("Run: {}", command),
            FleetAction::CheckService { service } => format!("Check service: {}", service),
            FleetAction::RestartService { service } => format!("Restart service: {}", service),
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            FleetAction::RunCommand { command } => command,
            FleetAction::CheckService { service } => service,
            FleetAction::RestartService { service } => service,
        }
    }

    /// The shell line sent to a target.
    pub fn remote_command(&self) -> String {
        match self {
            FleetAction::RunCommand { command } => command.clone(),
            FleetAction::CheckService { service } => {
                format!("{} {}", SERVICE_STATUS, shell_words::quote(service))
            }
            FleetAction::RestartService { service } => {
                let service = shell_words::quote(service);
                format!(
                    "{} {} && {} {}",
                    SERVICE_RESTART, service, SERVICE_STATUS, service
                )
            }
        }
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        let payload = self.payload();
        if payload.trim().is_empty() {
            return Err(ActionError::EmptyPayload);
        }
        match self {
            FleetAction::RunCommand { .. } => Ok(()),
            FleetAction::CheckService { service } | FleetAction::RestartService { service } => {
                if is_service_name(service) {
                    Ok(())
                } else {
                    Err(ActionError::InvalidServiceName(service.clone()))
                }
            }
        }
    }
}

impl fmt::Display for FleetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title())
    }
}

/// systemd unit names: letters, digits and `@._:-`.
fn is_service_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'))
}
