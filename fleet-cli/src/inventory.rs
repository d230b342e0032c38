use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use derive_getters::Getters;
use fleet::orchestrator::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_CONCURRENCY};
use fleet::target::TargetDescriptor;
use serde::Deserialize;
use tokio::fs;

use crate::commands::CommandErrors;

/// Run defaults carried by the inventory. CLI flags win over these.
#[derive(Getters, Debug, Clone, Copy, Default, Deserialize)]
pub struct Settings {
    max_concurrency: Option<usize>,
    /// Seconds; 0 means the built-in default.
    command_timeout: Option<u64>,
}

impl Settings {
    /// Concurrency and per-target timeout for a run. A CLI flag wins over the
    /// inventory setting, which wins over the built-in default. A timeout of
    /// 0 from either source means the default.
    pub fn resolve(&self, concurrency: Option<usize>, timeout: Option<u64>) -> (usize, Duration) {
        let concurrency = concurrency
            .or(self.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        let timeout = match timeout.or(self.command_timeout) {
            Some(0) | None => DEFAULT_COMMAND_TIMEOUT,
            Some(secs) => Duration::from_secs(secs),
        };
        (concurrency, timeout)
    }
}

/// The read-only list of targets an operator can select from. Target indices
/// are positions in `targets`.
#[derive(Getters, Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    settings: Settings,
    targets: Vec<TargetDescriptor>,
}

impl Inventory {
    pub async fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Failed reading inventory file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let inventory: Inventory =
            serde_yaml::from_str(raw).wrap_err("deserializing inventory")?;
        let mut names = HashSet::new();
        for target in &inventory.targets {
            if !names.insert(target.name().as_str()) {
                return Err(CommandErrors::DuplicateTargetName(target.name().clone()).into());
            }
        }
        Ok(inventory)
    }

    /// Indices of targets matching any of `groups` or `names`. Selecting
    /// nothing selects everything.
    pub fn select(&self, groups: &[String], names: &[String]) -> Result<Vec<usize>> {
        if groups.is_empty() && names.is_empty() {
            return Ok((0..self.targets.len()).collect());
        }
        for group in groups {
            if !self.targets.iter().any(|t| t.group() == group) {
                return Err(CommandErrors::UnknownGroup(group.clone()).into());
            }
        }
        for name in names {
            if !self.targets.iter().any(|t| t.name() == name) {
                return Err(CommandErrors::UnknownTarget(name.clone()).into());
            }
        }
        Ok(self
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| groups.contains(t.group()) || names.contains(t.name()))
            .map(|(index, _)| index)
            .collect())
    }
}
