//! Daemon configuration.
//!
//! Everything is read from `POLLD_*` environment variables (a `.env` file is
//! loaded first by `main`):
//!
//! - `POLLD_POLL_TIMEOUT_SECS`: steady-state poll deadline (default: 30)
//! - `POLLD_BOOTSTRAP_POLL_TIMEOUT_SECS`: first poll deadline (default: 240)
//! - `POLLD_MAX_PENALTY`: cap of the linear backoff (default: 4)
//! - `POLLD_AUTH_TRIES_UNTIL_PENALTY`: auth failures before the long penalty (default: 3)
//! - `POLLD_AUTH_FAILURE_PENALTY`: cycles skipped after repeated auth failures (default: 10)
//! - `POLLD_POLL_INTERVAL_SECS`: periodic bulk poll; unset means external triggers only
//! - `POLLD_SHUTDOWN_TIMEOUT_SECS`: time actors get to stop (default: 10)
//! - `POLLD_DATA_DIR`: plugin state directory; state is not persisted when unset
//! - `POLLD_LOG_DIR`: daily log file directory; stderr only when unset
//! - `POLLD_LOG`: log filter directive, overrides `RUST_LOG`
//! - `POLLD_PLUGINS`: path of the JSON plugin table

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LoggingOptions;
use crate::plugins::CommandPluginConfig;
use crate::scheduler::{CoordinatorConfig, PenaltyConfig, SupervisorConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct PolldConfig {
    pub coordinator: CoordinatorConfig,
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub plugins_path: Option<PathBuf>,
}

impl PolldConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut supervisor = SupervisorConfig::default();
        if let Some(secs) = parse_var::<u64>(&var, "POLLD_POLL_TIMEOUT_SECS")? {
            supervisor.poll_timeout = positive_secs("POLLD_POLL_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<u64>(&var, "POLLD_BOOTSTRAP_POLL_TIMEOUT_SECS")? {
            supervisor.bootstrap_poll_timeout =
                positive_secs("POLLD_BOOTSTRAP_POLL_TIMEOUT_SECS", secs)?;
        }

        let mut penalty = PenaltyConfig::default();
        if let Some(v) = parse_var(&var, "POLLD_MAX_PENALTY")? {
            penalty.max_penalty = v;
        }
        if let Some(v) = parse_var(&var, "POLLD_AUTH_TRIES_UNTIL_PENALTY")? {
            if v == 0 {
                return Err(Error::config("POLLD_AUTH_TRIES_UNTIL_PENALTY must be at least 1"));
            }
            penalty.auth_tries_until_penalty = v;
        }
        if let Some(v) = parse_var(&var, "POLLD_AUTH_FAILURE_PENALTY")? {
            penalty.auth_failure_penalty = v;
        }
        supervisor.penalty = penalty;

        let mut coordinator = CoordinatorConfig {
            supervisor,
            ..CoordinatorConfig::default()
        };
        if let Some(secs) = parse_var::<u64>(&var, "POLLD_POLL_INTERVAL_SECS")? {
            coordinator.poll_interval = Some(positive_secs("POLLD_POLL_INTERVAL_SECS", secs)?);
        }
        if let Some(secs) = parse_var::<u64>(&var, "POLLD_SHUTDOWN_TIMEOUT_SECS")? {
            coordinator.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(Self {
            coordinator,
            data_dir: var("POLLD_DATA_DIR").map(PathBuf::from),
            log_dir: var("POLLD_LOG_DIR").map(PathBuf::from),
            log_filter: var("POLLD_LOG"),
            plugins_path: var("POLLD_PLUGINS").map(PathBuf::from),
        })
    }

    pub fn logging(&self) -> LoggingOptions {
        LoggingOptions {
            filter: self.log_filter.clone(),
            log_dir: self.log_dir.clone(),
            ansi: false,
        }
    }

    /// Load the plugin table, or an empty one when no path is configured.
    pub fn load_plugins(&self) -> Result<Vec<CommandPluginConfig>> {
        match &self.plugins_path {
            Some(path) => load_plugins(path),
            None => Ok(Vec::new()),
        }
    }
}

fn parse_var<T>(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("{name}: invalid value '{raw}': {e}")))
        })
        .transpose()
}

fn positive_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::config(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}

/// Read a JSON plugin table.
pub fn load_plugins(path: &Path) -> Result<Vec<CommandPluginConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("Cannot read plugin table {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("Invalid plugin table {}: {}", path.display(), e)))
}
