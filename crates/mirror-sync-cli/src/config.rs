use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_sync::{BandwidthLimit, FailureBackoff, OrchestratorSettings, SiteEntry};
use mirror_sync_tools::{RetryPolicy, ToolSettings, is_redhat_family};
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub tools: Tools,
    pub certificate: Option<Certificate>,
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

/// Fleet-wide settings from the `[defaults]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    pub bandwidth_limit_mbps: u32,
    pub concurrency: usize,
    pub job_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub dest_root: PathBuf,
    /// Defaults to `<data dir>/mirror-sync/state.db`.
    pub state_path: Option<PathBuf>,
    pub lock_path: PathBuf,
    /// Refuse to run unless invoked as this user.
    pub run_as: Option<String>,
    pub tool_retries: u32,
    pub retry_exit_codes: Vec<i32>,
    /// Unset means relabel only on Red Hat family hosts.
    pub selinux_relabel: Option<bool>,
    pub backoff: Option<Backoff>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            bandwidth_limit_mbps: BandwidthLimit::DEFAULT_MBPS,
            concurrency: mirror_sync::orchestrator::DEFAULT_CONCURRENCY,
            job_timeout_secs: mirror_sync::orchestrator::DEFAULT_JOB_TIMEOUT.as_secs(),
            probe_timeout_secs: 60,
            dest_root: PathBuf::from("/srv/mirror"),
            state_path: None,
            lock_path: PathBuf::from("/tmp/mirror-sync.lock"),
            run_as: None,
            tool_retries: 0,
            retry_exit_codes: vec![10],
            selinux_relabel: None,
            backoff: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Backoff {
    pub base_secs: u64,
    pub max_secs: u64,
}

/// Program paths from the `[tools]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Tools {
    pub rsync: PathBuf,
    pub debmirror: PathBuf,
    pub dnf: PathBuf,
    pub restorecon: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        let defaults = ToolSettings::default();
        Self {
            rsync: defaults.rsync,
            debmirror: defaults.debmirror,
            dnf: defaults.dnf,
            restorecon: defaults.restorecon,
        }
    }
}

/// Certificate served alongside the mirrors. Only its presence is checked;
/// issuance and renewal happen elsewhere.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Certificate {
    pub hostname: String,
    pub path: PathBuf,
}

impl AppConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("in {}", path.display()))
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.defaults.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(dirs::data_dir()
                .context("could not determine data directory")?
                .join("mirror-sync")
                .join("state.db")),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let d = &self.defaults;
        OrchestratorSettings {
            concurrency: d.concurrency.max(1),
            job_timeout: Duration::from_secs(d.job_timeout_secs),
            bandwidth: BandwidthLimit::from_mbps(d.bandwidth_limit_mbps),
            backoff: d.backoff.as_ref().map(|b| FailureBackoff {
                base: Duration::from_secs(b.base_secs),
                max: Duration::from_secs(b.max_secs),
            }),
        }
    }

    pub fn tool_settings(&self) -> ToolSettings {
        let d = &self.defaults;
        ToolSettings {
            rsync: self.tools.rsync.clone(),
            debmirror: self.tools.debmirror.clone(),
            dnf: self.tools.dnf.clone(),
            restorecon: self.tools.restorecon.clone(),
            relabel: d.selinux_relabel.unwrap_or_else(is_redhat_family),
            retry: RetryPolicy {
                retries: d.tool_retries,
                exit_codes: d.retry_exit_codes.clone(),
            },
            probe_timeout: Duration::from_secs(d.probe_timeout_secs),
        }
    }
}

/// Config file path: `~/.config/mirror-sync/mirror.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mirror-sync").join("mirror.toml"))
}
