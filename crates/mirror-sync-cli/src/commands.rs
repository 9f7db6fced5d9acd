pub mod check;
pub mod run;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use mirror_sync::{Orchestrator, SiteSet, load_sites};
use mirror_sync_store::SqliteStateStore;
use mirror_sync_tools::ToolSet;

use crate::config::AppConfig;

pub fn site_set(config: &AppConfig) -> SiteSet {
    load_sites(&config.sites, &config.defaults.dest_root)
}

pub fn open_store(config: &AppConfig) -> Result<SqliteStateStore> {
    let path = config.state_path()?;
    SqliteStateStore::open(&path)
        .with_context(|| format!("failed to open state at {}", path.display()))
}

/// Resolve tools for every accepted site and bring the state store in line
/// with the configured fleet.
pub fn open_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let set = site_set(config);
    let tools =
        ToolSet::new(&config.tool_settings()).context("failed to build HTTP client")?;
    let sites = set.accepted.into_iter().map(|site| tools.schedule(site)).collect();
    let store = open_store(config)?;

    Orchestrator::new(
        sites,
        set.rejected,
        Arc::new(store),
        config.orchestrator_settings(),
    )
    .context("failed to initialise sync state")
}
