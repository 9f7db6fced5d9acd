use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mirror_sync::{SiteId, StateError, StateStore, SyncState};

use crate::config::AppConfig;

/// Print the recorded state of every configured site. Sites whose state
/// cannot be read are listed separately and make the exit code non-zero.
pub fn run(config: &AppConfig, json: bool) -> Result<ExitCode> {
    let sites = super::site_set(config).accepted;
    let store = super::open_store(config)?;

    let mut snapshot: BTreeMap<SiteId, SyncState> = BTreeMap::new();
    let mut unreadable = Vec::new();
    for site in &sites {
        match store.get(&site.id) {
            Ok(state) => {
                snapshot.insert(site.id.clone(), state.unwrap_or_default());
            }
            Err(StateError::Corrupt { site, message }) => unreadable.push((site, message)),
            Err(error) => return Err(error).context("failed to read sync state"),
        }
    }

    if json {
        let out = serde_json::to_string_pretty(&snapshot).context("failed to encode status")?;
        println!("{out}");
    } else {
        print_table(&snapshot);
    }

    if unreadable.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    for (site, message) in &unreadable {
        eprintln!("warning: state for {site} is unreadable: {message}");
    }
    Ok(ExitCode::FAILURE)
}

fn print_table(snapshot: &BTreeMap<SiteId, SyncState>) {
    if snapshot.is_empty() {
        println!("no sites configured");
        return;
    }

    println!(
        "{:<20} {:<16} {:<20} {:<20} {:>8}  {}",
        "SITE", "OUTCOME", "LAST ATTEMPT", "LAST SUCCESS", "FAILURES", "ERROR"
    );
    for (id, state) in snapshot {
        println!(
            "{:<20} {:<16} {:<20} {:<20} {:>8}  {}",
            id.as_str(),
            state
                .last_outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "never run".into()),
            timestamp(state.last_attempt_at),
            timestamp(state.last_success_at),
            state.consecutive_failures,
            state.last_error.as_deref().unwrap_or(""),
        );
    }
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}
