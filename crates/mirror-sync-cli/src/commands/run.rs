use std::process::ExitCode;

use anyhow::{Result, bail};
use mirror_sync::{CycleReport, SiteId, SyncOutcome};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::lock::RunLock;
use crate::shutdown;

/// Run one cycle and report per-site results. Exits non-zero when any site
/// failed or was interrupted.
pub async fn run(config: &AppConfig, only: &[String]) -> Result<ExitCode> {
    check_user(config.defaults.run_as.as_deref(), current_user().as_deref())?;
    check_certificate(config);

    let _lock = RunLock::acquire(&config.defaults.lock_path)?;
    let orchestrator = super::open_orchestrator(config)?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let report = if only.is_empty() {
        orchestrator.run_cycle(&cancel).await
    } else {
        let ids: Vec<SiteId> = only.iter().map(SiteId::new).collect();
        for id in &ids {
            if !orchestrator.sites().any(|s| &s.id == id) {
                tracing::warn!(site = %id, "not a configured site, ignoring");
            }
        }
        orchestrator.run_sites(&ids, &cancel).await
    };

    print_report(&report);

    if report.failed().is_empty() && report.interrupted.is_empty() && report.unrecorded.is_empty()
    {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
}

fn check_user(expected: Option<&str>, actual: Option<&str>) -> Result<()> {
    match (expected, actual) {
        (None, _) => Ok(()),
        (Some(expected), Some(actual)) if expected == actual => Ok(()),
        (Some(expected), actual) => bail!(
            "expected to run as user {expected} but running as {}",
            actual.unwrap_or("an unknown user")
        ),
    }
}

fn check_certificate(config: &AppConfig) {
    let Some(cert) = &config.certificate else {
        return;
    };
    if cert.path.exists() {
        tracing::debug!(hostname = %cert.hostname, path = %cert.path.display(), "certificate present");
    } else {
        tracing::warn!(hostname = %cert.hostname, path = %cert.path.display(), "certificate file missing");
    }
}

fn print_report(report: &CycleReport) {
    for job in &report.completed {
        match &job.error {
            Some(error) => println!("{:<20} {:<16} {}", job.site_id, job.outcome, error.message),
            None => println!(
                "{:<20} {:<16} {} files, {} bytes",
                job.site_id, job.outcome, job.transfer.files_changed, job.transfer.bytes_transferred
            ),
        }
    }
    for id in &report.deferred {
        println!("{id:<20} {:<16} backing off after repeated failures", "deferred");
    }
    for id in &report.interrupted {
        println!("{id:<20} {:<16}", "interrupted");
    }
    for (id, error) in &report.unrecorded {
        eprintln!("warning: state for {id} was not saved: {error}");
    }

    let failed = report.failed();
    if failed.is_empty() {
        println!(
            "\n{} synced, {} unchanged",
            report.count(SyncOutcome::Success),
            report.count(SyncOutcome::Skipped)
        );
    } else {
        let names: Vec<&str> = failed.iter().map(|id| id.as_str()).collect();
        println!("\nfailures syncing: {}", names.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_as_is_optional() {
        assert!(check_user(None, Some("root")).is_ok());
        assert!(check_user(None, None).is_ok());
    }

    #[test]
    fn run_as_must_match_current_user() {
        assert!(check_user(Some("nginx"), Some("nginx")).is_ok());

        let err = check_user(Some("nginx"), Some("root")).unwrap_err();
        assert!(err.to_string().contains("expected to run as user nginx"));
        assert!(check_user(Some("nginx"), None).is_err());
    }
}
