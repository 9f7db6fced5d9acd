//! Cycle-level coordination of every configured mirror.
//!
//! A cycle fans out one job per site over a bounded pool, collects the
//! verdicts as they arrive and folds each one into the state store. The
//! collecting loop is the only writer of the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::job::{JobError, JobReport, JobResult, JobRunner, ScheduledSite};
use crate::site::{RejectedSite, SiteConfig, SiteId};
use crate::state::{ErrorKind, SyncOutcome, SyncState};
use crate::store::{StateError, StateStore};
use crate::transfer::{BandwidthLimit, TransferOutcome};

/// Default number of jobs allowed to run at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default upper bound on a single job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Optional in-process backoff for sites that keep failing.
///
/// After `n` consecutive failures a site is left alone until
/// `base * 2^(n-1)` (capped at `max`) has passed since its last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl FailureBackoff {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Earliest time the site may run again, if it is currently held back.
    pub fn deferred_until(&self, state: &SyncState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last_attempt = state.last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay(state.consecutive_failures)).ok()?;
        let ready_at = last_attempt + delay;
        (ready_at > now).then_some(ready_at)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub bandwidth: BandwidthLimit,
    pub backoff: Option<FailureBackoff>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            bandwidth: BandwidthLimit::default(),
            backoff: None,
        }
    }
}

/// What happened to every site during one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub completed: Vec<JobReport>,
    /// Jobs cut short by cancellation; their state was left untouched.
    pub interrupted: Vec<SiteId>,
    /// Sites held back by the failure backoff.
    pub deferred: Vec<SiteId>,
    /// Sites whose verdict could not be persisted.
    pub unrecorded: Vec<(SiteId, StateError)>,
}

impl CycleReport {
    pub fn outcome_of(&self, id: &SiteId) -> Option<SyncOutcome> {
        self.completed
            .iter()
            .find(|r| &r.site_id == id)
            .map(|r| r.outcome)
    }

    pub fn failed(&self) -> Vec<&SiteId> {
        self.completed
            .iter()
            .filter(|r| r.outcome.is_failure())
            .map(|r| &r.site_id)
            .collect()
    }

    pub fn count(&self, outcome: SyncOutcome) -> usize {
        self.completed.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Owns the configured sites and their state store.
pub struct Orchestrator {
    sites: Vec<ScheduledSite>,
    rejected: Vec<RejectedSite>,
    store: Arc<dyn StateStore>,
    settings: OrchestratorSettings,
    runner: JobRunner,
}

impl Orchestrator {
    /// Prunes state left behind by sites no longer configured and creates
    /// empty state for newly configured ones. Rejected entries that still
    /// name an id keep whatever state they had.
    pub fn new(
        sites: Vec<ScheduledSite>,
        rejected: Vec<RejectedSite>,
        store: Arc<dyn StateStore>,
        settings: OrchestratorSettings,
    ) -> Result<Self, StateError> {
        for site in &rejected {
            tracing::error!(site = %site.label, reason = %site.reason, "site rejected, not scheduling");
        }

        let ids: Vec<SiteId> = sites.iter().map(|s| s.id().clone()).collect();
        let keep: Vec<SiteId> = ids
            .iter()
            .cloned()
            .chain(rejected.iter().filter_map(|r| r.id.clone()))
            .collect();
        let pruned = store.retain(&keep)?;
        if pruned > 0 {
            tracing::info!(pruned, "removed state for sites no longer configured");
        }
        for id in &ids {
            store.ensure(id)?;
        }

        let runner = JobRunner::new(settings.job_timeout, settings.bandwidth);

        Ok(Self {
            sites,
            rejected,
            store,
            settings,
            runner,
        })
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().map(|s| s.config.as_ref())
    }

    pub fn rejected(&self) -> &[RejectedSite] {
        &self.rejected
    }

    /// Read-only snapshot of the state of every configured site, rejected
    /// ones included. Unreadable records are logged and left out.
    pub fn status(&self) -> Result<BTreeMap<SiteId, SyncState>, StateError> {
        let ids = self
            .sites
            .iter()
            .map(|s| s.id())
            .chain(self.rejected.iter().filter_map(|r| r.id.as_ref()));

        let mut snapshot = BTreeMap::new();
        for id in ids {
            match self.store.get(id) {
                Ok(Some(state)) => {
                    snapshot.insert(id.clone(), state);
                }
                Ok(None) => {}
                Err(error @ StateError::Corrupt { .. }) => {
                    tracing::warn!(site = %id, %error, "leaving unreadable state out of status");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(snapshot)
    }

    /// Run one job for every configured site.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        self.dispatch(self.sites.iter().collect(), cancel).await
    }

    /// Run one job for each of the given sites; unknown ids are ignored.
    pub async fn run_sites(&self, ids: &[SiteId], cancel: &CancellationToken) -> CycleReport {
        let selected = self
            .sites
            .iter()
            .filter(|s| ids.contains(s.id()))
            .collect();
        self.dispatch(selected, cancel).await
    }

    async fn dispatch(&self, sites: Vec<&ScheduledSite>, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut jobs = JoinSet::new();
        let mut pending = BTreeSet::new();
        let now = Utc::now();

        for site in sites {
            let prior = self.prior_state(site.id());

            if let Some(backoff) = &self.settings.backoff
                && let Some(until) = backoff.deferred_until(&prior, now)
            {
                tracing::info!(
                    site = %site.id(),
                    failures = prior.consecutive_failures,
                    %until,
                    "deferring failing site"
                );
                report.deferred.push(site.id().clone());
                continue;
            }

            let site = site.clone();
            let runner = self.runner.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            pending.insert(site.id().clone());

            jobs.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return (site.id().clone(), JobResult::Interrupted),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (site.id().clone(), JobResult::Interrupted),
                    },
                };
                let result = runner.run(&site, &prior, &cancel).await;
                (site.id().clone(), result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((id, JobResult::Completed(job))) => {
                    pending.remove(&id);
                    self.record(job, &mut report);
                }
                Ok((id, JobResult::Interrupted)) => {
                    pending.remove(&id);
                    report.interrupted.push(id);
                }
                Err(error) => {
                    tracing::error!(%error, "sync job aborted unexpectedly");
                }
            }
        }

        // Whatever is still pending belongs to a job that panicked.
        for id in pending {
            let at = Utc::now();
            self.record(
                JobReport {
                    site_id: id,
                    outcome: SyncOutcome::Failure,
                    started_at: at,
                    finished_at: at,
                    transfer: TransferOutcome::default(),
                    stages: Vec::new(),
                    error: Some(JobError {
                        kind: ErrorKind::TransferTool,
                        message: "sync job panicked".into(),
                    }),
                    marker: None,
                },
                &mut report,
            );
        }

        tracing::info!(
            succeeded = report.count(SyncOutcome::Success),
            skipped = report.count(SyncOutcome::Skipped),
            partial = report.count(SyncOutcome::PartialFailure),
            failed = report.count(SyncOutcome::Failure),
            interrupted = report.interrupted.len(),
            deferred = report.deferred.len(),
            "cycle finished"
        );

        report
    }

    fn record(&self, job: JobReport, report: &mut CycleReport) {
        match &job.error {
            Some(error) => tracing::error!(
                site = %job.site_id,
                outcome = %job.outcome,
                kind = %error.kind,
                error = %error.message,
                "sync failed"
            ),
            None => tracing::info!(
                site = %job.site_id,
                outcome = %job.outcome,
                files = job.transfer.files_changed,
                bytes = job.transfer.bytes_transferred,
                "sync finished"
            ),
        }

        if let Err(error) = self.update_state(&job) {
            tracing::error!(site = %job.site_id, %error, "could not record sync state");
            report.unrecorded.push((job.site_id.clone(), error));
        }
        report.completed.push(job);
    }

    /// Snapshot handed to a job. A site whose state cannot be read runs as if
    /// it had no history.
    fn prior_state(&self, id: &SiteId) -> SyncState {
        match self.store.get(id) {
            Ok(state) => state.unwrap_or_default(),
            Err(error) => {
                tracing::error!(site = %id, %error, "could not read state, running with empty history");
                SyncState::default()
            }
        }
    }

    fn update_state(&self, job: &JobReport) -> Result<(), StateError> {
        let mut state = match self.store.get(&job.site_id) {
            Ok(state) => state.unwrap_or_default(),
            Err(StateError::Corrupt { message, .. }) => {
                tracing::warn!(site = %job.site_id, %message, "replacing unreadable state");
                SyncState::default()
            }
            Err(error) => return Err(error),
        };
        state.apply(job);
        self.store.put(&job.site_id, &state)
    }
}
