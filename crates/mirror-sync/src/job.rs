use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::precheck::PrecheckGate;
use crate::site::{SiteConfig, SiteId};
use crate::stage::{StageRecord, StageScheduler};
use crate::state::{ErrorKind, SyncOutcome, SyncState};
use crate::transfer::{BandwidthLimit, TransferBackend, TransferError, TransferOutcome};

/// A configured site paired with the collaborators resolved for it at load
/// time.
#[derive(Clone)]
pub struct ScheduledSite {
    pub config: Arc<SiteConfig>,
    pub backend: Arc<dyn TransferBackend>,
    pub gate: PrecheckGate,
}

impl ScheduledSite {
    pub fn new(config: SiteConfig, backend: Arc<dyn TransferBackend>, gate: PrecheckGate) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            gate,
        }
    }

    pub fn id(&self) -> &SiteId {
        &self.config.id
    }
}

/// Error details carried by a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// What a finished job hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub site_id: SiteId,
    pub outcome: SyncOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sum over the stages that completed.
    pub transfer: TransferOutcome,
    pub stages: Vec<StageRecord>,
    pub error: Option<JobError>,
    /// Precheck marker observed this run; recorded only on success.
    pub marker: Option<String>,
}

/// A job either ran to a verdict or was cut short by shutdown.
#[derive(Debug, Clone)]
pub enum JobResult {
    Completed(JobReport),
    Interrupted,
}

struct JobBody {
    outcome: SyncOutcome,
    transfer: TransferOutcome,
    stages: Vec<StageRecord>,
    error: Option<JobError>,
    marker: Option<String>,
}

/// Runs one site's sync end to end: precheck, stages, verdict.
///
/// Never retries; a failed site is picked up again by the next cycle.
#[derive(Debug, Clone)]
pub struct JobRunner {
    scheduler: StageScheduler,
    timeout: Duration,
    bandwidth: BandwidthLimit,
}

impl JobRunner {
    pub fn new(timeout: Duration, bandwidth: BandwidthLimit) -> Self {
        Self {
            scheduler: StageScheduler::new(),
            timeout,
            bandwidth,
        }
    }

    pub async fn run(
        &self,
        site: &ScheduledSite,
        prior: &SyncState,
        cancel: &CancellationToken,
    ) -> JobResult {
        let started_at = Utc::now();
        let work = self.execute(site, prior.last_marker.as_deref());

        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::warn!(site = %site.id(), "job interrupted");
                return JobResult::Interrupted;
            }
            result = tokio::time::timeout(self.timeout, work) => match result {
                Ok(body) => body,
                Err(_) => {
                    let error = TransferError::Timeout(self.timeout);
                    tracing::warn!(site = %site.id(), %error, "job timed out");
                    JobBody {
                        outcome: SyncOutcome::Failure,
                        transfer: TransferOutcome::default(),
                        stages: Vec::new(),
                        error: Some(JobError {
                            kind: error.kind(),
                            message: error.to_string(),
                        }),
                        marker: None,
                    }
                }
            },
        };

        JobResult::Completed(JobReport {
            site_id: site.id().clone(),
            outcome: body.outcome,
            started_at,
            finished_at: Utc::now(),
            transfer: body.transfer,
            stages: body.stages,
            error: body.error,
            marker: body.marker,
        })
    }

    async fn execute(&self, site: &ScheduledSite, last_marker: Option<&str>) -> JobBody {
        let config = site.config.as_ref();
        let decision = site.gate.should_sync(config, last_marker).await;

        if !decision.proceed {
            tracing::info!(site = %config.id, "no upstream changes, skipping sync");
            return JobBody {
                outcome: SyncOutcome::Skipped,
                transfer: TransferOutcome::default(),
                stages: Vec::new(),
                error: None,
                marker: decision.new_marker,
            };
        }

        let bandwidth = config
            .bandwidth_limit_mbps
            .map(BandwidthLimit::from_mbps)
            .unwrap_or(self.bandwidth);

        let run = self
            .scheduler
            .run(config, site.backend.as_ref(), bandwidth)
            .await;

        let error = run.failure.map(|(stage, error)| JobError {
            kind: error.kind(),
            message: format!("{stage}: {error}"),
        });

        JobBody {
            outcome: run.outcome,
            transfer: run.total,
            stages: run.completed,
            error,
            marker: decision.new_marker,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{ScriptedBackend, StaticProbe, sample_site, stage_outcome};
    use crate::transfer::Stage;

    use super::*;

    fn scheduled(config: SiteConfig, backend: &Arc<ScriptedBackend>, probe: StaticProbe) -> ScheduledSite {
        ScheduledSite::new(
            config,
            backend.clone(),
            PrecheckGate::new(Arc::new(probe)),
        )
    }

    fn runner() -> JobRunner {
        JobRunner::new(Duration::from_secs(30), BandwidthLimit::default())
    }

    fn completed(result: JobResult) -> JobReport {
        match result {
            JobResult::Completed(report) => report,
            JobResult::Interrupted => panic!("expected a completed job"),
        }
    }

    #[tokio::test]
    async fn matching_marker_skips_without_invoking_backend() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut config = sample_site("rocky");
        config.precheck_file = Some("fullfilelist".into());
        let site = scheduled(config, &backend, StaticProbe::marker("m1"));

        let prior = SyncState {
            consecutive_failures: 2,
            last_marker: Some("m1".into()),
            ..SyncState::default()
        };

        let report = completed(runner().run(&site, &prior, &CancellationToken::new()).await);

        assert_eq!(report.outcome, SyncOutcome::Skipped);
        assert_eq!(backend.total_invocations(), 0);
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn unreachable_precheck_still_runs_stage1() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut config = sample_site("debian");
        config.precheck_file = Some("project/trace/master".into());
        config.first_stage_exclude_patterns = vec!["Packages*".into()];
        let site = scheduled(config, &backend, StaticProbe::unreachable("timed out"));

        let report = completed(
            runner()
                .run(&site, &SyncState::default(), &CancellationToken::new())
                .await,
        );

        assert_eq!(report.outcome, SyncOutcome::Success);
        assert_eq!(
            backend.invocations("debian"),
            vec![Stage::Content, Stage::Metadata]
        );
        assert_eq!(report.marker, None);
    }

    #[tokio::test]
    async fn transfer_error_becomes_failure_with_message() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.respond(
            "rocky",
            Stage::Single,
            Err(TransferError::Auth("@ERROR: auth failed on module rocky".into())),
        );
        let site = scheduled(sample_site("rocky"), &backend, StaticProbe::marker("m"));

        let report = completed(
            runner()
                .run(&site, &SyncState::default(), &CancellationToken::new())
                .await,
        );

        assert_eq!(report.outcome, SyncOutcome::Failure);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransferAuth);
        assert!(error.message.contains("auth failed"));
        assert_eq!(backend.invocations("rocky").len(), 1);
    }

    #[tokio::test]
    async fn per_site_bandwidth_overrides_default() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut config = sample_site("rocky");
        config.bandwidth_limit_mbps = Some(25);
        let site = scheduled(config, &backend, StaticProbe::marker("m"));

        runner()
            .run(&site, &SyncState::default(), &CancellationToken::new())
            .await;

        assert_eq!(backend.bandwidths(), vec![BandwidthLimit::from_mbps(25)]);
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_timeout_failure() {
        let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_secs(5)));
        let site = scheduled(sample_site("slow"), &backend, StaticProbe::marker("m"));
        let runner = JobRunner::new(Duration::from_millis(20), BandwidthLimit::default());

        let report = completed(
            runner
                .run(&site, &SyncState::default(), &CancellationToken::new())
                .await,
        );

        assert_eq!(report.outcome, SyncOutcome::Failure);
        assert_eq!(report.error.unwrap().kind, ErrorKind::TransferTimeout);
    }

    #[tokio::test]
    async fn cancellation_interrupts_job() {
        let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_secs(5)));
        let site = scheduled(sample_site("slow"), &backend, StaticProbe::marker("m"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = runner().run(&site, &SyncState::default(), &cancel).await;
        assert!(matches!(result, JobResult::Interrupted));
    }

    #[tokio::test]
    async fn success_carries_new_marker() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.respond("rocky", Stage::Single, Ok(stage_outcome(3)));
        let mut config = sample_site("rocky");
        config.precheck_file = Some("fullfilelist".into());
        let site = scheduled(config, &backend, StaticProbe::marker("m2"));

        let prior = SyncState {
            last_marker: Some("m1".into()),
            ..SyncState::default()
        };
        let report = completed(runner().run(&site, &prior, &CancellationToken::new()).await);

        assert_eq!(report.outcome, SyncOutcome::Success);
        assert_eq!(report.marker.as_deref(), Some("m2"));
        assert_eq!(report.transfer.files_changed, 3);
    }
}
