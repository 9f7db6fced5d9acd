//! Ordering and gating of the transfer passes that make up one job.
//!
//! A two-stage job moves bulk content first with the site's first-stage
//! patterns (package indexes and release files) held back and deletion
//! suppressed, then runs a full pass that publishes the metadata and
//! prunes. If the content pass fails the metadata pass must not run, or
//! clients would be served indexes referencing files that are not there.

use crate::site::SiteConfig;
use crate::state::SyncOutcome;
use crate::transfer::{BandwidthLimit, Stage, TransferBackend, TransferError, TransferOutcome};

/// Position of a job in its stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Stage1,
    Stage2,
    SingleStage,
    Done,
}

impl StageState {
    /// The transfer pass run in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage1 => Some(Stage::Content),
            Self::Stage2 => Some(Stage::Metadata),
            Self::SingleStage => Some(Stage::Single),
            Self::Idle | Self::Done => None,
        }
    }

    /// Transition taken once the current state's work has succeeded.
    ///
    /// Stage1 always leads to Stage2, whatever the number of files it moved.
    pub fn advance(self, two_stage: bool) -> Self {
        match self {
            Self::Idle if two_stage => Self::Stage1,
            Self::Idle => Self::SingleStage,
            Self::Stage1 => Self::Stage2,
            Self::Stage2 | Self::SingleStage | Self::Done => Self::Done,
        }
    }
}

/// A stage that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: TransferOutcome,
}

/// Everything the scheduler learned while driving one job.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub outcome: SyncOutcome,
    pub completed: Vec<StageRecord>,
    /// The stage that failed and why, when the run was aborted.
    pub failure: Option<(Stage, TransferError)>,
    pub total: TransferOutcome,
}

/// Drives a site's stages through a backend, in order, stopping at the
/// first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageScheduler;

impl StageScheduler {
    pub fn new() -> Self {
        Self
    }

    /// The stages a site will go through, in order.
    pub fn plan(site: &SiteConfig) -> Vec<Stage> {
        if site.is_two_stage() {
            vec![Stage::Content, Stage::Metadata]
        } else {
            vec![Stage::Single]
        }
    }

    pub async fn run(
        &self,
        site: &SiteConfig,
        backend: &dyn TransferBackend,
        bandwidth: BandwidthLimit,
    ) -> StageRun {
        let two_stage = site.is_two_stage();
        let mut state = StageState::Idle.advance(two_stage);
        let mut completed = Vec::new();
        let mut total = TransferOutcome::default();

        while let Some(stage) = state.stage() {
            tracing::info!(site = %site.id, backend = backend.name(), %stage, "starting");

            match backend.execute(site, stage, bandwidth).await {
                Ok(outcome) => {
                    tracing::info!(
                        site = %site.id,
                        %stage,
                        files = outcome.files_changed,
                        bytes = outcome.bytes_transferred,
                        "stage finished"
                    );
                    total.absorb(&outcome);
                    completed.push(StageRecord { stage, outcome });
                    state = state.advance(two_stage);
                }
                Err(error) => {
                    tracing::warn!(site = %site.id, %stage, %error, "stage failed, aborting job");
                    let outcome = aggregate(&completed, true);
                    return StageRun {
                        outcome,
                        completed,
                        failure: Some((stage, error)),
                        total,
                    };
                }
            }
        }

        StageRun {
            outcome: aggregate(&completed, false),
            completed,
            failure: None,
            total,
        }
    }
}

/// Success only when every executed stage succeeded; a failure after an
/// earlier stage completed is partial.
fn aggregate(completed: &[StageRecord], failed: bool) -> SyncOutcome {
    match (failed, completed.is_empty()) {
        (false, _) => SyncOutcome::Success,
        (true, true) => SyncOutcome::Failure,
        (true, false) => SyncOutcome::PartialFailure,
    }
}
