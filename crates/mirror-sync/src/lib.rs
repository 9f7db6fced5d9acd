pub mod job;
pub mod orchestrator;
pub mod precheck;
pub mod site;
pub mod stage;
pub mod state;
pub mod store;
pub mod transfer;

pub use job::{JobError, JobReport, JobResult, JobRunner, ScheduledSite};
pub use orchestrator::{CycleReport, FailureBackoff, Orchestrator, OrchestratorSettings};
pub use precheck::{MarkerProbe, PrecheckDecision, PrecheckError, PrecheckGate};
pub use site::{
    ConfigError, FetchMethod, RejectedSite, SiteConfig, SiteEntry, SiteId, SiteKind, SiteSet,
    load_sites,
};
pub use stage::{StageRecord, StageRun, StageScheduler, StageState};
pub use state::{ErrorKind, SyncOutcome, SyncState, TransferSummary};
pub use store::{StateError, StateStore};
pub use transfer::{BandwidthLimit, Stage, TransferBackend, TransferError, TransferOutcome};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
