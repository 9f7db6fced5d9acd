use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mirror_sync::{
    FetchMethod, MarkerProbe, PrecheckGate, ScheduledSite, SiteConfig, SiteKind, TransferBackend,
};

use crate::debmirror::DebmirrorBackend;
use crate::probe::{DEFAULT_PROBE_TIMEOUT, HttpMarkerProbe, RsyncMarkerProbe, UnavailableProbe};
use crate::process::{RetryPolicy, ToolRunner};
use crate::reposync::ReposyncBackend;
use crate::rsync::RsyncBackend;

/// Program locations and execution policy shared by every tool.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub rsync: PathBuf,
    pub debmirror: PathBuf,
    pub dnf: PathBuf,
    pub restorecon: PathBuf,
    /// Run `restorecon -R` on a destination after its final stage.
    pub relabel: bool,
    pub retry: RetryPolicy,
    pub probe_timeout: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            rsync: "rsync".into(),
            debmirror: "debmirror".into(),
            dnf: "dnf".into(),
            restorecon: "restorecon".into(),
            relabel: false,
            retry: RetryPolicy::none(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// One instance of every backend and probe, handed out per site.
pub struct ToolSet {
    rsync: Arc<dyn TransferBackend>,
    debmirror: Arc<dyn TransferBackend>,
    reposync: Arc<dyn TransferBackend>,
    rsync_probe: Arc<dyn MarkerProbe>,
    http_probe: Arc<dyn MarkerProbe>,
    unavailable_probe: Arc<dyn MarkerProbe>,
}

impl ToolSet {
    /// Fails only if the HTTP client cannot be built.
    pub fn new(settings: &ToolSettings) -> reqwest::Result<Self> {
        let runner = ToolRunner::new(
            settings.retry.clone(),
            settings.relabel.then(|| settings.restorecon.clone()),
        );

        Ok(Self {
            rsync: Arc::new(RsyncBackend::new(&settings.rsync, runner.clone())),
            debmirror: Arc::new(DebmirrorBackend::new(&settings.debmirror, runner.clone())),
            reposync: Arc::new(ReposyncBackend::new(&settings.dnf, runner)),
            rsync_probe: Arc::new(RsyncMarkerProbe::new(&settings.rsync, settings.probe_timeout)),
            http_probe: Arc::new(HttpMarkerProbe::new(settings.probe_timeout)?),
            unavailable_probe: Arc::new(UnavailableProbe),
        })
    }

    pub fn backend_for(&self, kind: &SiteKind) -> Arc<dyn TransferBackend> {
        match kind {
            SiteKind::Rsync => self.rsync.clone(),
            SiteKind::Debmirror { .. } => self.debmirror.clone(),
            SiteKind::Reposync { .. } => self.reposync.clone(),
        }
    }

    /// The probe matching how the site's upstream is reached.
    pub fn probe_for(&self, kind: &SiteKind) -> Arc<dyn MarkerProbe> {
        match kind.method() {
            FetchMethod::Rsync => self.rsync_probe.clone(),
            FetchMethod::Http | FetchMethod::Https => self.http_probe.clone(),
            FetchMethod::Ftp => self.unavailable_probe.clone(),
        }
    }

    pub fn schedule(&self, site: SiteConfig) -> ScheduledSite {
        let backend = self.backend_for(&site.kind);
        let gate = PrecheckGate::new(self.probe_for(&site.kind));
        ScheduledSite::new(site, backend, gate)
    }
}
