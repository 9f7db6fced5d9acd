use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::precheck::{MarkerProbe, PrecheckError};
use crate::site::{SiteConfig, SiteId, SiteKind};
use crate::state::SyncState;
use crate::store::{StateError, StateStore};
use crate::transfer::{BandwidthLimit, Stage, TransferBackend, TransferError, TransferOutcome};

/// A single-stage rsync site with no precheck file.
pub fn sample_site(id: &str) -> SiteConfig {
    SiteConfig {
        id: SiteId::new(id),
        name: id.to_owned(),
        kind: SiteKind::Rsync,
        host: "mirror.example.org".to_owned(),
        remote_dir: id.to_owned(),
        dest: PathBuf::from("/srv/mirror").join(id),
        exclude_patterns: Vec::new(),
        precheck_file: None,
        first_stage_exclude_patterns: Vec::new(),
        bandwidth_limit_mbps: None,
    }
}

pub fn stage_outcome(files_changed: u64) -> TransferOutcome {
    TransferOutcome {
        bytes_transferred: files_changed * 1024,
        files_changed,
        exit_status: 0,
        stderr_tail: String::new(),
        duration: Duration::from_millis(10),
    }
}

/// In-memory state store for testing.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<BTreeMap<SiteId, SyncState>>,
    unreadable: Mutex<BTreeSet<SiteId>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(states: impl IntoIterator<Item = (SiteId, SyncState)>) -> Self {
        Self {
            states: Mutex::new(states.into_iter().collect()),
            unreadable: Mutex::default(),
        }
    }

    /// Reads of `id` fail as corrupt until the next write replaces it.
    pub fn with_unreadable(self, id: &str) -> Self {
        self.unreadable.lock().unwrap().insert(SiteId::new(id));
        self
    }

    fn check_readable(&self, id: &SiteId) -> Result<(), StateError> {
        if self.unreadable.lock().unwrap().contains(id) {
            return Err(StateError::Corrupt {
                site: id.clone(),
                message: "unreadable record".into(),
            });
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<SiteId, SyncState>>, StateError> {
        self.states
            .lock()
            .map_err(|_| StateError::Storage("state lock poisoned".into()))
    }
}

impl StateStore for InMemoryStateStore {
    fn load_all(&self) -> Result<BTreeMap<SiteId, SyncState>, StateError> {
        let states = self.lock()?;
        for id in states.keys() {
            self.check_readable(id)?;
        }
        Ok(states.clone())
    }

    fn get(&self, id: &SiteId) -> Result<Option<SyncState>, StateError> {
        self.check_readable(id)?;
        Ok(self.lock()?.get(id).cloned())
    }

    fn put(&self, id: &SiteId, state: &SyncState) -> Result<(), StateError> {
        self.lock()?.insert(id.clone(), state.clone());
        self.unreadable.lock().unwrap().remove(id);
        Ok(())
    }

    fn ensure(&self, id: &SiteId) -> Result<(), StateError> {
        self.lock()?.entry(id.clone()).or_default();
        Ok(())
    }

    fn retain(&self, keep: &[SiteId]) -> Result<usize, StateError> {
        let mut states = self.lock()?;
        let before = states.len();
        states.retain(|id, _| keep.contains(id));
        Ok(before - states.len())
    }
}

/// Probe returning a fixed marker or a fixed failure, counting calls.
pub struct StaticProbe {
    result: Result<String, PrecheckError>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn marker(marker: impl Into<String>) -> Self {
        Self {
            result: Ok(marker.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            result: Err(PrecheckError::Unreachable(message.into())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MarkerProbe for StaticProbe {
    async fn fetch_marker(&self, _site: &SiteConfig) -> Result<String, PrecheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Backend answering from a script keyed by site and stage.
///
/// Unscripted stages succeed with nothing transferred. Records every call
/// and the highest number of calls that were in flight at once.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<HashMap<(SiteId, Stage), Result<TransferOutcome, TransferError>>>,
    calls: Mutex<Vec<(SiteId, Stage, BandwidthLimit)>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(
        &self,
        site: &str,
        stage: Stage,
        response: Result<TransferOutcome, TransferError>,
    ) {
        self.responses
            .lock()
            .unwrap()
            .insert((SiteId::new(site), stage), response);
    }

    /// Stages executed for `site`, in call order.
    pub fn invocations(&self, site: &str) -> Vec<Stage> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id.as_str() == site)
            .map(|(_, stage, _)| *stage)
            .collect()
    }

    pub fn total_invocations(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn bandwidths(&self) -> Vec<BandwidthLimit> {
        self.calls.lock().unwrap().iter().map(|(_, _, bw)| *bw).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TransferBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.calls
            .lock()
            .unwrap()
            .push((site.id.clone(), stage, bandwidth));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .get(&(site.id.clone(), stage))
            .cloned()
            .unwrap_or_else(|| Ok(stage_outcome(0)))
    }
}
