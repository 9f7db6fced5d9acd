use std::sync::Arc;

use crate::site::SiteConfig;

/// Errors raised while fetching a remote precheck marker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrecheckError {
    #[error("precheck unreachable: {0}")]
    Unreachable(String),
}

/// Fetches the current remote marker for a site's precheck file.
#[async_trait::async_trait]
pub trait MarkerProbe: Send + Sync {
    async fn fetch_marker(&self, site: &SiteConfig) -> Result<String, PrecheckError>;
}

#[async_trait::async_trait]
impl<T: MarkerProbe + ?Sized> MarkerProbe for Arc<T> {
    async fn fetch_marker(&self, site: &SiteConfig) -> Result<String, PrecheckError> {
        (**self).fetch_marker(site).await
    }
}

/// Whether a job should run, and the marker to record if it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecheckDecision {
    pub proceed: bool,
    pub new_marker: Option<String>,
}

impl PrecheckDecision {
    fn proceed(new_marker: Option<String>) -> Self {
        Self {
            proceed: true,
            new_marker,
        }
    }

    fn skip(marker: String) -> Self {
        Self {
            proceed: false,
            new_marker: Some(marker),
        }
    }
}

/// Decides whether a sync is needed by comparing remote and recorded markers.
///
/// Never blocks progress: a missing precheck file, a changed marker, or a
/// probe failure all mean "proceed".
#[derive(Clone)]
pub struct PrecheckGate {
    probe: Arc<dyn MarkerProbe>,
}

impl PrecheckGate {
    pub fn new(probe: Arc<dyn MarkerProbe>) -> Self {
        Self { probe }
    }

    pub async fn should_sync(
        &self,
        site: &SiteConfig,
        last_known_marker: Option<&str>,
    ) -> PrecheckDecision {
        if site.precheck_file.is_none() {
            return PrecheckDecision::proceed(None);
        }

        match self.probe.fetch_marker(site).await {
            Ok(marker) if last_known_marker == Some(marker.as_str()) => {
                tracing::debug!(site = %site.id, %marker, "precheck marker unchanged");
                PrecheckDecision::skip(marker)
            }
            Ok(marker) => {
                tracing::debug!(site = %site.id, %marker, "precheck marker changed");
                PrecheckDecision::proceed(Some(marker))
            }
            Err(e) => {
                tracing::warn!(site = %site.id, error = %e, "precheck failed, syncing anyway");
                PrecheckDecision::proceed(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{StaticProbe, sample_site};

    use super::*;

    fn gate(probe: StaticProbe) -> (PrecheckGate, Arc<StaticProbe>) {
        let probe = Arc::new(probe);
        (PrecheckGate::new(probe.clone()), probe)
    }

    #[tokio::test]
    async fn no_precheck_file_always_proceeds_without_probing() {
        let (gate, probe) = gate(StaticProbe::marker("m1"));
        let site = sample_site("rocky");

        let decision = gate.should_sync(&site, Some("m1")).await;

        assert!(decision.proceed);
        assert_eq!(decision.new_marker, None);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn matching_marker_skips() {
        let (gate, probe) = gate(StaticProbe::marker("m1"));
        let mut site = sample_site("rocky");
        site.precheck_file = Some("fullfilelist".into());

        let decision = gate.should_sync(&site, Some("m1")).await;

        assert!(!decision.proceed);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn changed_marker_proceeds_with_new_marker() {
        let (gate, _) = gate(StaticProbe::marker("m2"));
        let mut site = sample_site("rocky");
        site.precheck_file = Some("fullfilelist".into());

        let decision = gate.should_sync(&site, Some("m1")).await;

        assert!(decision.proceed);
        assert_eq!(decision.new_marker.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn first_sync_proceeds() {
        let (gate, _) = gate(StaticProbe::marker("m1"));
        let mut site = sample_site("rocky");
        site.precheck_file = Some("fullfilelist".into());

        let decision = gate.should_sync(&site, None).await;
        assert!(decision.proceed);
        assert_eq!(decision.new_marker.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn unreachable_precheck_fails_open() {
        let (gate, _) = gate(StaticProbe::unreachable("connection refused"));
        let mut site = sample_site("rocky");
        site.precheck_file = Some("fullfilelist".into());

        let decision = gate.should_sync(&site, Some("m1")).await;

        assert!(decision.proceed);
        assert_eq!(decision.new_marker, None);
    }
}
