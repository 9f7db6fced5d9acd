//! Remote marker probes backing the precheck gate.

use std::path::PathBuf;
use std::time::Duration;

use mirror_sync::{MarkerProbe, PrecheckError, SiteConfig};

use crate::process::{ToolCommand, run_tool};

/// Default bound on a single probe round trip.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

fn precheck_url(site: &SiteConfig) -> Result<String, PrecheckError> {
    site.precheck_url()
        .ok_or_else(|| PrecheckError::Unreachable("site has no precheck file".into()))
}

/// Lists the precheck file over the rsync protocol.
///
/// The listing line carries size, mtime and name, so any upstream update to
/// the file changes the marker.
pub struct RsyncMarkerProbe {
    program: PathBuf,
    timeout: Duration,
}

impl RsyncMarkerProbe {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

/// First non-empty listing line with runs of whitespace collapsed.
pub fn listing_marker(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|line| !line.is_empty())
}

#[async_trait::async_trait]
impl MarkerProbe for RsyncMarkerProbe {
    async fn fetch_marker(&self, site: &SiteConfig) -> Result<String, PrecheckError> {
        let url = precheck_url(site)?;
        let cmd = ToolCommand::new(
            "rsync",
            &self.program,
            vec!["--no-motd".into(), "--list-only".into(), url.clone()],
        );

        let run = tokio::time::timeout(self.timeout, run_tool(&cmd, |_| false))
            .await
            .map_err(|_| {
                PrecheckError::Unreachable(format!(
                    "listing {url} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| PrecheckError::Unreachable(e.to_string()))?;

        if run.code != 0 {
            return Err(PrecheckError::Unreachable(format!(
                "rsync exited with status {} listing {url}: {}",
                run.code, run.stderr_tail
            )));
        }

        listing_marker(&run.stdout_tail)
            .ok_or_else(|| PrecheckError::Unreachable(format!("empty listing for {url}")))
    }
}

/// Issues a `HEAD` for the precheck file over http or https.
pub struct HttpMarkerProbe {
    client: reqwest::Client,
}

impl HttpMarkerProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mirror-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait::async_trait]
impl MarkerProbe for HttpMarkerProbe {
    async fn fetch_marker(&self, site: &SiteConfig) -> Result<String, PrecheckError> {
        let url = precheck_url(site)?;

        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| PrecheckError::Unreachable(format!("HEAD {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PrecheckError::Unreachable(format!("HEAD {url}: HTTP {status}")));
        }

        if let Some(etag) = header(&response, "etag") {
            return Ok(format!("etag:{etag}"));
        }

        match header(&response, "last-modified") {
            Some(modified) => match header(&response, "content-length") {
                Some(length) => Ok(format!("last-modified:{modified};length:{length}")),
                None => Ok(format!("last-modified:{modified}")),
            },
            None => Err(PrecheckError::Unreachable(format!(
                "HEAD {url}: no ETag or Last-Modified header"
            ))),
        }
    }
}

/// For fetch methods with no way to probe a marker.
pub struct UnavailableProbe;

#[async_trait::async_trait]
impl MarkerProbe for UnavailableProbe {
    async fn fetch_marker(&self, site: &SiteConfig) -> Result<String, PrecheckError> {
        Err(PrecheckError::Unreachable(format!(
            "no precheck probe for {} upstreams",
            site.kind.method()
        )))
    }
}
