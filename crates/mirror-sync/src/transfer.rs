use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::site::SiteConfig;
use crate::state::ErrorKind;

/// One pass of a transfer tool over a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// First pass of a two-stage sync: bulk content, first-stage patterns
    /// excluded, nothing deleted.
    Content,
    /// Second pass of a two-stage sync: everything, deletion enabled.
    Metadata,
    /// The only pass of a single-stage sync, deletion enabled.
    Single,
}

impl Stage {
    /// Whether files missing upstream are removed locally during this pass.
    pub fn deletes(&self) -> bool {
        !matches!(self, Self::Content)
    }

    /// Whether the site's first-stage exclude patterns apply to this pass.
    pub fn excludes_first_stage(&self) -> bool {
        matches!(self, Self::Content)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => write!(f, "stage 1 (content)"),
            Self::Metadata => write!(f, "stage 2 (metadata)"),
            Self::Single => write!(f, "single stage"),
        }
    }
}

/// Throughput cap handed to a transfer subprocess, in megabits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit(u32);

impl BandwidthLimit {
    pub const DEFAULT_MBPS: u32 = 100;

    pub fn from_mbps(mbps: u32) -> Self {
        Self(mbps)
    }

    pub fn mbps(&self) -> u32 {
        self.0
    }

    /// Value for rsync's `--bwlimit`, which is expressed in KiB.
    pub fn rsync_kib(&self) -> u64 {
        u64::from(self.0) * 1024
    }

    /// Bytes per second for tools that take a raw byte rate.
    pub fn bytes_per_sec(&self) -> u64 {
        u64::from(self.0) * 125_000
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self(Self::DEFAULT_MBPS)
    }
}

/// Result of a single successful backend invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes_transferred: u64,
    pub files_changed: u64,
    pub exit_status: i32,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl TransferOutcome {
    /// Fold another stage's outcome into this running total.
    pub fn absorb(&mut self, other: &TransferOutcome) {
        self.bytes_transferred += other.bytes_transferred;
        self.files_changed += other.files_changed;
        self.exit_status = other.exit_status;
        self.duration += other.duration;
        if !other.stderr_tail.is_empty() {
            self.stderr_tail = other.stderr_tail.clone();
        }
    }
}

/// Errors raised by a transfer backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{tool} exited with status {code}: {stderr}")]
    Tool {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to launch {tool}: {message}")]
    Launch { tool: String, message: String },

    #[error("destination unusable: {0}")]
    Destination(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::TransferAuth,
            Self::Network(_) => ErrorKind::TransferNetwork,
            Self::Tool { .. } | Self::Launch { .. } => ErrorKind::TransferTool,
            Self::Destination(_) => ErrorKind::Destination,
            Self::Timeout(_) => ErrorKind::TransferTimeout,
        }
    }
}

/// Executes one stage of a site's sync through an external tool.
///
/// Implementations are picked once per site when the configuration is
/// loaded and reused for every stage and every cycle.
#[async_trait::async_trait]
pub trait TransferBackend: Send + Sync {
    /// Short name of the underlying tool, for logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError>;
}

#[async_trait::async_trait]
impl<T: TransferBackend + ?Sized> TransferBackend for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError> {
        (**self).execute(site, stage, bandwidth).await
    }
}
