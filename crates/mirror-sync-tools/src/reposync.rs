use std::path::PathBuf;

use mirror_sync::{
    BandwidthLimit, SiteConfig, SiteKind, Stage, TransferBackend, TransferError, TransferOutcome,
};

use crate::process::{ToolCommand, ToolRunner, ensure_dest_dir};

/// Syncs a yum/dnf repository with `dnf reposync`.
pub struct ReposyncBackend {
    dnf: PathBuf,
    runner: ToolRunner,
}

impl ReposyncBackend {
    pub fn new(dnf: impl Into<PathBuf>, runner: ToolRunner) -> Self {
        Self {
            dnf: dnf.into(),
            runner,
        }
    }
}

/// Arguments for `dnf reposync`, or `None` for a non-reposync site.
///
/// The upstream is registered as a throwaway repository named after the
/// site, so no system repo file is needed.
pub fn build_args(site: &SiteConfig, bandwidth: BandwidthLimit) -> Option<Vec<String>> {
    if !matches!(site.kind, SiteKind::Reposync { .. }) {
        return None;
    }

    let id = site.id.as_str();
    let mut args = vec![
        "reposync".to_owned(),
        format!("--repofrompath={id},{}/", site.upstream_url()),
        format!("--repoid={id}"),
        format!("--download-path={}", site.dest.display()),
        "--norepopath".to_owned(),
        "--download-metadata".to_owned(),
        "--delete".to_owned(),
        format!("--setopt=throttle={}", bandwidth.bytes_per_sec()),
        format!("--setopt={id}.gpgcheck=0"),
    ];

    for pattern in &site.exclude_patterns {
        args.push(format!("--exclude={pattern}"));
    }

    Some(args)
}

/// dnf prints one `(n/total): package ...` line per downloaded file.
fn is_download_line(line: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix('(') else {
        return false;
    };
    let Some((progress, _)) = rest.split_once("):") else {
        return false;
    };
    let Some((done, total)) = progress.split_once('/') else {
        return false;
    };
    done.trim().parse::<u64>().is_ok() && total.trim().parse::<u64>().is_ok()
}

#[async_trait::async_trait]
impl TransferBackend for ReposyncBackend {
    fn name(&self) -> &str {
        "reposync"
    }

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError> {
        let args = build_args(site, bandwidth).ok_or_else(|| TransferError::Launch {
            tool: "reposync".into(),
            message: format!("site {} is not a reposync site", site.id),
        })?;

        ensure_dest_dir(&site.dest).await?;

        let cmd = ToolCommand::new("reposync", &self.dnf, args);
        let run = self.runner.run(&cmd, is_download_line).await?;

        self.runner.finish(site, stage).await;

        Ok(TransferOutcome {
            bytes_transferred: 0,
            files_changed: run.matched_lines,
            exit_status: run.code,
            stderr_tail: run.stderr_tail,
            duration: run.duration,
        })
    }
}
