use std::path::PathBuf;

use mirror_sync::{
    BandwidthLimit, SiteConfig, SiteKind, Stage, TransferBackend, TransferError, TransferOutcome,
};

use crate::process::{ToolCommand, ToolRunner, ensure_dest_dir};

/// Syncs a Debian-style archive with debmirror.
///
/// All distributions, architectures and sections go into a single call.
/// debmirror does not report transfer counters, so outcomes carry only the
/// exit status, stderr and duration.
pub struct DebmirrorBackend {
    program: PathBuf,
    runner: ToolRunner,
}

impl DebmirrorBackend {
    pub fn new(program: impl Into<PathBuf>, runner: ToolRunner) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

/// Arguments for one debmirror pass, or `None` for a non-debmirror site.
///
/// Exclude patterns are handed to debmirror unchanged, so they are its
/// regular expressions rather than globs.
pub fn build_args(site: &SiteConfig, stage: Stage, bandwidth: BandwidthLimit) -> Option<Vec<String>> {
    let SiteKind::Debmirror {
        distributions,
        architectures,
        sections,
        method,
    } = &site.kind
    else {
        return None;
    };

    let mut args = vec![
        format!("--method={method}"),
        "--diff=none".to_owned(),
        format!("--host={}", site.host),
        format!("--root={}", site.remote_dir),
        format!("--dist={}", distributions.join(",")),
        format!("--arch={}", architectures.join(",")),
        format!("--section={}", sections.join(",")),
        "--rsync-batch=10000".to_owned(),
        "--no-check-gpg".to_owned(),
        format!("--rsync-options=-aIL --partial --bwlimit={}", bandwidth.rsync_kib()),
    ];

    for pattern in &site.exclude_patterns {
        args.push(format!("--exclude={pattern}"));
    }

    if stage.excludes_first_stage() {
        for pattern in &site.first_stage_exclude_patterns {
            args.push(format!("--exclude={pattern}"));
        }
    }

    if !stage.deletes() {
        args.push("--nocleanup".to_owned());
    }

    args.push(site.dest.display().to_string());
    Some(args)
}

#[async_trait::async_trait]
impl TransferBackend for DebmirrorBackend {
    fn name(&self) -> &str {
        "debmirror"
    }

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError> {
        let args = build_args(site, stage, bandwidth).ok_or_else(|| TransferError::Launch {
            tool: "debmirror".into(),
            message: format!("site {} is not a debmirror site", site.id),
        })?;

        ensure_dest_dir(&site.dest).await?;

        let cmd = ToolCommand::new("debmirror", &self.program, args);
        let run = self.runner.run(&cmd, |_| false).await?;

        self.runner.finish(site, stage).await;

        Ok(TransferOutcome {
            bytes_transferred: 0,
            files_changed: 0,
            exit_status: run.code,
            stderr_tail: run.stderr_tail,
            duration: run.duration,
        })
    }
}
