use std::path::PathBuf;

use mirror_sync::{BandwidthLimit, SiteConfig, Stage, TransferBackend, TransferError, TransferOutcome};

use crate::process::{ToolCommand, ToolRunner, ensure_dest_dir};

/// Syncs a site with plain rsync, one invocation per stage.
pub struct RsyncBackend {
    program: PathBuf,
    runner: ToolRunner,
}

impl RsyncBackend {
    pub fn new(program: impl Into<PathBuf>, runner: ToolRunner) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    pub fn command(&self, site: &SiteConfig, stage: Stage, bandwidth: BandwidthLimit) -> ToolCommand {
        ToolCommand::new("rsync", &self.program, build_args(site, stage, bandwidth))
    }
}

/// Arguments for one rsync pass.
///
/// The content pass holds back the first-stage patterns and never deletes;
/// the metadata and single passes delete, deferring removals and renames
/// until the transfer is complete.
pub fn build_args(site: &SiteConfig, stage: Stage, bandwidth: BandwidthLimit) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-motd",
        "--stats",
        "--recursive",
        "--links",
        "--perms",
        "--times",
        "--devices",
        "--specials",
        "--sparse",
        "--partial",
        "--hard-links",
        "--exclude=*.~tmp~",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    args.push(format!("--bwlimit={}", bandwidth.rsync_kib()));

    for pattern in &site.exclude_patterns {
        args.push(format!("--exclude={pattern}"));
    }

    if stage.excludes_first_stage() {
        for pattern in &site.first_stage_exclude_patterns {
            args.push(format!("--exclude={pattern}"));
        }
    }

    if stage.deletes() {
        args.push("--delete-delay".into());
        args.push("--delay-updates".into());
        args.push("--delete-excluded".into());
    }

    args.push(format!("{}/", site.upstream_url()));
    args.push(with_trailing_slash(&site.dest.display().to_string()));
    args
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

/// Counters from the `--stats` block printed at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RsyncStats {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

pub fn parse_stats(lines: &[String]) -> RsyncStats {
    let mut stats = RsyncStats::default();

    for line in lines {
        let line = line.trim();
        if let Some(rest) = line
            .strip_prefix("Number of regular files transferred:")
            .or_else(|| line.strip_prefix("Number of files transferred:"))
        {
            stats.files_transferred = leading_number(rest);
        } else if let Some(rest) = line.strip_prefix("Total transferred file size:") {
            stats.bytes_transferred = leading_number(rest);
        }
    }

    stats
}

/// Parse the first number in `s`, ignoring thousands separators.
fn leading_number(s: &str) -> u64 {
    s.trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl TransferBackend for RsyncBackend {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn execute(
        &self,
        site: &SiteConfig,
        stage: Stage,
        bandwidth: BandwidthLimit,
    ) -> Result<TransferOutcome, TransferError> {
        ensure_dest_dir(&site.dest).await?;

        let run = self
            .runner
            .run(&self.command(site, stage, bandwidth), |_| false)
            .await?;
        let stats = parse_stats(&run.stdout_tail);

        self.runner.finish(site, stage).await;

        Ok(TransferOutcome {
            bytes_transferred: stats.bytes_transferred,
            files_changed: stats.files_transferred,
            exit_status: run.code,
            stderr_tail: run.stderr_tail,
            duration: run.duration,
        })
    }
}
