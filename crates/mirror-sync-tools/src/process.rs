//! Running external transfer tools and turning their exit into a verdict.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use mirror_sync::{SiteConfig, Stage, TransferError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Lines of stderr kept for error reports.
pub const STDERR_TAIL_LINES: usize = 20;
/// Upper bound on the rendered stderr tail.
pub const STDERR_TAIL_BYTES: usize = 4096;
/// Lines of stdout kept for parsing summaries printed at exit.
pub const STDOUT_TAIL_LINES: usize = 64;

/// rsync exit codes that mean the connection, not the transfer, failed.
const NETWORK_EXIT_CODES: &[i32] = &[10, 12, 30, 35];

const AUTH_MARKERS: &[&str] = &[
    "auth failed",
    "authentication failed",
    "permission denied (publickey",
    "password",
    "401 unauthorized",
    "403 forbidden",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "no route to host",
    "network is unreachable",
    "name or service not known",
    "temporary failure in name resolution",
    "could not resolve",
];

/// Re-run a tool when it exits with one of `exit_codes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub exit_codes: Vec<i32>,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    fn should_retry(&self, attempt: u32, code: i32) -> bool {
        attempt <= self.retries && self.exit_codes.contains(&code)
    }
}

/// A fully built tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Name used in logs and errors.
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args,
        }
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|a| quote_arg(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.contains([' ', '"', '\\', '*', '|']) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_owned()
    }
}

/// Everything captured from one finished tool process.
#[derive(Debug, Clone, Default)]
pub struct ToolRun {
    pub code: i32,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: String,
    /// stdout lines accepted by the caller's line filter.
    pub matched_lines: u64,
    pub duration: Duration,
}

/// Bounded buffer of the most recent lines.
#[derive(Debug)]
struct Tail {
    lines: VecDeque<String>,
    limit: usize,
}

impl Tail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Join lines and keep at most the last `max_bytes`, on a char boundary.
pub fn render_tail(lines: &[String], max_bytes: usize) -> String {
    let joined = lines.join("\n");
    if joined.len() <= max_bytes {
        return joined;
    }
    let mut start = joined.len() - max_bytes;
    while !joined.is_char_boundary(start) {
        start += 1;
    }
    joined[start..].to_owned()
}

async fn collect_lines<R>(
    reader: R,
    limit: usize,
    mut on_line: impl FnMut(&str),
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = Tail::new(limit);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_owned();
                on_line(&line);
                tail.push(line);
            }
        }
    }

    tail.into_lines()
}

/// Spawn a tool and wait for it, capturing bounded output.
///
/// The child is killed if this future is dropped. A non-zero exit is not an
/// error here; see [`ToolRunner::run`].
pub async fn run_tool(cmd: &ToolCommand, count_line: fn(&str) -> bool) -> Result<ToolRun, TransferError> {
    let started = Instant::now();
    tracing::debug!(tool = %cmd.tool, command = %cmd.command_line(), "running");

    let launch_error = |message: String| TransferError::Launch {
        tool: cmd.tool.clone(),
        message,
    };

    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_error(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error("stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| launch_error("stderr was not captured".into()))?;

    let mut matched_lines = 0u64;
    let tool = cmd.tool.as_str();
    let read_stdout = collect_lines(stdout, STDOUT_TAIL_LINES, |line| {
        if count_line(line) {
            matched_lines += 1;
        }
    });
    let read_stderr = collect_lines(stderr, STDERR_TAIL_LINES, |line| {
        tracing::debug!(tool, line, "stderr");
    });

    let (status, stdout_tail, stderr_lines) = tokio::join!(child.wait(), read_stdout, read_stderr);
    let status = status.map_err(|e| launch_error(e.to_string()))?;

    Ok(ToolRun {
        code: status.code().unwrap_or(-1),
        stdout_tail,
        stderr_tail: render_tail(&stderr_lines, STDERR_TAIL_BYTES),
        matched_lines,
        duration: started.elapsed(),
    })
}

/// Map a failed exit to the matching transfer error.
pub fn classify_failure(tool: &str, code: i32, stderr: &str) -> TransferError {
    let lower = stderr.to_lowercase();
    let last_line = stderr.lines().last().unwrap_or_default().to_owned();

    if let Some(line) = stderr.lines().find(|line| {
        let line = line.to_lowercase();
        AUTH_MARKERS.iter().any(|m| line.contains(m))
    }) {
        return TransferError::Auth(line.trim().to_owned());
    }

    if NETWORK_EXIT_CODES.contains(&code) || NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        return TransferError::Network(format!("{tool} exited with status {code}: {last_line}"));
    }

    TransferError::Tool {
        tool: tool.to_owned(),
        code,
        stderr: stderr.to_owned(),
    }
}

/// Shared execution policy for every backend.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner {
    retry: RetryPolicy,
    restorecon: Option<PathBuf>,
}

impl ToolRunner {
    pub fn new(retry: RetryPolicy, restorecon: Option<PathBuf>) -> Self {
        Self { retry, restorecon }
    }

    /// Run a tool, retrying on configured exit codes, and fail on a non-zero
    /// final exit.
    pub async fn run(
        &self,
        cmd: &ToolCommand,
        count_line: fn(&str) -> bool,
    ) -> Result<ToolRun, TransferError> {
        let mut attempt = 1;
        loop {
            let run = run_tool(cmd, count_line).await?;
            if run.code == 0 {
                return Ok(run);
            }
            if self.retry.should_retry(attempt, run.code) {
                tracing::warn!(tool = %cmd.tool, code = run.code, attempt, "retrying");
                attempt += 1;
                continue;
            }
            return Err(classify_failure(&cmd.tool, run.code, &run.stderr_tail));
        }
    }

    /// Post-sync housekeeping after the last stage of a site succeeded.
    pub async fn finish(&self, site: &SiteConfig, stage: Stage) {
        if !stage.deletes() {
            return;
        }
        let Some(restorecon) = &self.restorecon else {
            return;
        };

        tracing::info!(site = %site.id, dest = %site.dest.display(), "restoring SELinux context");
        let cmd = ToolCommand::new(
            "restorecon",
            restorecon,
            vec!["-R".into(), site.dest.display().to_string()],
        );
        match run_tool(&cmd, |_| false).await {
            Ok(run) if run.code == 0 => {}
            Ok(run) => tracing::warn!(site = %site.id, code = run.code, stderr = %run.stderr_tail, "restorecon failed"),
            Err(error) => tracing::warn!(site = %site.id, %error, "restorecon failed"),
        }
    }
}

/// Create the destination if needed and make sure it is a writable directory.
pub async fn ensure_dest_dir(path: &Path) -> Result<(), TransferError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_dir() => {
            return Err(TransferError::Destination(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        Ok(_) => {}
        Err(_) => {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder.create(path).await.map_err(|e| {
                TransferError::Destination(format!("unable to create {}: {e}", path.display()))
            })?;
        }
    }

    let write_test = path.join(".mirror-sync-write-test");
    tokio::fs::write(&write_test, b"")
        .await
        .map_err(|e| TransferError::Destination(format!("{} is not writable: {e}", path.display())))?;
    if let Err(error) = tokio::fs::remove_file(&write_test).await {
        tracing::warn!(path = %write_test.display(), %error, "could not remove write test file");
    }

    Ok(())
}

/// Whether this host is a Red Hat family distribution, where mirrored
/// trees need their SELinux context restored after a sync.
pub fn is_redhat_family() -> bool {
    std::fs::read_to_string("/etc/redhat-release")
        .map(|content| {
            ["Red Hat", "CentOS", "Fedora", "Rocky Linux", "AlmaLinux"]
                .iter()
                .any(|name| content.contains(name))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_recognised() {
        let err = classify_failure("rsync", 5, "@ERROR: auth failed on module debian\nrsync error: error starting client-server protocol");
        assert!(matches!(err, TransferError::Auth(_)));
    }

    #[test]
    fn socket_errors_are_network_failures() {
        let err = classify_failure("rsync", 10, "rsync error: error in socket IO (code 10)");
        assert!(matches!(err, TransferError::Network(_)));

        let err = classify_failure("debmirror", 255, "rsync: getaddrinfo: ftp.example.org 873: Name or service not known");
        assert!(matches!(err, TransferError::Network(_)));
    }

    #[test]
    fn other_exits_are_tool_failures() {
        let err = classify_failure("rsync", 23, "some files/attrs were not transferred");
        assert_eq!(
            err,
            TransferError::Tool {
                tool: "rsync".into(),
                code: 23,
                stderr: "some files/attrs were not transferred".into(),
            }
        );
    }

    #[test]
    fn tail_keeps_only_last_lines() {
        let mut tail = Tail::new(2);
        tail.push("a".into());
        tail.push("b".into());
        tail.push("c".into());
        assert_eq!(tail.into_lines(), vec!["b", "c"]);
    }

    #[test]
    fn render_tail_truncates_from_the_front() {
        let lines = vec!["0123456789".to_owned(), "abcdef".to_owned()];
        assert_eq!(render_tail(&lines, 6), "abcdef");
        assert_eq!(render_tail(&lines, 100), "0123456789\nabcdef");
    }

    #[test]
    fn retry_policy_only_retries_listed_codes() {
        let policy = RetryPolicy {
            retries: 2,
            exit_codes: vec![10],
        };
        assert!(policy.should_retry(1, 10));
        assert!(policy.should_retry(2, 10));
        assert!(!policy.should_retry(3, 10));
        assert!(!policy.should_retry(1, 23));
        assert!(!RetryPolicy::none().should_retry(1, 10));
    }

    #[test]
    fn command_line_quotes_globs() {
        let cmd = ToolCommand::new(
            "rsync",
            "/usr/bin/rsync",
            vec!["--exclude=Packages*".into(), "--stats".into()],
        );
        assert_eq!(cmd.command_line(), "/usr/bin/rsync \"--exclude=Packages*\" --stats");
    }
}
