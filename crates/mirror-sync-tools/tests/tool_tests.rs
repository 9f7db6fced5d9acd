#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mirror_sync::test_support::sample_site;
use mirror_sync::{
    BandwidthLimit, FetchMethod, SiteKind, Stage, TransferBackend, TransferError,
};
use mirror_sync_tools::{
    ReposyncBackend, RetryPolicy, RsyncBackend, ToolCommand, ToolRunner, ensure_dest_dir,
};

/// Write an executable shell script standing in for a transfer tool.
fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn sh(script: &str) -> ToolCommand {
    ToolCommand::new("sh", "sh", vec!["-c".into(), script.into()])
}

#[tokio::test]
async fn rsync_backend_reports_parsed_stats() {
    let dir = tempfile::tempdir().unwrap();
    let rsync = fake_tool(
        dir.path(),
        "rsync",
        r#"echo "Number of regular files transferred: 1,204"
echo "Total transferred file size: 98,765 bytes""#,
    );

    let mut site = sample_site("rocky");
    site.dest = dir.path().join("mirror/rocky");

    let backend = RsyncBackend::new(rsync, ToolRunner::default());
    let outcome = backend
        .execute(&site, Stage::Single, BandwidthLimit::default())
        .await
        .unwrap();

    assert_eq!(outcome.files_changed, 1204);
    assert_eq!(outcome.bytes_transferred, 98_765);
    assert_eq!(outcome.exit_status, 0);
    assert!(site.dest.is_dir());
}

#[tokio::test]
async fn dropped_transfer_kills_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let finished = dir.path().join("finished");
    let rsync = fake_tool(
        dir.path(),
        "rsync",
        &format!("sleep 2\ntouch '{}'", finished.display()),
    );

    let mut site = sample_site("rocky");
    site.dest = dir.path().join("mirror/rocky");

    let backend = RsyncBackend::new(rsync, ToolRunner::default());
    let transfer = backend.execute(&site, Stage::Single, BandwidthLimit::default());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), transfer)
            .await
            .is_err()
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!finished.exists());
}

#[tokio::test]
async fn reposync_backend_counts_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let dnf = fake_tool(
        dir.path(),
        "dnf",
        r#"echo "Extra Packages 12 MB/s | 20 MB 00:01"
echo "(1/2): a-1.0-1.el9.noarch.rpm 1 MB/s | 20 kB 00:00"
echo "(2/2): b-2.0-1.el9.x86_64.rpm 2 MB/s | 40 kB 00:00""#,
    );

    let mut site = sample_site("epel");
    site.kind = SiteKind::Reposync {
        method: FetchMethod::Https,
    };
    site.dest = dir.path().join("epel");

    let backend = ReposyncBackend::new(dnf, ToolRunner::default());
    let outcome = backend
        .execute(&site, Stage::Single, BandwidthLimit::default())
        .await
        .unwrap();

    assert_eq!(outcome.files_changed, 2);
}

#[tokio::test]
async fn auth_failure_in_stderr_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let rsync = fake_tool(
        dir.path(),
        "rsync",
        r#"echo "@ERROR: auth failed on module rocky" >&2
exit 5"#,
    );

    let mut site = sample_site("rocky");
    site.dest = dir.path().join("rocky");

    let err = RsyncBackend::new(rsync, ToolRunner::default())
        .execute(&site, Stage::Single, BandwidthLimit::default())
        .await
        .unwrap_err();

    assert_eq!(err, TransferError::Auth("@ERROR: auth failed on module rocky".into()));
}

#[tokio::test]
async fn missing_binary_is_a_launch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut site = sample_site("rocky");
    site.dest = dir.path().join("rocky");

    let err = RsyncBackend::new(dir.path().join("no-such-rsync"), ToolRunner::default())
        .execute(&site, Stage::Single, BandwidthLimit::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Launch { .. }));
}

#[tokio::test]
async fn tool_failure_keeps_stderr_tail() {
    let runner = ToolRunner::default();
    let err = runner
        .run(&sh("echo partial >&2; echo 'some files vanished' >&2; exit 24"), |_| false)
        .await
        .unwrap_err();

    match err {
        TransferError::Tool { code, stderr, .. } => {
            assert_eq!(code, 24);
            assert_eq!(stderr, "partial\nsome files vanished");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn retries_configured_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    let script = format!(
        "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 3 ] && exit 0; exit 10",
        c = counter.display()
    );

    let runner = ToolRunner::new(
        RetryPolicy {
            retries: 5,
            exit_codes: vec![10],
        },
        None,
    );
    let run = runner.run(&sh(&script), |_| false).await.unwrap();

    assert_eq!(run.code, 0);
    assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "3");
}

#[tokio::test]
async fn without_retries_socket_errors_fail_as_network() {
    let err = ToolRunner::default()
        .run(&sh("echo 'rsync error: error in socket IO (code 10)' >&2; exit 10"), |_| false)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Network(_)));
}

#[tokio::test]
async fn ensure_dest_dir_creates_nested_directories() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("a/b/c");

    ensure_dest_dir(&dest).await.unwrap();

    let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
    assert!(dest.is_dir());
    assert_eq!(mode & 0o700, 0o700);
    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
}

#[tokio::test]
async fn ensure_dest_dir_leaves_existing_tree_as_it_was() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fullfilelist"), b"x").unwrap();

    ensure_dest_dir(dir.path()).await.unwrap();

    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names, vec!["fullfilelist"]);
}

#[tokio::test]
async fn ensure_dest_dir_rejects_regular_files() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();

    let err = ensure_dest_dir(&file).await.unwrap_err();
    assert!(matches!(err, TransferError::Destination(_)));
}
