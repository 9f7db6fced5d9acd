use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

/// Single-instance guard: an exclusive advisory lock on a file, held for
/// the life of the value. The kernel drops it if the process dies.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                bail!(
                    "another instance is already running (lock {})",
                    path.display()
                );
            }
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }

        // The pid is informational; the lock itself is what excludes.
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The file stays; removing it would let a waiter lock an unlinked inode.
        if let Err(error) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), %error, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    #[test]
    fn second_handle_cannot_lock_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.lock");

        let lock = RunLock::acquire(&path).unwrap();
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(lock);
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn leftover_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.lock");
        std::fs::write(&path, "999999999\n").unwrap();

        let _lock = RunLock::acquire(&path).unwrap();
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn concurrent_acquires_yield_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.lock");
        std::fs::write(&path, "999999999\n").unwrap();

        for _ in 0..50 {
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let barrier = barrier.clone();
                    let path = path.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        RunLock::acquire(&path).ok()
                    })
                })
                .collect();

            // Every winner is still held here, so overlap would show up.
            let holders: Vec<RunLock> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            assert_eq!(holders.len(), 1);
        }
    }
}
