use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::ArtifactError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// An exclusive advisory lock on a file, shared by all processes using the same directory.
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Waits up to `timeout` for the lock on `path`, creating the file if needed.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, ArtifactError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let deadline = Instant::now() + timeout;
        let contended = fs2::lock_contended_error().kind();

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!("Acquired file lock `{}`", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_owned(),
                    });
                }
                Err(err) if err.kind() == contended => {}
                Err(err) => return Err(err.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ArtifactError::LockTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let result: io::Result<()> = FileExt::unlock(&self.file);
        if let Err(err) = result {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to unlock `{}`",
                self.path.display()
            );
        }
    }
}
