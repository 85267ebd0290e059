use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::FastStorageConfig;
use crate::metric;

/// A RAM-backed mirror of the models directory.
///
/// When the mount is missing or not writable, fast storage is disabled and every lookup falls
/// back to the durable directory.
#[derive(Clone, Debug, Default)]
pub struct FastStorage {
    models_dir: Option<PathBuf>,
}

impl FastStorage {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Checks that the configured mount can be used.
    pub fn prepare(config: &FastStorageConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let models_dir = config.path.join("models");
        match check_writable(&models_dir) {
            Ok(()) => {
                tracing::info!("Using fast storage at `{}`", models_dir.display());
                Self {
                    models_dir: Some(models_dir),
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Fast storage at `{}` is not usable, falling back to the models directory",
                    config.path.display()
                );
                metric!(counter("fast_storage.unavailable") += 1);
                Self::disabled()
            }
        }
    }

    /// The mirrored models directory, if fast storage is usable.
    pub fn models_dir(&self) -> Option<&Path> {
        self.models_dir.as_deref()
    }

    /// Whether every artifact in `names` is already present in fast storage.
    pub fn contains_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        match self.models_dir {
            Some(ref dir) => names.iter().all(|name| dir.join(name.as_ref()).is_file()),
            None => false,
        }
    }

    /// Copies the named artifacts from `source_dir` into fast storage.
    ///
    /// Files already present with the same size are skipped. Returns the number of copied files.
    pub async fn mirror(&self, source_dir: &Path, names: &[String]) -> io::Result<usize> {
        let Some(target_dir) = self.models_dir.clone() else {
            return Ok(0);
        };
        let source_dir = source_dir.to_owned();
        let names = names.to_vec();
        tokio::task::spawn_blocking(move || mirror_files(&source_dir, &target_dir, &names))
            .await
            .map_err(io::Error::other)?
    }
}

fn check_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    // the probe is removed again on drop
    NamedTempFile::new_in(dir)?;
    Ok(())
}

fn mirror_files(source_dir: &Path, target_dir: &Path, names: &[String]) -> io::Result<usize> {
    let mut copied = 0;
    for name in names {
        let source = source_dir.join(name);
        let Ok(source_meta) = fs::metadata(&source) else {
            continue;
        };
        let target = target_dir.join(name);
        if let Ok(target_meta) = fs::metadata(&target) {
            if target_meta.len() == source_meta.len() {
                continue;
            }
        }

        tracing::info!("Copying `{}` to fast storage", source.display());
        let temp = NamedTempFile::new_in(target_dir)?;
        fs::copy(&source, temp.path())?;
        temp.persist(&target).map_err(|err| err.error)?;
        metric!(time_raw("fast_storage.copied_bytes") = source_meta.len());
        copied += 1;
    }
    Ok(copied)
}
