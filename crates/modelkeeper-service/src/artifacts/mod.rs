//! Guarded acquisition of model artifacts.
//!
//! Downloads are serialized through a lock file in the models directory, written to a
//! temporary file next to their target and only moved into place once they pass the
//! integrity check. Optionally, artifacts are mirrored into [`FastStorage`].
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::ModelsConfig;
use crate::metric;

mod fast_storage;
mod fetch;
mod filelock;

pub use self::fast_storage::FastStorage;
pub use self::fetch::{ArtifactFetcher, HttpFetcher};
pub use self::filelock::FileLock;

/// Artifacts acquired when no URL list exists yet.
pub const DEFAULT_MODEL_URLS: &[&str] = &[
    "https://huggingface.co/NousResearch/Hermes-2-Theta-Llama-3-8B-GGUF/resolve/main/Hermes-2-Pro-Llama-3-Instruct-Merged-DPO-Q4_K_M.gguf",
    "https://huggingface.co/QuantFactory/Meta-Llama-3-8B-Instruct-GGUF/resolve/main/Meta-Llama-3-8B-Instruct.Q3_K_S.gguf",
    "https://huggingface.co/vonjack/bge-m3-gguf/resolve/main/bge-m3-q8_0.gguf",
];

const LOCK_FILE_NAME: &str = "download.lock";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Downloaded file is too small, probably not a valid model file.")]
    DownloadIntegrity { size: u64, min_size: u64 },
    #[error("Could not acquire lock for downloading.")]
    LockTimeout,
    #[error("failed to download artifact: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("invalid artifact url list: {0}")]
    UrlList(#[from] serde_json::Error),
    #[error("artifact url `{0}` has no file name")]
    InvalidUrl(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Success,
    Failure,
}

/// The outcome of acquiring one artifact, as reported to operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub url: String,
    pub status: DownloadState,
    pub message: String,
}

impl DownloadStatus {
    fn success(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_owned(),
            status: DownloadState::Success,
            message: message.into(),
        }
    }

    fn failure(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_owned(),
            status: DownloadState::Failure,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DownloadState::Success
    }
}

/// Result of [`ArtifactManager::acquire_all`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct AcquireReport {
    /// The artifact file names, in the order of the URL list.
    pub names: Vec<String>,
    pub statuses: Vec<DownloadStatus>,
}

/// Derives the artifact file name from the last path segment of `url`.
pub fn artifact_name(url: &str) -> Result<String, ArtifactError> {
    let parsed = url::Url::parse(url).map_err(|_| ArtifactError::InvalidUrl(url.to_owned()))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ArtifactError::InvalidUrl(url.to_owned()))
}

enum Acquired {
    Existing,
    Downloaded(u64),
}

/// Downloads, verifies and stages model artifacts.
pub struct ArtifactManager {
    config: ModelsConfig,
    fast_storage: FastStorage,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl std::fmt::Debug for ArtifactManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactManager")
            .field("models_dir", &self.config.models_dir)
            .field("fast_storage", &self.fast_storage)
            .finish()
    }
}

impl ArtifactManager {
    pub fn new(
        config: ModelsConfig,
        fast_storage: FastStorage,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            config,
            fast_storage,
            fetcher,
        }
    }

    /// The directory models are loaded from: fast storage if usable, the durable directory
    /// otherwise.
    pub fn effective_models_dir(&self) -> &Path {
        self.fast_storage
            .models_dir()
            .unwrap_or(&self.config.models_dir)
    }

    pub fn fast_storage(&self) -> &FastStorage {
        &self.fast_storage
    }

    /// Makes the artifact `name` available in the models directory, downloading it from `url`
    /// if necessary.
    ///
    /// Failures are reported in the returned status and never abort the caller.
    #[tracing::instrument(skip(self))]
    pub async fn acquire_artifact(&self, name: &str, url: &str) -> DownloadStatus {
        let status = match self.try_acquire(name, url).await {
            Ok(Acquired::Existing) => {
                tracing::info!("File already exists: {name}");
                DownloadStatus::success(url, "File already exists.")
            }
            Ok(Acquired::Downloaded(size)) => {
                tracing::info!("Downloaded {name} ({size} bytes)");
                DownloadStatus::success(url, "Downloaded successfully.")
            }
            Err(err @ ArtifactError::LockTimeout) => {
                tracing::warn!("Could not acquire lock for downloading {name}");
                DownloadStatus::failure(url, err.to_string())
            }
            Err(err @ ArtifactError::DownloadIntegrity { size, min_size }) => {
                tracing::warn!(
                    size,
                    min_size,
                    "Discarding download of {name}, it is too small"
                );
                DownloadStatus::failure(url, err.to_string())
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to acquire artifact {name}"
                );
                DownloadStatus::failure(url, err.to_string())
            }
        };
        metric!(
            counter("artifacts.acquire") += 1,
            "status" => if status.is_success() { "success" } else { "failure" },
        );

        if status.is_success() {
            let names = [name.to_owned()];
            if let Err(err) = self
                .fast_storage
                .mirror(&self.config.models_dir, &names)
                .await
            {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to copy {name} to fast storage"
                );
            }
        }
        status
    }

    async fn try_acquire(&self, name: &str, url: &str) -> Result<Acquired, ArtifactError> {
        let models_dir = &self.config.models_dir;
        tokio::fs::create_dir_all(models_dir).await?;

        let _lock = FileLock::acquire(
            &models_dir.join(LOCK_FILE_NAME),
            self.config.download_lock_timeout,
        )
        .await?;

        let target = models_dir.join(name);
        if tokio::fs::try_exists(&target).await? {
            return Ok(Acquired::Existing);
        }

        tracing::info!("Downloading model {name} from {url}");
        let temp = NamedTempFile::new_in(models_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        self.fetcher.fetch(url, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        let size = temp.as_file().metadata()?.len();
        if size < self.config.min_artifact_size {
            metric!(counter("artifacts.integrity_failure") += 1);
            // dropping `temp` removes the partial file
            return Err(ArtifactError::DownloadIntegrity {
                size,
                min_size: self.config.min_artifact_size,
            });
        }

        temp.persist(&target).map_err(|err| err.error)?;
        Ok(Acquired::Downloaded(size))
    }

    /// Reads the configured URL list, creating it with [`DEFAULT_MODEL_URLS`] if missing.
    pub fn model_urls(&self) -> Result<Vec<String>, ArtifactError> {
        let path = &self.config.model_urls_file;
        if !path.exists() {
            let defaults: Vec<_> = DEFAULT_MODEL_URLS.iter().map(|url| url.to_string()).collect();
            write_url_list(path, &defaults)?;
            tracing::info!("Created default model url list at `{}`", path.display());
        }
        let contents = fs::read(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Acquires every artifact of the URL list.
    ///
    /// If all artifacts are already present in fast storage, nothing is downloaded.
    pub async fn acquire_all(&self) -> Result<AcquireReport, ArtifactError> {
        let urls = self.model_urls()?;
        let names = urls
            .iter()
            .map(|url| artifact_name(url))
            .collect::<Result<Vec<_>, _>>()?;

        if self.fast_storage.contains_all(&names) {
            tracing::info!("Models found in fast storage");
            let statuses = urls
                .iter()
                .map(|url| DownloadStatus::success(url, "Model found in fast storage."))
                .collect();
            return Ok(AcquireReport { names, statuses });
        }

        tracing::info!(
            "Checking models directory `{}`",
            self.config.models_dir.display()
        );
        let mut statuses = Vec::with_capacity(urls.len());
        for (url, name) in urls.iter().zip(&names) {
            statuses.push(self.acquire_artifact(name, url).await);
        }
        tracing::info!("Model downloads completed");
        Ok(AcquireReport { names, statuses })
    }
}

fn write_url_list(path: &Path, urls: &[String]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(urls)?)?;
    Ok(())
}
