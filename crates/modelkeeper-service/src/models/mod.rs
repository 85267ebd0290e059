//! The process-wide cache of loaded models.
//!
//! Models are loaded at most once per process and name. Entries are never evicted or
//! refreshed: a loaded model stays resident until the process exits, so memory grows with the
//! number of distinct models requested.
use std::any::Any;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::config::ModelsConfig;
use crate::locks::{LockError, LockManager};
use crate::metric;

mod gpu;

pub use self::gpu::{GpuInfo, GpuProbe, NvidiaSmiProbe};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A loaded model, opaque to this crate.
///
/// Inference code downcasts it to the concrete type its [`ModelLoader`] produces.
pub trait LoadedModel: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

pub type ModelHandle = Arc<dyn LoadedModel>;

/// What a model is loaded for. Each purpose gets its own cache entry and context size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelPurpose {
    Embedding,
    Completion,
}

impl AsRef<str> for ModelPurpose {
    fn as_ref(&self) -> &str {
        match self {
            ModelPurpose::Embedding => "embedding",
            ModelPurpose::Completion => "completion",
        }
    }
}

/// Parameters for constructing a model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    /// Offload all layers to the GPU.
    pub gpu: bool,
    pub context_size: u32,
    /// Load the model for computing embeddings instead of completions.
    pub embedding: bool,
    pub verbose: bool,
}

/// Constructs models from files. This is a blocking operation.
pub trait ModelLoader: Send + Sync + 'static {
    fn construct(&self, path: &Path, options: &LoadOptions) -> Result<ModelHandle, BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("No model file found matching: {0}")]
    NotFound(String),
    #[error("failed to load model `{name}`")]
    Load {
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to search the models directory")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("model loading task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Finds the most recently modified file in `dir` whose name starts with `name`.
pub fn locate_model(dir: &Path, name: &str) -> Result<PathBuf, ModelError> {
    let pattern = format!(
        "{}/{}*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(name)
    );
    let paths = glob::glob(&pattern).map_err(|err| io::Error::other(err.to_string()))?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for path in paths {
        let path = path.map_err(|err| err.into_error())?;
        let metadata = path.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        if newest.as_ref().is_none_or(|(time, _)| modified > *time) {
            newest = Some((modified, path));
        }
    }

    newest
        .map(|(_, path)| path)
        .ok_or_else(|| ModelError::NotFound(name.to_owned()))
}

/// Constructs a model, preferring the GPU and falling back to the CPU.
fn construct_with_fallback(
    loader: &dyn ModelLoader,
    name: &str,
    path: &Path,
    mut options: LoadOptions,
) -> Result<ModelHandle, ModelError> {
    if options.gpu {
        match loader.construct(path, &options) {
            Ok(model) => return Ok(model),
            Err(err) => {
                tracing::debug!(
                    error = &*err as &dyn std::error::Error,
                    "Failed to load {name} on the GPU, falling back to the CPU"
                );
                metric!(counter("models.gpu_fallback") += 1);
                options.gpu = false;
            }
        }
    }
    loader
        .construct(path, &options)
        .map_err(|source| ModelError::Load {
            name: name.to_owned(),
            source,
        })
}

type Cache = moka::future::Cache<(String, ModelPurpose), ModelHandle>;

/// Loads models on first use and keeps them for the lifetime of the process.
#[derive(Clone)]
pub struct ModelCache {
    cache: Cache,
    loader: Arc<dyn ModelLoader>,
    gpu: Arc<dyn GpuProbe>,
    locks: Option<LockManager>,
    models_dir: PathBuf,
    config: ModelsConfig,
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("models_dir", &self.models_dir)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl ModelCache {
    /// Creates a cache loading models from `models_dir`.
    ///
    /// With a [`LockManager`], the first load of a model is also exclusive across processes.
    pub fn new(
        config: ModelsConfig,
        models_dir: PathBuf,
        loader: Arc<dyn ModelLoader>,
        gpu: Arc<dyn GpuProbe>,
        locks: Option<LockManager>,
    ) -> Self {
        // no `max_capacity`: entries are never evicted
        let cache = Cache::builder().name("models").build();
        Self {
            cache,
            loader,
            gpu,
            locks,
            models_dir,
            config,
        }
    }

    /// Returns the loaded model `name`, loading it on first use.
    ///
    /// Concurrent first loads of the same model within this process share a single load.
    /// Failed loads are not cached.
    pub async fn load_model(
        &self,
        name: &str,
        purpose: ModelPurpose,
    ) -> Result<ModelHandle, Arc<ModelError>> {
        let key = (name.to_owned(), purpose);
        if let Some(model) = self.cache.get(&key).await {
            metric!(counter("models.cache.hit") += 1, "purpose" => purpose.as_ref());
            return Ok(model);
        }

        self.cache
            .try_get_with(key, self.load_exclusive(name, purpose))
            .await
    }

    async fn load_exclusive(
        &self,
        name: &str,
        purpose: ModelPurpose,
    ) -> Result<ModelHandle, ModelError> {
        metric!(counter("models.cache.miss") += 1, "purpose" => purpose.as_ref());
        match self.locks {
            Some(ref locks) => {
                let resource = format!("model-load:{name}");
                locks.with_lock(&resource, self.load(name, purpose)).await?
            }
            None => self.load(name, purpose).await,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn load(&self, name: &str, purpose: ModelPurpose) -> Result<ModelHandle, ModelError> {
        let started = Instant::now();

        let path = {
            let dir = self.models_dir.clone();
            let name = name.to_owned();
            tokio::task::spawn_blocking(move || locate_model(&dir, &name)).await??
        };

        let options = LoadOptions {
            gpu: self.gpu.gpu_available().await,
            context_size: match purpose {
                ModelPurpose::Embedding => self.config.embedding_context_size,
                ModelPurpose::Completion => self.config.completion_context_size,
            },
            embedding: purpose == ModelPurpose::Embedding,
            verbose: self.config.verbose,
        };

        let model = {
            let loader = Arc::clone(&self.loader);
            let name = name.to_owned();
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                construct_with_fallback(loader.as_ref(), &name, &path, options)
            })
            .await??
        };

        tracing::info!("Loaded model from `{}`", path.display());
        metric!(timer("models.load.duration") = started.elapsed(), "purpose" => purpose.as_ref());
        Ok(model)
    }

    /// Number of loaded models.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
