use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use modelkeeper_service::models::{
    BoxError, LoadOptions, LoadedModel, ModelError, ModelHandle, ModelLoader, ModelPurpose,
};

use crate::setup_services;

#[derive(Debug)]
struct WeightsFile {
    path: PathBuf,
    gpu: bool,
}

impl LoadedModel for WeightsFile {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct CountingLoader {
    constructs: AtomicUsize,
}

impl ModelLoader for CountingLoader {
    fn construct(&self, path: &Path, options: &LoadOptions) -> Result<ModelHandle, BoxError> {
        self.constructs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(WeightsFile {
            path: path.to_owned(),
            gpu: options.gpu,
        }))
    }
}

#[tokio::test]
async fn test_model_cache_from_services() {
    let env = setup_services(|_| {}).await;
    let models_dir = env.services.config.models.models_dir.clone();
    fs::create_dir_all(&models_dir).unwrap();
    fs::write(models_dir.join("bge-m3-q8_0.gguf"), b"weights").unwrap();

    let loader = Arc::new(CountingLoader::default());
    let models = env.services.model_cache(loader.clone());

    let model = models
        .load_model("bge-m3", ModelPurpose::Embedding)
        .await
        .unwrap();
    let weights: &WeightsFile = model.as_any().downcast_ref().unwrap();
    assert_eq!(weights.path, models_dir.join("bge-m3-q8_0.gguf"));
    // GPU detection is disabled in tests
    assert!(!weights.gpu);

    let again = models
        .load_model("bge-m3", ModelPurpose::Embedding)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&model, &again));
    assert_eq!(loader.constructs.load(Ordering::SeqCst), 1);

    let err = models
        .load_model("mistral", ModelPurpose::Completion)
        .await
        .unwrap_err();
    assert!(matches!(*err, ModelError::NotFound(ref name) if name == "mistral"));
    assert_eq!(err.to_string(), "No model file found matching: mistral");

    env.services.shutdown().await;
}
