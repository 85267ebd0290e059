use std::sync::Arc;

use chrono::{DateTime, Utc};
use modelkeeper_service::config::Config;
use modelkeeper_service::records::{Audit, TextEmbedding, WriteRecord};
use modelkeeper_service::services::SharedServices;
use modelkeeper_service::store::SqliteStore;
use modelkeeper_test as test;

pub use test::{ArtifactServer, TempDir};

/// Services running against a database in a temporary directory.
pub struct TestServices {
    pub services: SharedServices,
    /// A handle to the same store the services write to, for assertions.
    pub store: Arc<SqliteStore>,
    pub dir: TempDir,
}

/// A configuration that keeps all state inside `dir` and never touches the GPU.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database_path = dir.path().join("modelkeeper.sqlite");
    config.models.models_dir = dir.path().join("models");
    config.models.model_urls_file = dir.path().join("model_urls.json");
    config.models.min_artifact_size = 1024;
    config.gpu.detect = false;
    config.retention.enabled = false;
    config
}

/// Setup tests and start services in a fresh temporary directory.
///
/// The `update_config` closure can modify the configuration before the services are started.
pub async fn setup_services(update_config: impl FnOnce(&mut Config)) -> TestServices {
    test::setup();
    let dir = test::tempdir();
    let mut config = test_config(&dir);
    update_config(&mut config);
    let (services, store) = start_services(config).await;
    TestServices {
        services,
        store,
        dir,
    }
}

/// Starts services on the database configured in `config`.
pub async fn start_services(config: Config) -> (SharedServices, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open(&config.database_path).unwrap());
    let services = SharedServices::with_store(config, store.clone())
        .await
        .unwrap();
    (services, store)
}

pub fn audit_at(time: DateTime<Utc>) -> Audit {
    Audit::new("127.0.0.1", time, time)
}

pub fn text_embedding(text: &str, model: &str) -> WriteRecord {
    TextEmbedding::new(
        text,
        model,
        "mean",
        serde_json::json!([0.1, 0.2, 0.3]),
        audit_at(Utc::now()),
    )
    .into()
}
