use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use modelkeeper_service::artifacts::{
    ArtifactManager, DownloadState, FastStorage, FileLock, HttpFetcher,
};
use modelkeeper_service::config::{FastStorageConfig, ModelsConfig};
use modelkeeper_test as test;

use crate::ArtifactServer;

fn models_config(dir: &Path) -> ModelsConfig {
    ModelsConfig {
        models_dir: dir.join("models"),
        model_urls_file: dir.join("model_urls.json"),
        min_artifact_size: 1024,
        download_lock_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn manager(config: ModelsConfig, fast_storage: FastStorage) -> ArtifactManager {
    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    ArtifactManager::new(config, fast_storage, Arc::new(fetcher))
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_undersized_download_is_discarded() {
    test::setup();
    let dir = test::tempdir();
    let server = ArtifactServer::new();
    let config = models_config(dir.path());
    let artifacts = manager(config.clone(), FastStorage::disabled());

    let status = artifacts
        .acquire_artifact("model.gguf", &server.artifact_url(100, "model.gguf"))
        .await;
    assert_eq!(status.status, DownloadState::Failure);
    assert_eq!(
        status.message,
        "Downloaded file is too small, probably not a valid model file."
    );
    // neither the artifact nor the partial download are left behind
    assert_eq!(dir_entries(&config.models_dir), ["download.lock"]);

    let status = artifacts
        .acquire_artifact("model.gguf", &server.artifact_url(4096, "model.gguf"))
        .await;
    assert!(status.is_success());
    assert_eq!(status.message, "Downloaded successfully.");
    assert_eq!(
        fs::metadata(config.models_dir.join("model.gguf")).unwrap().len(),
        4096
    );
    assert_eq!(server.accesses(), 2);

    let status = artifacts
        .acquire_artifact("model.gguf", &server.artifact_url(4096, "model.gguf"))
        .await;
    assert!(status.is_success());
    assert_eq!(status.message, "File already exists.");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_failed_request_reports_failure() {
    test::setup();
    let dir = test::tempdir();
    let server = ArtifactServer::new();
    let config = models_config(dir.path());
    let artifacts = manager(config.clone(), FastStorage::disabled());

    let url = server.url("respond_statuscode/404/model.gguf").to_string();
    let status = artifacts.acquire_artifact("model.gguf", &url).await;
    assert_eq!(status.status, DownloadState::Failure);
    assert_eq!(status.url, url);
    assert!(!config.models_dir.join("model.gguf").exists());
}

#[tokio::test]
async fn test_download_lock_timeout() {
    test::setup();
    let dir = test::tempdir();
    let server = ArtifactServer::new();
    let config = ModelsConfig {
        download_lock_timeout: Duration::from_millis(300),
        ..models_config(dir.path())
    };
    fs::create_dir_all(&config.models_dir).unwrap();
    let _held = FileLock::acquire(&config.models_dir.join("download.lock"), Duration::ZERO)
        .await
        .unwrap();

    let artifacts = manager(config.clone(), FastStorage::disabled());
    let status = artifacts
        .acquire_artifact("model.gguf", &server.artifact_url(4096, "model.gguf"))
        .await;
    assert_eq!(status.status, DownloadState::Failure);
    assert_eq!(status.message, "Could not acquire lock for downloading.");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_concurrent_downloads_fetch_once() {
    test::setup();
    let dir = test::tempdir();
    let server = ArtifactServer::new();
    let artifacts = Arc::new(manager(models_config(dir.path()), FastStorage::disabled()));
    let url = server.url("delay/100ms/4096/model.gguf").to_string();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let artifacts = artifacts.clone();
            let url = url.clone();
            tokio::spawn(async move { artifacts.acquire_artifact("model.gguf", &url).await })
        })
        .collect();

    let mut messages = Vec::new();
    for task in tasks {
        let status = task.await.unwrap();
        assert!(status.is_success());
        messages.push(status.message);
    }
    messages.sort();
    assert_eq!(
        messages,
        [
            "Downloaded successfully.",
            "File already exists.",
            "File already exists.",
            "File already exists.",
        ]
    );
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_acquire_all_mirrors_to_fast_storage() {
    test::setup();
    let dir = test::tempdir();
    let mount = test::tempdir();
    let server = ArtifactServer::new();
    let config = models_config(dir.path());

    let urls = vec![
        server.artifact_url(2048, "embed.gguf"),
        server.artifact_url(3072, "chat.gguf"),
    ];
    fs::write(
        &config.model_urls_file,
        serde_json::to_vec(&urls).unwrap(),
    )
    .unwrap();

    let fast_storage = FastStorage::prepare(&FastStorageConfig {
        enabled: true,
        path: mount.path().to_owned(),
    });
    let artifacts = manager(config.clone(), fast_storage);
    assert_eq!(artifacts.effective_models_dir(), mount.path().join("models"));

    let report = artifacts.acquire_all().await.unwrap();
    assert_eq!(report.names, ["embed.gguf", "chat.gguf"]);
    assert!(report.statuses.iter().all(|status| status.is_success()));
    assert_eq!(
        dir_entries(&mount.path().join("models")),
        ["chat.gguf", "embed.gguf"]
    );
    assert_eq!(server.accesses(), 2);

    let report = artifacts.acquire_all().await.unwrap();
    assert!(
        report
            .statuses
            .iter()
            .all(|status| status.message == "Model found in fast storage.")
    );
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_default_url_list_is_created() {
    test::setup();
    let dir = test::tempdir();
    let config = models_config(dir.path());
    let artifacts = manager(config.clone(), FastStorage::disabled());

    assert!(!config.model_urls_file.exists());
    let urls = artifacts.model_urls().unwrap();
    assert_eq!(urls.len(), 3);
    assert!(config.model_urls_file.exists());
    assert_eq!(artifacts.effective_models_dir(), config.models_dir);
}
