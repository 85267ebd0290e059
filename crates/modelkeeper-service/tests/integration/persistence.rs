use chrono::{Duration as TimeDelta, Utc};
use modelkeeper_service::config::Config;
use modelkeeper_service::records::{
    AudioTranscript, Document, DocumentEmbedding, RecordKind, TextEmbedding, sha256_hex,
};
use modelkeeper_service::store::RecordStore;
use modelkeeper_service::sweeper;
use modelkeeper_service::writer::BatchOutcome;

use crate::{audit_at, setup_services, test_config, text_embedding};

#[tokio::test]
async fn test_text_embedding_is_persisted() {
    let env = setup_services(|_| {}).await;

    let now = Utc::now();
    let record = TextEmbedding::new(
        "text",
        "model",
        "cls",
        serde_json::json!([1.0, -1.0]),
        audit_at(now - TimeDelta::seconds(2)),
    );
    let outcome = env.services.queue.enqueue(vec![record.into()]).outcome().await;
    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            written: 1,
            skipped: 0
        }
    );

    let rows = env.store.text_embeddings("text", "model").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "text");
    assert_eq!(rows[0].text_hash, sha256_hex("text"));
    assert_eq!(rows[0].pooling_method, "cls");
    assert_eq!(rows[0].embedding_json, serde_json::json!([1.0, -1.0]));

    env.services.shutdown().await;
}

#[tokio::test]
async fn test_document_embedding_is_persisted() {
    let env = setup_services(|_| {}).await;

    let record = DocumentEmbedding {
        document_hash: sha256_hex("extracted text"),
        filename: "test.pdf".into(),
        mimetype: "application/pdf".into(),
        document_file_hash: sha256_hex(b"%PDF-1.7"),
        llm_model_name: "model".into(),
        pooling_method: "mean".into(),
        file_data: b"%PDF-1.7".to_vec(),
        results_json: serde_json::json!({"embeddings": [[0.5]]}),
        audit: audit_at(Utc::now()),
    };
    let outcome = env
        .services
        .queue
        .enqueue(vec![record.clone().into()])
        .outcome()
        .await;
    assert!(matches!(outcome, BatchOutcome::Committed { written: 1, .. }));

    let rows = env.store.document_embeddings_by_filename("test.pdf").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].filename, "test.pdf");
    assert_eq!(rows[0].file_data, record.file_data);
    assert_eq!(rows[0].results_json, record.results_json);

    env.services.shutdown().await;
}

#[tokio::test]
async fn test_document_is_persisted() {
    let env = setup_services(|_| {}).await;

    let record = Document {
        llm_model_name: "model".into(),
        document_hash: "test_hash".into(),
        pooling_method: "mean".into(),
        created_at: Utc::now(),
    };
    let outcome = env.services.queue.enqueue(vec![record.into()]).outcome().await;
    assert!(matches!(outcome, BatchOutcome::Committed { written: 1, .. }));

    let rows = env.store.documents_by_hash("test_hash").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].document_hash, "test_hash");
    assert_eq!(rows[0].llm_model_name, "model");

    env.services.shutdown().await;
}

#[tokio::test]
async fn test_audio_transcript_is_persisted() {
    let env = setup_services(|_| {}).await;

    let record = AudioTranscript {
        audio_file_hash: "test_hash".into(),
        audio_file_name: "test.wav".into(),
        audio_file_size_mb: 1.5,
        segments_json: serde_json::json!([{"start": 0.0, "end": 1.2, "text": "hello"}]),
        combined_transcript_text: "hello".into(),
        metadata_json: serde_json::json!({"language": "en"}),
        info_json: serde_json::json!({"duration": 1.2}),
        audit: audit_at(Utc::now()),
    };
    let outcome = env.services.queue.enqueue(vec![record.into()]).outcome().await;
    assert!(matches!(outcome, BatchOutcome::Committed { written: 1, .. }));

    let rows = env.store.audio_transcripts_by_hash("test_hash").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].audio_file_hash, "test_hash");
    assert_eq!(rows[0].combined_transcript_text, "hello");
    assert_eq!(rows[0].audio_file_size_mb, 1.5);

    env.services.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_persist_once() {
    let env = setup_services(|_| {}).await;

    let producers: Vec<_> = (0..16)
        .map(|producer| {
            let queue = env.services.queue.clone();
            tokio::spawn(async move {
                let mut receipts = Vec::new();
                for i in 0..10 {
                    let own = text_embedding(&format!("text {producer} {i}"), "model");
                    let shared = text_embedding(&format!("shared {i}"), "model");
                    receipts.push(queue.enqueue(vec![own, shared]));
                }
                let mut outcomes = Vec::new();
                for receipt in receipts {
                    outcomes.push(receipt.outcome().await);
                }
                outcomes
            })
        })
        .collect();

    let mut written = 0;
    for producer in producers {
        for outcome in producer.await.unwrap() {
            match outcome {
                BatchOutcome::Committed { written: n, .. } => written += n,
                BatchOutcome::Dropped => panic!("batch was dropped"),
            }
        }
    }

    assert_eq!(written, 16 * 10 + 10);
    assert_eq!(
        env.store.count(RecordKind::TextEmbedding).unwrap(),
        16 * 10 + 10
    );
    for i in 0..10 {
        let rows = env
            .store
            .text_embeddings(&format!("shared {i}"), "model")
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    env.services.shutdown().await;
}

#[tokio::test]
async fn test_restart_keeps_dedup_index() {
    let env = setup_services(|_| {}).await;
    let outcome = env
        .services
        .queue
        .enqueue(vec![text_embedding("a", "model"), text_embedding("b", "model")])
        .outcome()
        .await;
    assert!(matches!(outcome, BatchOutcome::Committed { written: 2, .. }));
    let config = env.services.config.clone();
    env.services.shutdown().await;

    let (services, store) = crate::start_services(config).await;
    assert_eq!(services.index.len(), 2);
    assert_eq!(store.load_keys().unwrap().len(), 2);

    let outcome = services
        .queue
        .enqueue(vec![text_embedding("a", "model")])
        .outcome()
        .await;
    assert_eq!(
        outcome,
        BatchOutcome::Committed {
            written: 0,
            skipped: 1
        }
    );
    assert_eq!(store.count(RecordKind::TextEmbedding).unwrap(), 2);

    services.shutdown().await;
    drop(env.dir);
}

#[tokio::test]
async fn test_cleanup_command() {
    let dir = modelkeeper_test::tempdir();
    let config = Config {
        retention: modelkeeper_service::config::RetentionConfig {
            max_age: std::time::Duration::from_secs(3600 * 24),
            ..Default::default()
        },
        ..test_config(&dir)
    };

    let (services, store) = crate::start_services(config.clone()).await;
    let now = Utc::now();
    let old = TextEmbedding::new(
        "old",
        "model",
        "mean",
        serde_json::json!([]),
        audit_at(now - TimeDelta::days(2)),
    );
    let fresh = TextEmbedding::new(
        "fresh",
        "model",
        "mean",
        serde_json::json!([]),
        audit_at(now),
    );
    let outcome = services
        .queue
        .enqueue(vec![old.into(), fresh.into()])
        .outcome()
        .await;
    assert!(matches!(outcome, BatchOutcome::Committed { written: 2, .. }));
    services.shutdown().await;

    let stats = sweeper::cleanup(&config, true).await.unwrap();
    assert_eq!(stats.total(), 1);
    assert_eq!(store.count(RecordKind::TextEmbedding).unwrap(), 2);

    let stats = sweeper::cleanup(&config, false).await.unwrap();
    assert_eq!(stats.text_embeddings, 1);
    assert_eq!(store.count(RecordKind::TextEmbedding).unwrap(), 1);
    assert_eq!(store.text_embeddings("fresh", "model").unwrap().len(), 1);
}
