//! Persisted record types and the logical keys identifying them.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Returns the lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// The kind of work a [`LogicalKey`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    TextEmbedding,
    DocumentEmbedding,
    Document,
    AudioTranscript,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::TextEmbedding,
        RecordKind::DocumentEmbedding,
        RecordKind::Document,
        RecordKind::AudioTranscript,
    ];
}

impl AsRef<str> for RecordKind {
    fn as_ref(&self) -> &str {
        match self {
            RecordKind::TextEmbedding => "text_embedding",
            RecordKind::DocumentEmbedding => "document_embedding",
            RecordKind::Document => "document",
            RecordKind::AudioTranscript => "audio_transcript",
        }
    }
}

/// Identifies one unit of expensive work.
///
/// Two requests with equal keys would produce the same persisted record, so the key is
/// used both for deduplication and as the name of the distributed lock guarding the work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalKey {
    pub kind: RecordKind,
    /// The model identifier, empty for kinds that are not tied to a model.
    pub model: String,
    /// A content hash, or another identifier of the input.
    pub content: String,
    /// An optional variant such as the pooling method.
    pub variant: Option<String>,
}

impl LogicalKey {
    pub fn new(
        kind: RecordKind,
        model: impl Into<String>,
        content: impl Into<String>,
        variant: Option<String>,
    ) -> Self {
        Self {
            kind,
            model: model.into(),
            content: content.into(),
            variant,
        }
    }

    /// Key of a text embedding of `text`.
    pub fn text_embedding(text: &str, model: &str, pooling_method: &str) -> Self {
        Self::new(
            RecordKind::TextEmbedding,
            model,
            sha256_hex(text),
            Some(pooling_method.to_owned()),
        )
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_ref(), self.model, self.content)?;
        if let Some(variant) = &self.variant {
            write!(f, ":{variant}")?;
        }
        Ok(())
    }
}

/// Bookkeeping about the request which produced a record.
#[derive(Clone, Debug, PartialEq)]
pub struct Audit {
    pub ip_address: String,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    /// Seconds between request and response.
    pub total_time: f64,
}

impl Audit {
    pub fn new(
        ip_address: impl Into<String>,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
    ) -> Self {
        let total_time = (response_time - request_time)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        Self {
            ip_address: ip_address.into(),
            request_time,
            response_time,
            total_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextEmbedding {
    pub text: String,
    pub text_hash: String,
    pub llm_model_name: String,
    pub pooling_method: String,
    pub embedding_json: serde_json::Value,
    pub audit: Audit,
}

impl TextEmbedding {
    pub fn new(
        text: impl Into<String>,
        llm_model_name: impl Into<String>,
        pooling_method: impl Into<String>,
        embedding_json: serde_json::Value,
        audit: Audit,
    ) -> Self {
        let text = text.into();
        Self {
            text_hash: sha256_hex(&text),
            text,
            llm_model_name: llm_model_name.into(),
            pooling_method: pooling_method.into(),
            embedding_json,
            audit,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentEmbedding {
    /// Hash of the extracted document text.
    pub document_hash: String,
    pub filename: String,
    pub mimetype: String,
    /// Hash of the raw uploaded file.
    pub document_file_hash: String,
    pub llm_model_name: String,
    pub pooling_method: String,
    pub file_data: Vec<u8>,
    pub results_json: serde_json::Value,
    pub audit: Audit,
}

/// Metadata tying a document to the model that embedded it.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub llm_model_name: String,
    pub document_hash: String,
    pub pooling_method: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioTranscript {
    pub audio_file_hash: String,
    pub audio_file_name: String,
    pub audio_file_size_mb: f64,
    pub segments_json: serde_json::Value,
    pub combined_transcript_text: String,
    pub metadata_json: serde_json::Value,
    pub info_json: serde_json::Value,
    pub audit: Audit,
}

/// A single record handed to the persistence writer.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRecord {
    TextEmbedding(TextEmbedding),
    DocumentEmbedding(DocumentEmbedding),
    Document(Document),
    AudioTranscript(AudioTranscript),
}

impl WriteRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            WriteRecord::TextEmbedding(_) => RecordKind::TextEmbedding,
            WriteRecord::DocumentEmbedding(_) => RecordKind::DocumentEmbedding,
            WriteRecord::Document(_) => RecordKind::Document,
            WriteRecord::AudioTranscript(_) => RecordKind::AudioTranscript,
        }
    }

    /// The logical key this record satisfies.
    pub fn key(&self) -> LogicalKey {
        match self {
            WriteRecord::TextEmbedding(r) => LogicalKey::new(
                RecordKind::TextEmbedding,
                &r.llm_model_name,
                &r.text_hash,
                Some(r.pooling_method.clone()),
            ),
            WriteRecord::DocumentEmbedding(r) => LogicalKey::new(
                RecordKind::DocumentEmbedding,
                &r.llm_model_name,
                &r.document_file_hash,
                Some(r.pooling_method.clone()),
            ),
            WriteRecord::Document(r) => LogicalKey::new(
                RecordKind::Document,
                &r.llm_model_name,
                &r.document_hash,
                Some(r.pooling_method.clone()),
            ),
            WriteRecord::AudioTranscript(r) => {
                LogicalKey::new(RecordKind::AudioTranscript, "", &r.audio_file_hash, None)
            }
        }
    }
}

impl From<TextEmbedding> for WriteRecord {
    fn from(record: TextEmbedding) -> Self {
        Self::TextEmbedding(record)
    }
}

impl From<DocumentEmbedding> for WriteRecord {
    fn from(record: DocumentEmbedding) -> Self {
        Self::DocumentEmbedding(record)
    }
}

impl From<Document> for WriteRecord {
    fn from(record: Document) -> Self {
        Self::Document(record)
    }
}

impl From<AudioTranscript> for WriteRecord {
    fn from(record: AudioTranscript) -> Self {
        Self::AudioTranscript(record)
    }
}
