//! Transactional backing store for persisted records.
//!
//! All mutation except retention deletes goes through the [`Writer`](crate::writer::Writer).
//! The store itself is synchronous; async callers use [`run_blocking`].
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, Row, params};

use crate::records::{
    Audit, AudioTranscript, Document, DocumentEmbedding, LogicalKey, RecordKind, TextEmbedding,
    WriteRecord,
};

/// Errors returned by a [`RecordStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Contention on the store. Retrying the same operation later is expected to succeed.
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error")]
    Fatal(#[source] rusqlite::Error),
    #[error("failed to prepare storage location")]
    Io(#[from] std::io::Error),
    #[error("blocking store task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Fatal(err),
        }
    }
}

/// Outcome of a retention sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub text_embeddings: usize,
    pub document_embeddings: usize,
    pub documents: usize,
    pub audio_transcripts: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.text_embeddings + self.document_embeddings + self.documents + self.audio_transcripts
    }

    fn add(&mut self, kind: RecordKind, count: usize) {
        match kind {
            RecordKind::TextEmbedding => self.text_embeddings += count,
            RecordKind::DocumentEmbedding => self.document_embeddings += count,
            RecordKind::Document => self.documents += count,
            RecordKind::AudioTranscript => self.audio_transcripts += count,
        }
    }
}

/// A transactional store of [`WriteRecord`]s.
pub trait RecordStore: Send + Sync + 'static {
    /// Persists all records in a single transaction. Either all of them are written or none.
    fn insert_batch(&self, records: &[WriteRecord]) -> Result<usize, StoreError>;

    /// Returns the logical keys of every persisted record.
    fn load_keys(&self) -> Result<Vec<LogicalKey>, StoreError>;

    /// Whether a record with the given key is persisted, regardless of who wrote it.
    fn contains_key(&self, key: &LogicalKey) -> Result<bool, StoreError>;

    /// Deletes records whose request time lies before `cutoff`.
    ///
    /// With `dry_run`, matching records are only counted.
    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<PurgeStats, StoreError>;
}

/// Runs a store operation on the blocking thread pool.
pub async fn run_blocking<T, F>(store: &Arc<dyn RecordStore>, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&dyn RecordStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref())).await?
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS text_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    llm_model_name TEXT NOT NULL,
    pooling_method TEXT NOT NULL,
    embedding_json TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    request_time INTEGER NOT NULL,
    response_time INTEGER NOT NULL,
    total_time REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS text_embeddings_lookup
    ON text_embeddings (text_hash, llm_model_name, pooling_method);
CREATE INDEX IF NOT EXISTS text_embeddings_request_time ON text_embeddings (request_time);

CREATE TABLE IF NOT EXISTS document_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_hash TEXT NOT NULL,
    filename TEXT NOT NULL,
    mimetype TEXT NOT NULL,
    document_file_hash TEXT NOT NULL,
    llm_model_name TEXT NOT NULL,
    pooling_method TEXT NOT NULL,
    file_data BLOB NOT NULL,
    results_json TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    request_time INTEGER NOT NULL,
    response_time INTEGER NOT NULL,
    total_time REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS document_embeddings_lookup
    ON document_embeddings (document_file_hash, llm_model_name, pooling_method);
CREATE INDEX IF NOT EXISTS document_embeddings_request_time
    ON document_embeddings (request_time);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    llm_model_name TEXT NOT NULL,
    document_hash TEXT NOT NULL,
    pooling_method TEXT NOT NULL,
    request_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS documents_lookup ON documents (document_hash, llm_model_name);
CREATE INDEX IF NOT EXISTS documents_request_time ON documents (request_time);

CREATE TABLE IF NOT EXISTS audio_transcripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audio_file_hash TEXT NOT NULL,
    audio_file_name TEXT NOT NULL,
    audio_file_size_mb REAL NOT NULL,
    segments_json TEXT NOT NULL,
    combined_transcript_text TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    info_json TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    request_time INTEGER NOT NULL,
    response_time INTEGER NOT NULL,
    total_time REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS audio_transcripts_lookup ON audio_transcripts (audio_file_hash);
CREATE INDEX IF NOT EXISTS audio_transcripts_request_time ON audio_transcripts (request_time);
"#;

fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::TextEmbedding => "text_embeddings",
        RecordKind::DocumentEmbedding => "document_embeddings",
        RecordKind::Document => "documents",
        RecordKind::AudioTranscript => "audio_transcripts",
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        idx, millis,
    ))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

/// A [`RecordStore`] backed by a single SQLite database in WAL mode.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up text embeddings by their input text and model.
    pub fn text_embeddings(
        &self,
        text: &str,
        llm_model_name: &str,
    ) -> Result<Vec<TextEmbedding>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT text, text_hash, llm_model_name, pooling_method, embedding_json,
                    ip_address, request_time, response_time, total_time
             FROM text_embeddings WHERE text = ?1 AND llm_model_name = ?2",
        )?;
        let rows = stmt.query_map(params![text, llm_model_name], |row| {
            Ok(TextEmbedding {
                text: row.get(0)?,
                text_hash: row.get(1)?,
                llm_model_name: row.get(2)?,
                pooling_method: row.get(3)?,
                embedding_json: json_column(row, 4)?,
                audit: audit_columns(row, 5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Looks up document embeddings by the uploaded file name.
    pub fn document_embeddings_by_filename(
        &self,
        filename: &str,
    ) -> Result<Vec<DocumentEmbedding>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT document_hash, filename, mimetype, document_file_hash, llm_model_name,
                    pooling_method, file_data, results_json,
                    ip_address, request_time, response_time, total_time
             FROM document_embeddings WHERE filename = ?1",
        )?;
        let rows = stmt.query_map(params![filename], |row| {
            Ok(DocumentEmbedding {
                document_hash: row.get(0)?,
                filename: row.get(1)?,
                mimetype: row.get(2)?,
                document_file_hash: row.get(3)?,
                llm_model_name: row.get(4)?,
                pooling_method: row.get(5)?,
                file_data: row.get(6)?,
                results_json: json_column(row, 7)?,
                audit: audit_columns(row, 8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn documents_by_hash(&self, document_hash: &str) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT llm_model_name, document_hash, pooling_method, request_time
             FROM documents WHERE document_hash = ?1",
        )?;
        let rows = stmt.query_map(params![document_hash], |row| {
            Ok(Document {
                llm_model_name: row.get(0)?,
                document_hash: row.get(1)?,
                pooling_method: row.get(2)?,
                created_at: from_millis(row, 3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn audio_transcripts_by_hash(
        &self,
        audio_file_hash: &str,
    ) -> Result<Vec<AudioTranscript>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT audio_file_hash, audio_file_name, audio_file_size_mb, segments_json,
                    combined_transcript_text, metadata_json, info_json,
                    ip_address, request_time, response_time, total_time
             FROM audio_transcripts WHERE audio_file_hash = ?1",
        )?;
        let rows = stmt.query_map(params![audio_file_hash], |row| {
            Ok(AudioTranscript {
                audio_file_hash: row.get(0)?,
                audio_file_name: row.get(1)?,
                audio_file_size_mb: row.get(2)?,
                segments_json: json_column(row, 3)?,
                combined_transcript_text: row.get(4)?,
                metadata_json: json_column(row, 5)?,
                info_json: json_column(row, 6)?,
                audit: audit_columns(row, 7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Number of persisted records of the given kind.
    pub fn count(&self, kind: RecordKind) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_name(kind));
        let count: i64 = self.conn().query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Reads the four audit columns starting at `start`.
fn audit_columns(row: &Row<'_>, start: usize) -> rusqlite::Result<Audit> {
    Ok(Audit {
        ip_address: row.get(start)?,
        request_time: from_millis(row, start + 1)?,
        response_time: from_millis(row, start + 2)?,
        total_time: row.get(start + 3)?,
    })
}

fn insert_record(tx: &rusqlite::Transaction<'_>, record: &WriteRecord) -> rusqlite::Result<()> {
    match record {
        WriteRecord::TextEmbedding(r) => {
            tx.prepare_cached(
                "INSERT INTO text_embeddings (text, text_hash, llm_model_name, pooling_method,
                    embedding_json, ip_address, request_time, response_time, total_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(params![
                r.text,
                r.text_hash,
                r.llm_model_name,
                r.pooling_method,
                r.embedding_json.to_string(),
                r.audit.ip_address,
                to_millis(r.audit.request_time),
                to_millis(r.audit.response_time),
                r.audit.total_time,
            ])?;
        }
        WriteRecord::DocumentEmbedding(r) => {
            tx.prepare_cached(
                "INSERT INTO document_embeddings (document_hash, filename, mimetype,
                    document_file_hash, llm_model_name, pooling_method, file_data, results_json,
                    ip_address, request_time, response_time, total_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?
            .execute(params![
                r.document_hash,
                r.filename,
                r.mimetype,
                r.document_file_hash,
                r.llm_model_name,
                r.pooling_method,
                r.file_data,
                r.results_json.to_string(),
                r.audit.ip_address,
                to_millis(r.audit.request_time),
                to_millis(r.audit.response_time),
                r.audit.total_time,
            ])?;
        }
        WriteRecord::Document(r) => {
            tx.prepare_cached(
                "INSERT INTO documents (llm_model_name, document_hash, pooling_method, request_time)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                r.llm_model_name,
                r.document_hash,
                r.pooling_method,
                to_millis(r.created_at),
            ])?;
        }
        WriteRecord::AudioTranscript(r) => {
            tx.prepare_cached(
                "INSERT INTO audio_transcripts (audio_file_hash, audio_file_name,
                    audio_file_size_mb, segments_json, combined_transcript_text, metadata_json,
                    info_json, ip_address, request_time, response_time, total_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?
            .execute(params![
                r.audio_file_hash,
                r.audio_file_name,
                r.audio_file_size_mb,
                r.segments_json.to_string(),
                r.combined_transcript_text,
                r.metadata_json.to_string(),
                r.info_json.to_string(),
                r.audit.ip_address,
                to_millis(r.audit.request_time),
                to_millis(r.audit.response_time),
                r.audit.total_time,
            ])?;
        }
    }
    Ok(())
}

impl RecordStore for SqliteStore {
    fn insert_batch(&self, records: &[WriteRecord]) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for record in records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn load_keys(&self) -> Result<Vec<LogicalKey>, StoreError> {
        let conn = self.conn();
        let mut keys = Vec::new();

        let queries = [
            (
                RecordKind::TextEmbedding,
                "SELECT DISTINCT llm_model_name, text_hash, pooling_method FROM text_embeddings",
            ),
            (
                RecordKind::DocumentEmbedding,
                "SELECT DISTINCT llm_model_name, document_file_hash, pooling_method
                 FROM document_embeddings",
            ),
            (
                RecordKind::Document,
                "SELECT DISTINCT llm_model_name, document_hash, pooling_method FROM documents",
            ),
            (
                RecordKind::AudioTranscript,
                "SELECT DISTINCT '', audio_file_hash, NULL FROM audio_transcripts",
            ),
        ];

        for (kind, sql) in queries {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(LogicalKey::new(
                    kind,
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for key in rows {
                keys.push(key?);
            }
        }
        Ok(keys)
    }

    fn contains_key(&self, key: &LogicalKey) -> Result<bool, StoreError> {
        let conn = self.conn();
        let variant = key.variant.as_deref().unwrap_or_default();
        let exists: bool = match key.kind {
            RecordKind::TextEmbedding => conn
                .prepare_cached(
                    "SELECT EXISTS (SELECT 1 FROM text_embeddings
                     WHERE text_hash = ?1 AND llm_model_name = ?2 AND pooling_method = ?3)",
                )?
                .query_row(params![key.content, key.model, variant], |row| row.get(0))?,
            RecordKind::DocumentEmbedding => conn
                .prepare_cached(
                    "SELECT EXISTS (SELECT 1 FROM document_embeddings
                     WHERE document_file_hash = ?1 AND llm_model_name = ?2
                       AND pooling_method = ?3)",
                )?
                .query_row(params![key.content, key.model, variant], |row| row.get(0))?,
            RecordKind::Document => conn
                .prepare_cached(
                    "SELECT EXISTS (SELECT 1 FROM documents
                     WHERE document_hash = ?1 AND llm_model_name = ?2 AND pooling_method = ?3)",
                )?
                .query_row(params![key.content, key.model, variant], |row| row.get(0))?,
            RecordKind::AudioTranscript => conn
                .prepare_cached(
                    "SELECT EXISTS (SELECT 1 FROM audio_transcripts WHERE audio_file_hash = ?1)",
                )?
                .query_row(params![key.content], |row| row.get(0))?,
        };
        Ok(exists)
    }

    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<PurgeStats, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut stats = PurgeStats::default();
        for kind in RecordKind::ALL {
            let table = table_name(kind);
            let count = if dry_run {
                let sql = format!("SELECT COUNT(*) FROM {table} WHERE request_time < ?1");
                let count: i64 = tx.query_row(&sql, params![to_millis(cutoff)], |row| row.get(0))?;
                count as usize
            } else {
                let sql = format!("DELETE FROM {table} WHERE request_time < ?1");
                tx.execute(&sql, params![to_millis(cutoff)])?
            };
            stats.add(kind, count);
        }
        tx.commit()?;
        Ok(stats)
    }
}
