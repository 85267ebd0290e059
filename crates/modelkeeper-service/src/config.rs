use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for modelkeeper.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "modelkeeper".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retry behavior of the persistence writer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WriterConfig {
    /// Total number of attempts for a batch commit, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt. Every further attempt doubles it.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for the delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration of the distributed lock client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// URL of the Redis lock broker, e.g. `redis://localhost:6379`.
    ///
    /// When unset, locks are only exclusive within this process.
    pub redis_url: Option<String>,
    /// Bounds the whole acquisition and is also the validity of a held lock on the broker.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Number of retries after the first failed acquisition attempt.
    pub retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay_min: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_delay_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            lock_timeout: Duration::from_millis(20_000),
            retry_count: 5,
            retry_delay_min: Duration::from_millis(100),
            retry_delay_max: Duration::from_millis(1000),
        }
    }
}

/// Where model artifacts live and how they are loaded.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    /// The durable directory holding downloaded model files.
    pub models_dir: PathBuf,
    /// A JSON file containing the list of artifact URLs to acquire on startup.
    ///
    /// It is created with a default list if it does not exist.
    pub model_urls_file: PathBuf,
    /// Downloads smaller than this many bytes are considered broken and discarded.
    pub min_artifact_size: u64,
    /// How long to wait for another process holding the download lock.
    #[serde(with = "humantime_serde")]
    pub download_lock_timeout: Duration,
    /// Context size in tokens for models loaded to compute embeddings.
    pub embedding_context_size: u32,
    /// Context size in tokens for models loaded to compute completions.
    pub completion_context_size: u32,
    /// Passed through to the model loader.
    pub verbose: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            model_urls_file: PathBuf::from("model_urls.json"),
            min_artifact_size: 100 * 1024 * 1024,
            download_lock_timeout: Duration::from_secs(20 * 60),
            embedding_context_size: 512,
            completion_context_size: 4000,
            verbose: false,
        }
    }
}

/// An optional RAM-backed mirror of the models directory.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FastStorageConfig {
    pub enabled: bool,
    /// Mount point of the fast storage. Models are mirrored into `<path>/models`.
    pub path: PathBuf,
}

impl Default for FastStorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("/mnt/ramdisk"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct GpuConfig {
    /// Probe for GPUs using `nvidia-smi`. When disabled, models are always loaded on the CPU.
    pub detect: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self { detect: true }
    }
}

/// Age-based expiry of persisted records.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Whether the background sweeper runs at all.
    pub enabled: bool,
    /// Records whose request time is older than this are deleted.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Time between two sweeps. The first sweep happens one interval after startup.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: Duration::from_secs(3600 * 24 * 7),
            interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Path of the SQLite database holding persisted records.
    pub database_path: PathBuf,

    pub writer: WriterConfig,

    pub locks: LockConfig,

    pub models: ModelsConfig,

    pub fast_storage: FastStorageConfig,

    pub gpu: GpuConfig,

    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            database_path: PathBuf::from("modelkeeper.sqlite"),
            writer: WriterConfig::default(),
            locks: LockConfig::default(),
            models: ModelsConfig::default(),
            fast_storage: FastStorageConfig::default(),
            gpu: GpuConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
