//! Configuration types for issue-courier
//!
//! A [`Config`] is built once at process start (from code or from a JSON file),
//! validated, and then shared as `Arc<Config>` with every component.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Main configuration for issue-courier
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Download stage settings (directory, chunking, in-flight check)
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy applied to every job
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Periodic trigger intervals
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Distribution policy (attach vs. link)
    #[serde(default)]
    pub distribution: DistributionConfig,

    /// 7z compression of downloaded files
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Known series that subscribers can subscribe to
    #[serde(default)]
    pub series: Vec<SeriesConfig>,
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                format!("failed to read config file '{}': {}", path.display(), e),
                "path",
            )
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(Error::config(
                "worker concurrency must be at least 1",
                "worker.concurrency",
            ));
        }
        if self.download.chunk_size == 0 {
            return Err(Error::config(
                "download chunk size must be non-zero",
                "download.chunk_size",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for series in &self.series {
            if series.name.trim().is_empty() {
                return Err(Error::config("series name must not be empty", "series.name"));
            }
            if !seen.insert(series.name.as_str()) {
                return Err(Error::config(
                    format!("series '{}' is declared twice", series.name),
                    "series.name",
                ));
            }
            if let Some(pattern) = &series.title_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::config(
                        format!("invalid title pattern for series '{}': {}", series.name, e),
                        "series.title_pattern",
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Whether `name` is one of the configured series
    pub fn is_known_series(&self, name: &str) -> bool {
        self.series.iter().any(|s| s.name == name)
    }

    /// Names of all configured series, in declaration order
    pub fn series_names(&self) -> Vec<String> {
        self.series.iter().map(|s| s.name.clone()).collect()
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "./issue-courier.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Download stage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloaded files are stored in (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Write buffer size in bytes (default: 128 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum time between progress log lines (default: 10 seconds)
    #[serde(default = "default_progress_log_interval", with = "duration_serde")]
    pub progress_log_interval: Duration,

    /// How long to watch an existing partial file before deciding it is stale (default: 15 seconds)
    #[serde(default = "default_in_flight_check", with = "duration_serde")]
    pub in_flight_check_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
            progress_log_interval: default_progress_log_interval(),
            in_flight_check_interval: default_in_flight_check(),
        }
    }
}

/// Retry configuration for failed jobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of re-enqueues after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Countdown before the first retry; doubled for every further attempt (default: 10 seconds)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Upper bound on a single countdown (default: 120 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Add random jitter to countdowns (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: true,
        }
    }
}

/// Worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing at once (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between claim attempts when the queue is empty (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Wall-clock limit for a single job attempt (default: 1 hour)
    #[serde(default = "default_job_timeout", with = "duration_serde")]
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            job_timeout: default_job_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Lease granted to a claimed job; a running job whose lease lapsed belongs to a dead worker
    pub fn lease(&self) -> Duration {
        self.job_timeout + Duration::from_secs(60)
    }
}

/// Periodic trigger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Run the periodic triggers at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between discovery sweeps (default: 1 hour)
    #[serde(default = "default_hourly", with = "duration_serde")]
    pub discover_interval: Duration,

    /// Number of source pages requested per series on each discovery sweep (default: 1)
    #[serde(default = "default_discover_pages")]
    pub discover_pages: u32,

    /// Interval between detail-resolution sweeps (default: 10 minutes)
    #[serde(default = "default_ten_minutes", with = "duration_serde")]
    pub fetch_detail_interval: Duration,

    /// Interval between download sweeps (default: 10 minutes)
    #[serde(default = "default_ten_minutes", with = "duration_serde")]
    pub download_interval: Duration,

    /// Interval between distribution sweeps (default: 1 hour)
    #[serde(default = "default_hourly", with = "duration_serde")]
    pub distribute_interval: Duration,

    /// Interval between subscription reconciliation sweeps (default: 1 hour)
    #[serde(default = "default_hourly", with = "duration_serde")]
    pub reconcile_interval: Duration,

    /// Interval between compression sweeps (default: 1 hour)
    #[serde(default = "default_hourly", with = "duration_serde")]
    pub compress_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discover_interval: default_hourly(),
            discover_pages: default_discover_pages(),
            fetch_detail_interval: default_ten_minutes(),
            download_interval: default_ten_minutes(),
            distribute_interval: default_hourly(),
            reconcile_interval: default_hourly(),
            compress_interval: default_hourly(),
        }
    }
}

/// Distribution policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Files larger than this are sent as a time-limited link instead of an attachment (default: 20 MiB)
    #[serde(default = "default_attachment_limit")]
    pub attachment_size_limit: u64,

    /// Lifetime of generated links (default: 7 days)
    #[serde(default = "default_link_expiry", with = "duration_serde")]
    pub link_expiry: Duration,

    /// Display name used in the sender field (default: "Issue Courier")
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            attachment_size_limit: default_attachment_limit(),
            link_expiry: default_link_expiry(),
            sender_name: default_sender_name(),
        }
    }
}

/// Compression of downloaded files into 7z archives
///
/// An archive is only sent when it is smaller than the file it was made from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compress downloaded files at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Format tags eligible for compression (default: ["pdf"])
    #[serde(default = "default_compress_formats")]
    pub formats: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            formats: default_compress_formats(),
        }
    }
}

impl CompressionConfig {
    /// Whether files with `format` are compressed
    pub fn applies_to(&self, format: &str) -> bool {
        self.enabled && self.formats.iter().any(|f| f.eq_ignore_ascii_case(format))
    }
}

/// A series subscribers can subscribe to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesConfig {
    /// Series name (e.g., "economist_europe")
    pub name: String,

    /// Case-insensitive regex matched against discovered titles to classify them into this series
    #[serde(default)]
    pub title_pattern: Option<String>,
}

impl SeriesConfig {
    /// Series without a classification pattern
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title_pattern: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./issue-courier.db")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_progress_log_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_in_flight_check() -> Duration {
    Duration::from_secs(15)
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_hourly() -> Duration {
    Duration::from_secs(3600)
}

fn default_ten_minutes() -> Duration {
    Duration::from_secs(600)
}

fn default_discover_pages() -> u32 {
    1
}

fn default_attachment_limit() -> u64 {
    20 * 1024 * 1024
}

fn default_link_expiry() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_compress_formats() -> Vec<String> {
    vec!["pdf".to_string()]
}

fn default_sender_name() -> String {
    "Issue Courier".to_string()
}

// Durations are stored as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(10));
        assert_eq!(config.worker.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.download.chunk_size, 128 * 1024);
        assert_eq!(config.schedule.discover_interval, Duration::from_secs(3600));
        assert_eq!(config.schedule.download_interval, Duration::from_secs(600));
        assert!(config.series.is_empty());
        assert!(config.compression.applies_to("PDF"));
        assert!(!config.compression.applies_to("epub"));
        config.validate().unwrap();
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let config: Config = serde_json::from_str(
            r#"{"retry": {"base_delay": 5, "max_delay": 60}, "worker": {"job_timeout": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.base_delay, Duration::from_secs(5));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert!(config.retry.jitter, "unspecified fields keep their defaults");
        assert_eq!(config.worker.lease(), Duration::from_secs(90));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("worker.concurrency")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_duplicate_and_bad_series() {
        let mut config = Config::default();
        config.series = vec![SeriesConfig::named("weekly"), SeriesConfig::named("weekly")];
        assert!(config.validate().is_err());

        config.series = vec![SeriesConfig {
            name: "weekly".into(),
            title_pattern: Some("(unclosed".into()),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_json_file_loads_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"series": [{"name": "economist_europe", "title_pattern": "economist.*europe"}]}"#,
        )
        .unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert!(config.is_known_series("economist_europe"));
        assert!(!config.is_known_series("economist_asia"));
        assert_eq!(config.series_names(), vec!["economist_europe".to_string()]);
    }
}
