//! Run configuration.
//!
//! Built once from defaults, an optional TOML file, environment variables and
//! command-line flags (in increasing precedence), then shared read-only by
//! every stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use warm_pool::{SizeThresholds, WorkerPoolConfig};

use crate::error::{AppError, Result};
use crate::ffmpeg::EncodeSettings;

/// File name looked up under the user config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Default user agent for outgoing requests.
pub const DEFAULT_USER_AGENT: &str = concat!("cdnwarm/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmConfig {
    /// Directory receiving reports, the checkpoint and optimized media.
    pub output_dir: PathBuf,
    pub source: SourceConfig,
    pub cdn: CdnConfig,
    pub pool: PoolSettings,
    pub http: HttpSettings,
    pub load_test: LoadTestConfig,
    pub optimize: OptimizeConfig,
    pub report: ReportConfig,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("cdnwarm-output"),
            source: SourceConfig::default(),
            cdn: CdnConfig::default(),
            pool: PoolSettings::default(),
            http: HttpSettings::default(),
            load_test: LoadTestConfig::default(),
            optimize: OptimizeConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Rclone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub backend: StorageBackend,
    /// Local directory, or `remote:path` for rclone.
    pub root: String,
    /// Listing prefix below `root`.
    pub prefix: String,
    pub rclone_path: PathBuf,
    pub rclone_config: Option<PathBuf>,
    /// Lower-case extensions without the dot. Empty accepts everything.
    pub extensions: Vec<String>,
    /// Cap on the number of listed objects.
    pub limit: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: ".".to_string(),
            prefix: String::new(),
            rclone_path: PathBuf::from("rclone"),
            rclone_config: None,
            extensions: Vec::new(),
            limit: None,
        }
    }
}

/// A named rendition requested from the CDN for every object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivative {
    pub name: String,
    /// Path inserted between the base URL and the object path.
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Query string appended to the URL, without the `?`.
    #[serde(default)]
    pub query: Option<String>,
}

impl Derivative {
    pub fn original() -> Self {
        Self {
            name: "original".to_string(),
            path_prefix: None,
            query: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub base_url: String,
    pub derivatives: Vec<Derivative>,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            derivatives: vec![Derivative::original()],
        }
    }
}

/// Worker pool sizing, as exposed to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub workers: usize,
    pub optimize_by_size: bool,
    /// `0` derives the count from `workers`.
    pub small_file_workers: i64,
    pub medium_file_workers: i64,
    pub large_file_workers: i64,
    pub small_file_threshold_mib: u64,
    pub medium_file_threshold_mib: u64,
    pub queue_multiplier: f64,
    pub worker_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 20,
            optimize_by_size: false,
            small_file_workers: 0,
            medium_file_workers: 0,
            large_file_workers: 0,
            small_file_threshold_mib: 5,
            medium_file_threshold_mib: 50,
            queue_multiplier: warm_pool::DEFAULT_QUEUE_MULTIPLIER,
            worker_timeout_secs: 120,
            shutdown_timeout_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn thresholds(&self) -> Result<SizeThresholds> {
        Ok(SizeThresholds::from_mib(
            self.small_file_threshold_mib,
            self.medium_file_threshold_mib,
        )?)
    }

    /// Size-aware pool configuration.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            total_workers: self.workers,
            small_workers: self.small_file_workers,
            medium_workers: self.medium_file_workers,
            large_workers: self.large_file_workers,
            queue_size: 0,
            queue_multiplier: self.queue_multiplier,
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Thresholds and pool configuration for a stage, honouring
    /// `optimize_by_size`. Without it every object lands in the small
    /// category, which then gets the whole worker budget.
    pub fn dispatch_plan(&self) -> Result<(SizeThresholds, WorkerPoolConfig)> {
        if self.optimize_by_size {
            return Ok((self.thresholds()?, self.pool_config()));
        }
        let config = self.pool_config().with_category_workers(
            self.workers.max(1) as i64,
            1,
            1,
        );
        Ok((SizeThresholds::uniform(), config))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub method: HttpMethod,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            timeout_secs: 60,
            connect_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    pub concurrency: usize,
    pub duration_secs: u64,
    /// Stop after this many requests even if time remains.
    pub max_requests: Option<u64>,
    /// Number of distinct URLs to cycle through.
    pub sample_size: usize,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            duration_secs: 60,
            max_requests: None,
            sample_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    pub ffmpeg_path: PathBuf,
    #[serde(flatten)]
    pub encode: EncodeSettings,
    /// Only files at least this large are re-encoded.
    pub min_size_mib: u64,
    pub extensions: Vec<String>,
    /// Upload results that came out smaller than the original.
    pub upload: bool,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            encode: EncodeSettings::default(),
            min_size_mib: 100,
            extensions: ["mp4", "mov", "mkv", "webm", "avi"]
                .into_iter()
                .map(String::from)
                .collect(),
            upload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Markdown,
    #[default]
    Both,
}

impl ReportFormat {
    pub fn json(&self) -> bool {
        matches!(self, Self::Json | Self::Both)
    }

    pub fn markdown(&self) -> bool {
        matches!(self, Self::Markdown | Self::Both)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: ReportFormat,
}

impl WarmConfig {
    /// Load the configuration file.
    ///
    /// An explicit path must exist. Without one, `<config dir>/cdnwarm/config.toml`
    /// is used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.is_file()),
        };

        let Some(path) = path else {
            debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(&path)
            .map_err(|e| AppError::io("reading config file", &path, e))?;
        let config = Self::from_toml(&text).map_err(|source| AppError::ConfigFile {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check cross-field constraints. Run after all overrides are applied.
    pub fn validate(&self) -> Result<()> {
        self.pool.thresholds()?;
        if self.pool.workers == 0 {
            return Err(AppError::config("workers must be at least 1"));
        }
        if self.cdn.derivatives.is_empty() {
            return Err(AppError::config("at least one CDN derivative is required"));
        }
        if self.load_test.concurrency == 0 {
            return Err(AppError::config("load test concurrency must be at least 1"));
        }
        if self.load_test.duration_secs == 0 && self.load_test.max_requests.is_none() {
            return Err(AppError::config(
                "load test needs a duration or a request limit",
            ));
        }
        // Resolves the same way the stages will, so bad counts fail early.
        self.pool.pool_config().normalize()?;
        Ok(())
    }

    /// `base_url`, or an error naming the stage that needs it.
    pub fn require_base_url(&self, stage: &str) -> anyhow::Result<&str> {
        let base = self.cdn.base_url.trim();
        if base.is_empty() {
            anyhow::bail!("the {stage} stage needs cdn.base_url (or --base-url)");
        }
        Ok(base)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(warm_workflow::DEFAULT_PROGRESS_FILE)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cdnwarm").join(CONFIG_FILE_NAME))
}

/// Normalize an extension filter entry (`".MP4"` becomes `"mp4"`).
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}
