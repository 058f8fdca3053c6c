use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand, builder::PossibleValuesParser};
use std::path::PathBuf;

use crate::config::{HttpMethod, ReportFormat, StorageBackend, WarmConfig};
use crate::stages::{STAGE_NAMES, SkipFlags};

#[derive(Parser, Debug)]
#[command(name = "cdnwarm", author, version, about = "Pre-warm a CDN cache from object storage, then measure it")]
pub struct Args {
    /// Config file (TOML). Defaults to <config dir>/cdnwarm/config.toml when present
    #[arg(short, long, global = true, env = "CDNWARM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true, env = "CDNWARM_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every stage in order, resumable from a checkpoint
    Workflow(WorkflowArgs),

    /// Analyze source object sizes
    Analyze,

    /// Request every object through the CDN
    Prewarm,

    /// Summarize pre-warm failures
    Errors,

    /// Measure CDN latency under load
    Loadtest,

    /// Re-encode large videos with ffmpeg
    Optimize,

    /// Show the workflow checkpoint
    Progress {
        /// Delete the checkpoint instead of showing it
        #[arg(long)]
        discard: bool,
    },

    /// Print the effective configuration as TOML
    #[command(name = "show-config")]
    ShowConfig,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct WorkflowArgs {
    /// Skip every stage before this one
    #[arg(long, value_parser = PossibleValuesParser::new(STAGE_NAMES))]
    pub resume_from: Option<String>,

    /// Keep going after a stage fails
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "CDNWARM_CONTINUE_ON_ERROR")]
    pub continue_on_error: bool,

    #[arg(long)]
    pub skip_analysis: bool,

    #[arg(long)]
    pub skip_prewarm: bool,

    #[arg(long)]
    pub skip_errors: bool,

    #[arg(long)]
    pub skip_loadtest: bool,

    #[arg(long)]
    pub skip_optimize: bool,
}

impl WorkflowArgs {
    pub fn skip_flags(&self) -> SkipFlags {
        SkipFlags {
            analysis: self.skip_analysis,
            prewarm: self.skip_prewarm,
            errors: self.skip_errors,
            loadtest: self.skip_loadtest,
            optimize: self.skip_optimize,
        }
    }
}

/// Flags and `CDNWARM_*` variables that override the config file.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Directory for reports and the checkpoint
    #[arg(long, global = true, env = "CDNWARM_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Storage backend
    #[arg(long, global = true, value_enum, env = "CDNWARM_BACKEND")]
    pub backend: Option<StorageBackend>,

    /// Local directory, or rclone `remote:path`
    #[arg(long, global = true, env = "CDNWARM_SOURCE")]
    pub source: Option<String>,

    /// Only list objects under this prefix
    #[arg(long, global = true, env = "CDNWARM_PREFIX")]
    pub prefix: Option<String>,

    /// rclone config file
    #[arg(long, global = true, env = "CDNWARM_RCLONE_CONFIG")]
    pub rclone_config: Option<PathBuf>,

    /// Comma-separated extension filter
    #[arg(long, global = true, value_delimiter = ',', env = "CDNWARM_EXTENSIONS")]
    pub extensions: Vec<String>,

    /// Process at most this many objects
    #[arg(long, global = true, env = "CDNWARM_LIMIT")]
    pub limit: Option<usize>,

    /// CDN base URL
    #[arg(long, global = true, env = "CDNWARM_BASE_URL")]
    pub base_url: Option<String>,

    /// Total worker budget
    #[arg(long, global = true, env = "CDNWARM_WORKERS")]
    pub workers: Option<usize>,

    /// Give small, medium and large objects separate queues and workers
    #[arg(long, global = true, env = "CDNWARM_OPTIMIZE_BY_SIZE")]
    pub optimize_by_size: bool,

    #[arg(long, global = true, allow_negative_numbers = true)]
    pub small_file_workers: Option<i64>,

    #[arg(long, global = true, allow_negative_numbers = true)]
    pub medium_file_workers: Option<i64>,

    #[arg(long, global = true, allow_negative_numbers = true)]
    pub large_file_workers: Option<i64>,

    /// Largest small object, in MiB
    #[arg(long, global = true, value_name = "MIB")]
    pub small_file_threshold: Option<u64>,

    /// Largest medium object, in MiB
    #[arg(long, global = true, value_name = "MIB")]
    pub medium_file_threshold: Option<u64>,

    /// Queue capacity per worker (default 3.0)
    #[arg(long, global = true)]
    pub queue_multiplier: Option<f64>,

    /// Per-task deadline in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub worker_timeout: Option<u64>,

    #[arg(long, global = true, value_enum)]
    pub method: Option<HttpMethod>,

    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// HTTP request timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Load-test workers
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Load-test duration in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub duration: Option<u64>,

    #[arg(long, global = true)]
    pub max_requests: Option<u64>,

    /// Distinct URLs used by the load test
    #[arg(long, global = true)]
    pub sample_size: Option<usize>,

    #[arg(long, global = true, env = "CDNWARM_FFMPEG")]
    pub ffmpeg_path: Option<PathBuf>,

    /// Upload optimized files that came out smaller
    #[arg(long, global = true)]
    pub upload: bool,

    #[arg(long, global = true, value_enum)]
    pub report_format: Option<ReportFormat>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut WarmConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }

        let source = &mut config.source;
        if let Some(backend) = self.backend {
            source.backend = backend;
        }
        if let Some(root) = &self.source {
            source.root = root.clone();
        }
        if let Some(prefix) = &self.prefix {
            source.prefix = prefix.clone();
        }
        if let Some(path) = &self.rclone_config {
            source.rclone_config = Some(path.clone());
        }
        if !self.extensions.is_empty() {
            source.extensions = self.extensions.clone();
        }
        if self.limit.is_some() {
            source.limit = self.limit;
        }

        if let Some(url) = &self.base_url {
            config.cdn.base_url = url.clone();
        }

        let pool = &mut config.pool;
        if let Some(n) = self.workers {
            pool.workers = n;
        }
        if self.optimize_by_size {
            pool.optimize_by_size = true;
        }
        if let Some(n) = self.small_file_workers {
            pool.small_file_workers = n;
        }
        if let Some(n) = self.medium_file_workers {
            pool.medium_file_workers = n;
        }
        if let Some(n) = self.large_file_workers {
            pool.large_file_workers = n;
        }
        if let Some(mib) = self.small_file_threshold {
            pool.small_file_threshold_mib = mib;
        }
        if let Some(mib) = self.medium_file_threshold {
            pool.medium_file_threshold_mib = mib;
        }
        if let Some(m) = self.queue_multiplier {
            pool.queue_multiplier = m;
        }
        if let Some(secs) = self.worker_timeout {
            pool.worker_timeout_secs = secs;
        }

        let http = &mut config.http;
        if let Some(method) = self.method {
            http.method = method;
        }
        if let Some(n) = self.max_retries {
            http.max_retries = n;
        }
        if let Some(secs) = self.timeout {
            http.timeout_secs = secs;
        }

        let load = &mut config.load_test;
        if let Some(n) = self.concurrency {
            load.concurrency = n;
        }
        if let Some(secs) = self.duration {
            load.duration_secs = secs;
        }
        if self.max_requests.is_some() {
            load.max_requests = self.max_requests;
        }
        if let Some(n) = self.sample_size {
            load.sample_size = n;
        }

        if let Some(path) = &self.ffmpeg_path {
            config.optimize.ffmpeg_path = path.clone();
        }
        if self.upload {
            config.optimize.upload = true;
        }
        if let Some(format) = self.report_format {
            config.report.format = format;
        }
    }
}
