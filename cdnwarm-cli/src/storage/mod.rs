//! Object storage backends.

mod local;
mod rclone;

pub use local::LocalStore;
pub use rclone::RcloneStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{SourceConfig, StorageBackend, normalize_extension};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with exit code {code}: {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("unexpected listing output: {0}")]
    Listing(String),
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// A listed object. `path` is relative to the store root and uses `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Lower-case extension without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Recursively list objects below `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<FileInfo>, StorageError>;

    async fn download_object(&self, remote: &str, local: &Path) -> Result<(), StorageError>;

    async fn upload_object(&self, local: &Path, remote: &str) -> Result<(), StorageError>;

    /// Direct filesystem path of an object, when the store is local.
    fn local_path(&self, _remote: &str) -> Option<PathBuf> {
        None
    }

    /// Object key a local directory maps to, if it lies inside the store.
    fn key_for_local_dir(&self, _dir: &Path) -> Option<String> {
        None
    }
}

pub fn open_store(config: &SourceConfig) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackend::Local => Arc::new(LocalStore::new(&config.root)),
        StorageBackend::Rclone => Arc::new(RcloneStore::new(
            &config.rclone_path,
            config.rclone_config.clone(),
            &config.root,
        )),
    }
}

/// List the configured source, applying the extension filter and limit.
///
/// Objects under `exclude` (the output directory) are skipped when it lies
/// inside the store. The result is sorted by path so repeated runs see the
/// same order.
pub async fn list_source(
    store: &dyn ObjectStore,
    config: &SourceConfig,
    exclude: Option<&Path>,
) -> Result<Vec<FileInfo>, StorageError> {
    let mut files = store.list_objects(&config.prefix).await?;
    let listed = files.len();

    if let Some(key) = exclude.and_then(|dir| store.key_for_local_dir(dir)) {
        if key.is_empty() {
            return Err(StorageError::Listing(
                "output directory is the source root; choose a separate output_dir".to_string(),
            ));
        }
        let before = files.len();
        files = exclude_prefix(files, &key);
        debug!(excluded = before - files.len(), dir = %key, "Skipped output directory");
    }

    let allowed: Vec<String> = config.extensions.iter().map(|e| normalize_extension(e)).collect();
    files = filter_by_extension(files, &allowed);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    if let Some(limit) = config.limit {
        files.truncate(limit);
    }

    info!(
        backend = store.name(),
        root = %config.root,
        listed,
        selected = files.len(),
        "Listed source objects"
    );
    Ok(files)
}

/// Drop `key` itself and everything below it.
pub fn exclude_prefix(files: Vec<FileInfo>, key: &str) -> Vec<FileInfo> {
    let key = key.trim_matches('/');
    files
        .into_iter()
        .filter(|f| {
            f.path
                .strip_prefix(key)
                .is_none_or(|rest| !(rest.is_empty() || rest.starts_with('/')))
        })
        .collect()
}

/// Keep files whose extension is in `allowed`. An empty list keeps everything.
pub fn filter_by_extension(files: Vec<FileInfo>, allowed: &[String]) -> Vec<FileInfo> {
    if allowed.is_empty() {
        return files;
    }
    files
        .into_iter()
        .filter(|f| f.extension().is_some_and(|ext| allowed.contains(&ext)))
        .collect()
}
