//! On-disk workflow checkpoint.
//!
//! The checkpoint records which stages finished, which one was about to run,
//! and the files produced so far. Only the coordinator writes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ProgressError;

/// File name used when the checkpoint lives in an output directory.
pub const DEFAULT_PROGRESS_FILE: &str = ".workflow_progress.json";

/// Persisted run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub output_files: BTreeMap<String, PathBuf>,
    /// Opaque snapshot of the configuration the run was started with.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl WorkflowProgress {
    pub fn new(configuration: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            last_update: now,
            completed_stages: Vec::new(),
            current_stage: String::new(),
            output_files: BTreeMap::new(),
            configuration,
        }
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    /// Append `stage` to the completed list unless it is already there.
    pub fn mark_completed(&mut self, stage: &str) {
        if !self.is_completed(stage) {
            self.completed_stages.push(stage.to_string());
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

/// Reads and writes a [`WorkflowProgress`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for [`DEFAULT_PROGRESS_FILE`] inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(DEFAULT_PROGRESS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn load(&self) -> Result<WorkflowProgress, ProgressError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProgressError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(ProgressError::io("reading", &self.path, e)),
        };

        serde_json::from_slice(&bytes).map_err(|source| ProgressError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the checkpoint to a sibling temp file, then rename it into place.
    pub async fn save(&self, progress: &WorkflowProgress) -> Result<(), ProgressError> {
        let json = serde_json::to_vec_pretty(progress).map_err(ProgressError::Encode)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProgressError::io("creating directory", parent, e))?;
        }

        let tmp = self.sibling(".tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| ProgressError::io("writing", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ProgressError::io("renaming", &tmp, e));
        }

        debug!(path = %self.path.display(), stage = %progress.current_stage, "Checkpoint saved");
        Ok(())
    }

    /// Remove the checkpoint. A missing file is not an error.
    pub async fn delete(&self) -> Result<(), ProgressError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProgressError::io("removing", &self.path, e)),
        }
    }

    /// Move an unreadable checkpoint out of the way and return its new path.
    pub async fn quarantine(&self) -> Result<PathBuf, ProgressError> {
        let target = self.sibling(&format!(".corrupt-{}", Utc::now().timestamp()));
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|e| ProgressError::io("moving aside", &self.path, e))?;
        Ok(target)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path());
        let err = store.load().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path());
        tokio::fs::write(store.path(), b"{\"start_time\": ").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ProgressError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path().join("nested"));

        let mut progress = WorkflowProgress::new(serde_json::json!({ "workers": 10 }));
        progress.mark_completed("analysis");
        progress.current_stage = "prewarm".to_string();
        progress
            .output_files
            .insert("analysis_json".to_string(), PathBuf::from("out/analysis.json"));
        store.save(&progress).await.unwrap();

        assert_eq!(store.load().await.unwrap(), progress);
        // No temp file is left behind.
        let mut entries = tokio::fs::read_dir(store.path().parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![DEFAULT_PROGRESS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path());
        let mut progress = WorkflowProgress::new(serde_json::Value::Null);
        progress.mark_completed("analysis");
        progress.current_stage = "errors".to_string();
        store.save(&progress).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(store.path()).await.unwrap()).unwrap();
        for key in [
            "start_time",
            "last_update",
            "completed_stages",
            "current_stage",
            "output_files",
            "configuration",
        ] {
            assert!(raw.get(key).is_some(), "missing key {key}");
        }
        let start = raw["start_time"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(start).is_ok());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path());
        store
            .save(&WorkflowProgress::new(serde_json::Value::Null))
            .await
            .unwrap();
        store.delete().await.unwrap();
        store.delete().await.unwrap();
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn test_quarantine_moves_file_aside() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::in_dir(dir.path());
        tokio::fs::write(store.path(), b"garbage").await.unwrap();

        let moved = store.quarantine().await.unwrap();
        assert!(!store.exists().await);
        let name = moved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".workflow_progress.json.corrupt-"));
        assert_eq!(tokio::fs::read(&moved).await.unwrap(), b"garbage");
    }

    #[test]
    fn test_mark_completed_is_append_only_and_unique() {
        let mut progress = WorkflowProgress::new(serde_json::Value::Null);
        progress.mark_completed("a");
        progress.mark_completed("b");
        progress.mark_completed("a");
        assert_eq!(progress.completed_stages, vec!["a", "b"]);
    }
}
