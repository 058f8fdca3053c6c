use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{FileInfo, ObjectStore, StorageError};

/// Objects stored in a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in remote.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io("creating directory", parent, e))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| StorageError::io("copying", from, e))?;
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<FileInfo>, StorageError> {
        let start = self.resolve(prefix);
        let mut files = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::io("reading directory", &dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io("reading directory", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io("inspecting", &path, e))?;

                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let metadata = entry
                        .metadata()
                        .await
                        .map_err(|e| StorageError::io("inspecting", &path, e))?;
                    if let Some(rel) = self.relative(&path) {
                        files.push(FileInfo::new(rel, metadata.len()));
                    }
                }
            }
        }

        debug!(root = %self.root.display(), count = files.len(), "Walked local store");
        Ok(files)
    }

    async fn download_object(&self, remote: &str, local: &Path) -> Result<(), StorageError> {
        copy_file(&self.resolve(remote), local).await
    }

    async fn upload_object(&self, local: &Path, remote: &str) -> Result<(), StorageError> {
        copy_file(local, &self.resolve(remote)).await
    }

    fn local_path(&self, remote: &str) -> Option<PathBuf> {
        Some(self.resolve(remote))
    }

    fn key_for_local_dir(&self, dir: &Path) -> Option<String> {
        // Both sides canonicalized so `.` and relative roots compare equal.
        let root = std::fs::canonicalize(&self.root).ok()?;
        let dir = std::fs::canonicalize(dir).ok()?;
        let rel = dir.strip_prefix(&root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, vec![0u8; len]).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_relative() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.jpg", 10).await;
        write(dir.path(), "videos/b.mp4", 20).await;
        write(dir.path(), "videos/deep/c.mp4", 30).await;

        let store = LocalStore::new(dir.path());
        let mut files = store.list_objects("").await.unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            files,
            vec![
                FileInfo::new("a.jpg", 10),
                FileInfo::new("videos/b.mp4", 20),
                FileInfo::new("videos/deep/c.mp4", 30),
            ]
        );

        let under_prefix = store.list_objects("videos/deep").await.unwrap();
        assert_eq!(under_prefix, vec![FileInfo::new("videos/deep/c.mp4", 30)]);
    }

    #[tokio::test]
    async fn test_missing_root_is_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("absent"));
        assert!(matches!(
            store.list_objects("").await,
            Err(StorageError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_and_upload_copy() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/x.bin", 5).await;
        let store = LocalStore::new(dir.path().join("src"));

        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("nested/x.bin");
        store.download_object("x.bin", &local).await.unwrap();
        assert_eq!(tokio::fs::metadata(&local).await.unwrap().len(), 5);

        store.upload_object(&local, "copies/y.bin").await.unwrap();
        assert!(dir.path().join("src/copies/y.bin").is_file());
        assert_eq!(store.local_path("x.bin"), Some(dir.path().join("src").join("x.bin")));
    }

    #[test]
    fn test_key_for_local_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("out/reports")).unwrap();
        let outside = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        assert_eq!(
            store.key_for_local_dir(&dir.path().join("out/reports")).as_deref(),
            Some("out/reports")
        );
        assert_eq!(store.key_for_local_dir(dir.path()).as_deref(), Some(""));
        assert_eq!(store.key_for_local_dir(outside.path()), None);
        // Not created yet, so nothing in it can be listed.
        assert_eq!(store.key_for_local_dir(&dir.path().join("missing")), None);
    }
}
