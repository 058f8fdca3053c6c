use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{FileInfo, ObjectStore, StorageError};

/// Objects on any rclone remote, driven through the `rclone` binary.
#[derive(Debug, Clone)]
pub struct RcloneStore {
    rclone_path: PathBuf,
    config_path: Option<PathBuf>,
    /// `remote:path` root of the store.
    remote: String,
}

#[derive(Debug, Deserialize)]
struct LsJsonEntry {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Size")]
    size: i64,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
}

impl RcloneStore {
    pub fn new(rclone_path: impl Into<PathBuf>, config_path: Option<PathBuf>, remote: &str) -> Self {
        Self {
            rclone_path: rclone_path.into(),
            config_path,
            remote: remote.trim_end_matches('/').to_string(),
        }
    }

    /// `remote:root/rel`, tolerating empty segments.
    fn remote_path(&self, rel: &str) -> String {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            self.remote.clone()
        } else if self.remote.ends_with(':') {
            format!("{}{rel}", self.remote)
        } else {
            format!("{}/{rel}", self.remote)
        }
    }

    fn list_args(&self, prefix: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "lsjson".to_string(),
            "-R".to_string(),
            "--files-only".to_string(),
            self.remote_path(prefix),
        ]);
        args
    }

    fn copyto_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = self.base_args();
        args.extend([
            "--log-level".to_string(),
            "ERROR".to_string(),
            "copyto".to_string(),
            from,
            to,
        ]);
        args
    }

    fn base_args(&self) -> Vec<String> {
        match &self.config_path {
            Some(cfg) => vec!["--config".to_string(), cfg.to_string_lossy().into_owned()],
            None => Vec::new(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, StorageError> {
        let program = self.rclone_path.to_string_lossy().into_owned();
        debug!(%program, ?args, "Running rclone");

        let output = Command::new(&self.rclone_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StorageError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(StorageError::Command {
                program,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Parse `rclone lsjson` output. Paths are made relative to the store root
/// by prepending `prefix`.
fn parse_lsjson(stdout: &[u8], prefix: &str) -> Result<Vec<FileInfo>, StorageError> {
    let entries: Vec<LsJsonEntry> =
        serde_json::from_slice(stdout).map_err(|e| StorageError::Listing(e.to_string()))?;

    let prefix = prefix.trim_matches('/');
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| {
            let path = if prefix.is_empty() {
                e.path
            } else {
                format!("{prefix}/{}", e.path)
            };
            // rclone reports -1 when the backend does not know the size.
            FileInfo::new(path, e.size.max(0) as u64)
        })
        .collect())
}

#[async_trait]
impl ObjectStore for RcloneStore {
    fn name(&self) -> &'static str {
        "rclone"
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<FileInfo>, StorageError> {
        let stdout = self.run(&self.list_args(prefix)).await?;
        parse_lsjson(&stdout, prefix)
    }

    async fn download_object(&self, remote: &str, local: &Path) -> Result<(), StorageError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io("creating directory", parent, e))?;
        }
        let args = self.copyto_args(
            self.remote_path(remote),
            local.to_string_lossy().into_owned(),
        );
        self.run(&args).await?;
        Ok(())
    }

    async fn upload_object(&self, local: &Path, remote: &str) -> Result<(), StorageError> {
        let target = self.remote_path(remote);
        let args = self.copyto_args(local.to_string_lossy().into_owned(), target.clone());
        self.run(&args).await?;
        info!(local = %local.display(), remote = %target, "Uploaded via rclone");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_joining() {
        let store = RcloneStore::new("rclone", None, "s3:bucket/media/");
        assert_eq!(store.remote_path(""), "s3:bucket/media");
        assert_eq!(store.remote_path("/a/b.mp4"), "s3:bucket/media/a/b.mp4");

        let bare = RcloneStore::new("rclone", None, "gdrive:");
        assert_eq!(bare.remote_path("x.jpg"), "gdrive:x.jpg");
    }

    #[test]
    fn test_list_args() {
        let store = RcloneStore::new("rclone", Some(PathBuf::from("/etc/rclone.conf")), "s3:b");
        assert_eq!(
            store.list_args("img"),
            vec!["--config", "/etc/rclone.conf", "lsjson", "-R", "--files-only", "s3:b/img"]
        );
    }

    #[test]
    fn test_parse_lsjson() {
        let stdout = br#"[
            {"Path":"a.jpg","Name":"a.jpg","Size":120,"MimeType":"image/jpeg","ModTime":"2024-01-01T00:00:00Z","IsDir":false},
            {"Path":"sub/b.mp4","Name":"b.mp4","Size":-1,"IsDir":false},
            {"Path":"sub","Name":"sub","Size":0,"IsDir":true}
        ]"#;
        let files = parse_lsjson(stdout, "media").unwrap();
        assert_eq!(
            files,
            vec![FileInfo::new("media/a.jpg", 120), FileInfo::new("media/sub/b.mp4", 0)]
        );
    }

    #[test]
    fn test_parse_lsjson_rejects_garbage() {
        assert!(matches!(
            parse_lsjson(b"not json", ""),
            Err(StorageError::Listing(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let store = RcloneStore::new("/nonexistent/rclone-binary", None, "r:");
        assert!(matches!(
            store.list_objects("").await,
            Err(StorageError::Spawn { .. })
        ));
    }
}
