//! Stage reports on disk.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::ReportFormat;
use crate::error::{AppError, Result};

/// Writes `<name>.json` and/or `<name>.md` into the output directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    format: ReportFormat,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn json_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn markdown_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.md"))
    }

    /// Write a report in the configured formats and return what was written.
    pub async fn write<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        markdown: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        if self.format.json() {
            written.push(self.write_json(name, data).await?);
        }
        if self.format.markdown() {
            written.push(self.write_markdown(name, markdown).await?);
        }
        Ok(written)
    }

    /// Write `<name>.md` regardless of the configured format.
    pub async fn write_markdown(&self, name: &str, markdown: &str) -> Result<PathBuf> {
        let path = self.markdown_path(name);
        write_atomic(&path, markdown.as_bytes()).await?;
        Ok(path)
    }

    /// Write `<name>.json` regardless of the configured format. Used for
    /// results another stage reads back.
    pub async fn write_json<T: Serialize>(&self, name: &str, data: &T) -> Result<PathBuf> {
        let path = self.json_path(name);
        let body = serde_json::to_vec_pretty(data)
            .map_err(|e| AppError::Other(anyhow::anyhow!("encoding {name} report: {e}")))?;
        write_atomic(&path, &body).await?;
        Ok(path)
    }

    /// Output-file entries (`file name -> path`) a report would produce.
    pub fn output_files(&self, name: &str) -> Vec<(String, PathBuf)> {
        let mut files = Vec::new();
        if self.format.json() {
            files.push((format!("{name}.json"), self.json_path(name)));
        }
        if self.format.markdown() {
            files.push((format!("{name}.md"), self.markdown_path(name)));
        }
        files
    }
}

/// Write through a sibling temporary file so readers never see a partial report.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::io("creating directory", parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| AppError::io("writing", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::io("renaming", &tmp, e))?;

    debug!(path = %path.display(), bytes = contents.len(), "Wrote report");
    Ok(())
}

/// Render a Markdown table. Pipes in cells are escaped.
pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let escape = |cell: &str| cell.replace('|', "\\|");
    let mut out = String::new();
    out.push_str(&format!("| {} |\n", headers.join(" | ")));
    out.push_str(&format!("|{}\n", " --- |".repeat(headers.len())));
    for row in rows {
        let cells: Vec<String> = row.iter().map(|c| escape(c)).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_respects_format() {
        let dir = TempDir::new().unwrap();
        let data = json!({"ok": true});

        let json_only = ReportWriter::new(dir.path(), ReportFormat::Json);
        let written = json_only.write("a", &data, "# A").await.unwrap();
        assert_eq!(written, vec![dir.path().join("a.json")]);
        assert!(!dir.path().join("a.md").exists());

        let both = ReportWriter::new(dir.path().join("nested"), ReportFormat::Both);
        let written = both.write("b", &data, "# B").await.unwrap();
        assert_eq!(written.len(), 2);
        let md = std::fs::read_to_string(dir.path().join("nested/b.md")).unwrap();
        assert_eq!(md, "# B");
        assert!(!dir.path().join("nested/b.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_json_ignores_format() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path(), ReportFormat::Markdown);
        let path = writer.write_json("results", &vec![1, 2, 3]).await.unwrap();
        let back: Vec<u32> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        assert_eq!(writer.output_files("results").len(), 1);
    }

    #[test]
    fn test_markdown_table() {
        let table = markdown_table(
            &["Path", "Status"],
            &[vec!["a|b.jpg".to_string(), "200".to_string()]],
        );
        assert_eq!(
            table,
            "| Path | Status |\n| --- | --- |\n| a\\|b.jpg | 200 |\n"
        );
    }
}
