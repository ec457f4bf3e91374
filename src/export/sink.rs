use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use super::encoder::CsvDocument;

/// Writes exported documents into one directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn write(&self, document: &CsvDocument) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory).await.with_context(|| {
            format!(
                "Failed to create export directory {}",
                self.directory.display()
            )
        })?;

        let path = self.directory.join(&document.filename);
        fs::write(&path, document.contents.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportKind;

    #[tokio::test]
    async fn test_write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("exports"));
        let doc = CsvDocument {
            kind: ExportKind::Force,
            filename: "sensor_data_x.csv".into(),
            contents: "Time (s),Weight (g),Average Weight (g)\n".into(),
        };

        let path = sink.write(&doc).await.unwrap();
        assert_eq!(path, dir.path().join("exports/sensor_data_x.csv"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), doc.contents);
    }
}
