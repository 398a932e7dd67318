//! Persistence of downloaded payloads.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use super::types::ItemId;

/// Destination for downloaded reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Store `payload` for `item`, returning where it ended up.
    async fn persist(&self, item: &ItemId, payload: Bytes) -> std::io::Result<PathBuf>;
}

/// Writes `<dir>/<id>.<extension>`, creating `dir` on first use.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    extension: String,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "pdf".into(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn path_for(&self, item: &ItemId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", item.file_stem(), self.extension))
    }
}

#[async_trait]
impl ReportSink for FileSink {
    async fn persist(&self, item: &ItemId, payload: Bytes) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(item);
        tokio::fs::write(&path, &payload).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_into_created_directory() {
        let root = tempfile::tempdir().unwrap();
        let sink = FileSink::new(root.path().join("reports"));
        let path = sink
            .persist(&ItemId::new("4721"), Bytes::from_static(b"%PDF-1.7"))
            .await
            .unwrap();

        assert_eq!(path, root.path().join("reports").join("4721.pdf"));
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.7");
    }
}
