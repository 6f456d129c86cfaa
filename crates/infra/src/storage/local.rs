//! Filesystem artifact backend.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{
    ArtifactContent, ArtifactStore, StorageBackend, StorageError, StoredArtifact, validate_name,
};

/// Writes artifacts as plain files under one directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    dir: PathBuf,
}

impl LocalArtifactStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// File names currently stored, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn save(
        &self,
        content: ArtifactContent,
        name: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let name = validate_name(name)?;
        let bytes = content.into_bytes()?;

        // The directory may have been removed since start-up.
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "artifact written");

        Ok(StoredArtifact {
            backend: StorageBackend::Local,
            location: path.to_string_lossy().into_owned(),
        })
    }
}
