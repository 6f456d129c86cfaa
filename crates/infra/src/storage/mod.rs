//! Artifact storage for generated documents (PDF, XML, HTML summaries).
//!
//! Callers never pick the backend: [`build_artifact_store`] selects it once
//! from configuration and the rest of the pipeline holds an
//! `Arc<dyn ArtifactStore>`.

mod local;
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalArtifactStore;
pub use s3::S3ArtifactStore;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact name {0:?}")]
    InvalidName(String),
    #[error("artifact content is not valid base64: {0}")]
    InvalidContent(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote storage error: {0}")]
    Remote(String),
}

/// Document content as handed over by the gateway: raw bytes or base64 text
/// straight from a provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    Bytes(Vec<u8>),
    Base64(String),
}

impl ArtifactContent {
    pub fn into_bytes(self) -> Result<Vec<u8>, StorageError> {
        match self {
            ArtifactContent::Bytes(bytes) => Ok(bytes),
            ArtifactContent::Base64(text) => STANDARD
                .decode(text.trim())
                .map_err(|e| StorageError::InvalidContent(e.to_string())),
        }
    }
}

impl From<Vec<u8>> for ArtifactContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    S3,
}

/// Handle returned by a save; `location` is what gets written onto the
/// invoice (`pdf_path`, `xml_path`, `html_path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub backend: StorageBackend,
    pub location: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    async fn save(
        &self,
        content: ArtifactContent,
        name: &str,
    ) -> Result<StoredArtifact, StorageError>;
}

/// Artifact names are flat file names; anything that could escape the
/// storage root is rejected.
pub(crate) fn validate_name(name: &str) -> Result<&str, StorageError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains("..")
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

pub(crate) fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "xml" => "application/xml",
        Some(ext) if ext == "html" || ext == "htm" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

pub async fn build_artifact_store(
    config: &StorageConfig,
) -> Result<Arc<dyn ArtifactStore>, StorageError> {
    match config {
        StorageConfig::Local { dir } => Ok(Arc::new(LocalArtifactStore::new(dir.clone()).await?)),
        StorageConfig::S3 {
            bucket,
            region,
            prefix,
        } => Ok(Arc::new(
            S3ArtifactStore::from_env(bucket.clone(), region.clone(), prefix.clone()).await,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_that_escape_the_root() {
        assert!(validate_name("nota_000001.pdf").is_ok());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/b.pdf").is_err());
        assert!(validate_name("a\\b.pdf").is_err());
        assert!(validate_name("  ").is_err());
    }

    #[test]
    fn base64_content_is_decoded() {
        let content = ArtifactContent::Base64(STANDARD.encode(b"%PDF-1.4"));
        assert_eq!(content.into_bytes().unwrap(), b"%PDF-1.4");
        assert!(ArtifactContent::Base64("***".to_string()).into_bytes().is_err());
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("nota.PDF"), "application/pdf");
        assert_eq!(content_type_for("nota.xml"), "application/xml");
        assert_eq!(content_type_for("nota"), "application/octet-stream");
    }
}
