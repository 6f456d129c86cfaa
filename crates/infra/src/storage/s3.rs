//! S3 artifact backend. Objects are written under a fixed key prefix.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use super::{
    ArtifactContent, ArtifactStore, StorageBackend, StorageError, StoredArtifact,
    content_type_for, validate_name,
};

/// Uploads artifacts to an S3 bucket under a fixed key prefix.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3ArtifactStore {
    pub fn new(client: S3Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build a client from the default AWS credential chain.
    pub async fn from_env(bucket: String, region: Option<String>, prefix: String) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::new(S3Client::new(&sdk_config), bucket, prefix)
    }

    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::S3
    }

    async fn save(
        &self,
        content: ArtifactContent,
        name: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let name = validate_name(name)?;
        let bytes = content.into_bytes()?;
        let key = self.key_for(name);
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type_for(name))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("S3 upload of {key} failed: {e}")))?;
        debug!(bucket = %self.bucket, key = %key, size, "artifact uploaded");

        Ok(StoredArtifact {
            backend: StorageBackend::S3,
            location: format!("s3://{}/{}", self.bucket, key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Region};

    #[test]
    fn keys_live_under_the_prefix() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("sa-east-1"))
            .build();
        let store = S3ArtifactStore::new(
            S3Client::from_conf(conf),
            "notas".to_string(),
            "notas-fiscais/".to_string(),
        );
        assert_eq!(store.key_for("nota_000001.pdf"), "notas-fiscais/nota_000001.pdf");
        assert_eq!(store.backend(), StorageBackend::S3);
    }
}
