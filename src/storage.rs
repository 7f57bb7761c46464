//! Object store access.
//!
//! The pipeline reads originals from the source bucket and writes
//! derivatives to the thumbnails bucket. The trait seam exists so the
//! processor can run against an in-memory store in tests.

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{Result, WorkerError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes. Returns `None` when the object does not
    /// exist.
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// Write an object, replacing any existing one under the same key.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()>;

    /// Existence check without transferring the body.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Public URL under which an object is served.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Build the shared AWS SDK configuration from worker settings.
///
/// Credentials come from the default provider chain. A custom endpoint
/// covers S3-compatible stores such as MinIO or LocalStack.
pub async fn aws_sdk_config(config: &StorageConfig) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(config.region.clone()));

    if let Some(endpoint) = &config.endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    loader.load().await
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    config: StorageConfig,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, config: StorageConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let response = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(WorkerError::Storage(format!(
                    "Failed to download {bucket}/{key}: {service_err}"
                )));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| {
                WorkerError::Storage(format!("Failed to read body of {bucket}/{key}: {e}"))
            })?
            .into_bytes();

        debug!(bucket = %bucket, key = %key, size = data.len(), "Object downloaded");
        Ok(Some(data))
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|e| {
                WorkerError::Storage(format!("Failed to upload {bucket}/{key}: {e}"))
            })?;

        debug!(bucket = %bucket, key = %key, size, "Object uploaded");
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(WorkerError::Storage(format!(
                        "Failed to check {bucket}/{key}: {service_err}"
                    )))
                }
            }
        }
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        if let Some(base) = &self.config.public_base_url {
            return format!("{}/{}", base.trim_end_matches('/'), key);
        }
        if let Some(endpoint) = &self.config.endpoint {
            return format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key);
        }
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            bucket, self.config.region, key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(config: StorageConfig) -> S3ObjectStore {
        let aws = aws_sdk_config(&config).await;
        S3ObjectStore::new(aws_sdk_s3::Client::new(&aws), config)
    }

    fn base_config() -> StorageConfig {
        StorageConfig {
            region: "eu-west-1".to_string(),
            endpoint: None,
            thumbs_bucket: "thumbnails".to_string(),
            public_base_url: None,
        }
    }

    #[tokio::test]
    async fn test_public_url_virtual_hosted_format() {
        let store = store(base_config()).await;
        assert_eq!(
            store.public_url("thumbnails", "cat.png.thumb.jpg"),
            "https://thumbnails.s3.eu-west-1.amazonaws.com/cat.png.thumb.jpg"
        );
    }

    #[tokio::test]
    async fn test_public_url_uses_custom_endpoint() {
        let store = store(StorageConfig {
            endpoint: Some("http://localhost:9000/".to_string()),
            ..base_config()
        })
        .await;
        assert_eq!(
            store.public_url("thumbnails", "cat.png.thumb.jpg"),
            "http://localhost:9000/thumbnails/cat.png.thumb.jpg"
        );
    }

    #[tokio::test]
    async fn test_public_url_prefers_base_override() {
        let store = store(StorageConfig {
            endpoint: Some("http://localhost:9000".to_string()),
            public_base_url: Some("https://cdn.example.com/thumbs/".to_string()),
            ..base_config()
        })
        .await;
        assert_eq!(
            store.public_url("thumbnails", "cat.png.thumb.jpg"),
            "https://cdn.example.com/thumbs/cat.png.thumb.jpg"
        );
    }
}
