use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::BlobStore;
use crate::core::{StorageConfig, StorageError, StorageResult};

/// S3-compatible document storage. Region and credentials come from the AWS environment.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    cdn_url: Option<String>,
}

impl S3BlobStore {
    pub async fn new(config: &StorageConfig) -> Self {
        let region_provider = RegionProviderChain::default_provider().or_else("ap-southeast-1");
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        S3BlobStore {
            client: Client::new(&sdk_config),
            bucket: config.bucket.clone(),
            cdn_url: config.cdn_url.clone(),
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        match &self.cdn_url {
            Some(cdn) => format!("{}/{}", cdn.trim_end_matches('/'), key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put {}: {}", key, e)))?;

        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(format!("get {}: {}", key, e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read {}: {}", key, e)))?;
        Ok(data.to_vec())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("delete {}: {}", key, e)))?;
        Ok(())
    }
}
