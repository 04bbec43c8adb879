use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::RequestChecksumCalculation;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Local;
use rand::Rng;

use crate::config::StoreConfig;

pub const KEY_PREFIX: &str = "images/";
pub const KEY_EXTENSION: &str = "jpg";
const CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object storage upload failed: {0}")]
    Upload(String),
}

/// Destination for compressed images; returns the public URL of the stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, data: Vec<u8>) -> Result<String, StorageError>;
}

#[derive(Clone)]
pub struct S3Service {
    client: Client,
    bucket_name: String,
    domain: String,
}

impl S3Service {
    pub fn new(client: Client, bucket_name: String, domain: String) -> Self {
        Self {
            client,
            bucket_name,
            domain: domain.trim_end_matches('/').to_string(),
        }
    }

    /// Connects to any S3-compatible endpoint (Aliyun OSS, MinIO, AWS) with static credentials.
    pub async fn from_config(config: &StoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.access_key_secret.clone(),
            None,
            None,
            "vision-relay",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&config.endpoint)
            .retry_config(RetryConfig::disabled())
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();

        Self::new(
            Client::from_conf(s3_config),
            config.bucket.clone(),
            config.domain.clone(),
        )
    }

    /// `images/{yyyyMMddHHmmssffffff}-{suffix}.jpg`; the random suffix separates same-microsecond uploads.
    pub fn generate_object_key() -> String {
        let now = Local::now();
        let suffix: u32 = rand::rng().random();
        format!(
            "{}{}-{:08x}.{}",
            KEY_PREFIX,
            now.format("%Y%m%d%H%M%S%6f"),
            suffix,
            KEY_EXTENSION
        )
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.domain, key)
    }

    pub async fn put_image(&self, key: &str, image_data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(image_data))
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| StorageError::Upload(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Service {
    async fn upload(&self, data: Vec<u8>) -> Result<String, StorageError> {
        let key = S3Service::generate_object_key();
        let size = data.len();

        if let Err(e) = self.put_image(&key, data).await {
            log::error!("Upload of {} to bucket {} failed: {}", key, self.bucket_name, e);
            return Err(e);
        }

        log::info!("Uploaded {} ({} bytes) to bucket {}", key, size, self.bucket_name);
        Ok(self.public_url(&key))
    }
}
