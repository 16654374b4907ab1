use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Key-addressed blob storage for input and rendered images.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;
}

/// Client for an S3-compatible bucket (AWS S3, MinIO, R2).
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    /// Missing keys fall back to the usual AWS credential chain
    /// (environment, profile, instance metadata).
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: Option<&str>,
        secret_key: Option<&str>,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse()
                .map_err(|e| StorageError::Config(format!("invalid region {region}: {e}")))?,
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        // Custom endpoints rarely support virtual-host addressing.
        let bucket = if endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        match response.status_code() {
            200..=299 => Ok(response.bytes().to_vec()),
            404 => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Status {
                key: key.to_string(),
                status,
            }),
        }
    }

    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        match response.status_code() {
            200..=299 => Ok(()),
            status => Err(StorageError::Status {
                key: key.to_string(),
                status,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status} for object {key}")]
    Status { key: String, status: u16 },

    #[error("Local artifact unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
