//! Staging store implementation using S3/MinIO
//!
//! S3 offers strong read-after-write consistency for PUT and LIST, which is
//! what lets a fan-out stage discover every object the previous stage wrote
//! by listing a prefix.

use crate::{
    join_key, validate_prefix, ListPage, StagingStore, StorageError, StorageResult,
};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region (e.g., "us-west-2") or "us-east-1" for `MinIO`
    pub region: String,

    /// S3 endpoint (custom for `MinIO`, empty for AWS S3)
    pub endpoint: Option<String>,

    /// AWS access key ID
    pub access_key_id: String,

    /// AWS secret access key
    pub secret_access_key: String,

    /// Root prefix under which all staging objects live (e.g., "staging/")
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "similarity-extraction-staging".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

/// S3/MinIO staging store
pub struct S3StagingStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3StagingStore {
    /// Create a new S3 staging store client
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::InvalidConfig(
                "S3 bucket name must not be empty".to_string(),
            ));
        }
        validate_prefix(&config.prefix)?;
        let prefix = root_prefix(config.prefix);

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "extraction-storage",
        );

        let region = Region::new(config.region.clone());

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(region)
            .behavior_version_latest();

        // Set custom endpoint for MinIO
        if let Some(endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for MinIO
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix,
        })
    }

    /// Combine the root prefix with a store key
    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Strip the root prefix from an S3 object key
    fn store_key<'a>(&self, s3_key: &'a str) -> &'a str {
        s3_key.strip_prefix(self.prefix.as_str()).unwrap_or(s3_key)
    }
}

/// Root prefixes always name a directory
fn root_prefix(mut prefix: String) -> String {
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

#[async_trait::async_trait]
impl StagingStore for S3StagingStore {
    fn location(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, prefix: &str, key: &str, data: &[u8]) -> StorageResult<String> {
        let key = join_key(prefix, key)?;
        let full_key = self.full_key(&key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type("application/json")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        debug!(bucket = %self.bucket, key = %full_key, "Stored object");
        Ok(key)
    }

    async fn get(&self, prefix: &str, key: &str) -> StorageResult<Vec<u8>> {
        let key = join_key(prefix, key)?;
        let full_key = self.full_key(&key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(key.clone())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        validate_prefix(prefix)?;
        let full_prefix = self.full_key(prefix);
        let max_keys = i32::try_from(max_keys.max(1)).unwrap_or(i32::MAX);

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .max_keys(max_keys)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|k| self.store_key(k).to_string())
            .collect();

        Ok(ListPage {
            keys,
            next: response.next_continuation_token().map(str::to_string),
        })
    }

    async fn delete(&self, prefix: &str, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(&join_key(prefix, key)?);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(())
    }

    async fn exists(&self, prefix: &str, key: &str) -> StorageResult<bool> {
        let full_key = self.full_key(&join_key(prefix, key)?);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(StorageError::S3Error(e.to_string())),
        }
    }
}
