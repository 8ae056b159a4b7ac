//! S3-compatible object store adapter
//!
//! Buckets are per-measurement (probe and result files) plus one per user
//! for uploaded target files. Delete surfaces the underlying HTTP status
//! so callers can distinguish a 204 from anything else. Transient request
//! failures are retried with capped exponential backoff.

use std::collections::HashMap;
use std::path::Path;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::{CommonSettings, RetryPolicy};
use crate::retry::with_retry;
use crate::types::StorageError;

/// HTTP status reported for a successful delete.
pub const DELETED: u16 = 204;

/// Summary of one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Head of one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// Typed wrapper over the S3 client
#[derive(Clone)]
pub struct Storage {
    client: aws_sdk_s3::Client,
    retry: RetryPolicy,
}

fn is_transient(err: &StorageError) -> bool {
    matches!(err, StorageError::Request { .. })
}

fn request_error<E: std::fmt::Display, R>(
    operation: &'static str,
    bucket: &str,
    err: &SdkError<E, R>,
) -> StorageError {
    StorageError::Request {
        operation,
        bucket: bucket.to_string(),
        reason: match err {
            SdkError::ServiceError(service) => service.err().to_string(),
            other => other.to_string(),
        },
    }
}

impl Storage {
    pub async fn connect(settings: &CommonSettings) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            settings.s3_access_key.clone(),
            settings.s3_secret_key.clone(),
            None,
            None,
            "iris-settings",
        );
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&settings.s3_endpoint)
            .region(aws_config::Region::new(settings.s3_region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        // MinIO and friends want path-style addressing.
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            retry: settings.retry.clone(),
        }
    }

    /// Create a bucket, tolerating one that already exists.
    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        with_retry(&self.retry, "create_bucket", is_transient, || async {
            match self.client.create_bucket().bucket(bucket).send().await {
                Ok(_) => Ok(()),
                Err(SdkError::ServiceError(service))
                    if matches!(
                        service.err(),
                        aws_sdk_s3::operation::create_bucket::CreateBucketError::BucketAlreadyOwnedByYou(_)
                    ) =>
                {
                    Ok(())
                }
                Err(err) => Err(request_error("create_bucket", bucket, &err)),
            }
        })
        .await
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        with_retry(&self.retry, "delete_bucket", is_transient, || async {
            self.client
                .delete_bucket()
                .bucket(bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|err| request_error("delete_bucket", bucket, &err))
        })
        .await
    }

    pub async fn list(&self, bucket: &str) -> Result<Vec<ObjectSummary>, StorageError> {
        let output = with_retry(&self.retry, "list", is_transient, || async {
            self.client
                .list_objects_v2()
                .bucket(bucket)
                .send()
                .await
                .map_err(|err| request_error("list", bucket, &err))
        })
        .await?;
        Ok(output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                })
            })
            .collect())
    }

    pub async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let output = with_retry(&self.retry, "head", is_transient, || async {
            self.client
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| match &err {
                    SdkError::ServiceError(service) if service.err().is_not_found() => {
                        StorageError::NotFound {
                            bucket: bucket.to_string(),
                            key: key.to_string(),
                        }
                    }
                    _ => request_error("head", bucket, &err),
                })
        })
        .await?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output.last_modified().and_then(to_chrono),
            metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    pub async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = with_retry(&self.retry, "get", is_transient, || async {
            self.client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| match &err {
                    SdkError::ServiceError(service)
                        if matches!(
                            service.err(),
                            aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)
                        ) =>
                    {
                        StorageError::NotFound {
                            bucket: bucket.to_string(),
                            key: key.to_string(),
                        }
                    }
                    _ => request_error("get", bucket, &err),
                })
        })
        .await?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Request {
                operation: "get",
                bucket: bucket.to_string(),
                reason: err.to_string(),
            })?;
        Ok(bytes.into_bytes().to_vec())
    }

    /// Download an object to a local path.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), StorageError> {
        let bytes = self.get_bytes(bucket, key).await?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| StorageError::LocalFile {
                path: path.display().to_string(),
                source,
            })
    }

    /// Upload a local file, with optional object metadata.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        with_retry(&self.retry, "put", is_transient, || async {
            let body = ByteStream::from_path(path)
                .await
                .map_err(|err| StorageError::LocalFile {
                    path: path.display().to_string(),
                    source: std::io::Error::other(err),
                })?;
            let mut request = self.client.put_object().bucket(bucket).key(key).body(body);
            if let Some(metadata) = metadata {
                for (k, v) in metadata {
                    request = request.metadata(k, v);
                }
            }
            request
                .send()
                .await
                .map(|_| ())
                .map_err(|err| request_error("put", bucket, &err))
        })
        .await
    }

    pub async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        with_retry(&self.retry, "put", is_transient, || {
            let bytes = bytes.clone();
            async move {
                let mut request = self
                    .client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(bytes));
                if let Some(metadata) = metadata {
                    for (k, v) in metadata {
                        request = request.metadata(k, v);
                    }
                }
                request
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|err| request_error("put", bucket, &err))
            }
        })
        .await
    }

    /// Delete an object and surface the HTTP status (204 on success).
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<u16, StorageError> {
        with_retry(&self.retry, "delete", is_transient, || async {
            match self
                .client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(DELETED),
                Err(err) => match &err {
                    SdkError::ServiceError(service) => Ok(service.raw().status().as_u16()),
                    _ => Err(request_error("delete", bucket, &err)),
                },
            }
        })
        .await
    }

    /// Delete without failing the caller: the status is returned for
    /// logging, transport errors collapse to 0.
    pub async fn delete_no_check(&self, bucket: &str, key: &str) -> u16 {
        match self.delete(bucket, key).await {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(bucket, key, error = %err, "unchecked delete failed");
                0
            }
        }
    }
}

fn to_chrono(value: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(value.secs(), value.subsec_nanos()).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_spares_not_found() {
        assert!(is_transient(&StorageError::Request {
            operation: "get",
            bucket: "b".to_string(),
            reason: "503".to_string(),
        }));
        assert!(!is_transient(&StorageError::NotFound {
            bucket: "b".to_string(),
            key: "k".to_string(),
        }));
    }
}
