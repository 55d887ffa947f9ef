#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object storage boundary for multipart uploads.
//!
//! [`StorageGateway`] is the narrow set of multipart operations the sync
//! pipeline needs. [`S3Gateway`] implements it on top of `aws-sdk-s3` and
//! works with any S3-compatible endpoint.
//!
//! # Environment Variables
//!
//! Credentials, region, and endpoint come from the standard AWS chain
//! (`AWS_PROFILE`, `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`,
//! `AWS_REGION`, `AWS_ENDPOINT_URL`, `~/.aws/config`).

use async_trait::async_trait;
use aws_sdk_s3::config::StalledStreamProtectionConfig;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketVersioningStatus, CompletedMultipartUpload, CompletedPart};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use supersync_index_models::{ByteRange, Location};

/// Errors returned by a [`StorageGateway`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `CreateMultipartUpload` failed.
    #[error("Failed to start multipart upload to s3://{bucket}/{key}: {source}")]
    StartUpload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `UploadPart` failed.
    #[error("Failed to upload part {part_number} of s3://{bucket}/{key}: {source}")]
    UploadPart {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// 1-based part number.
        part_number: u32,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `UploadPartCopy` failed.
    #[error("Failed to copy part {part_number} of s3://{bucket}/{key} from {copy_source}: {source}")]
    CopyPart {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// 1-based part number.
        part_number: u32,
        /// `bucket/key?versionId=...` the bytes were copied from.
        copy_source: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `CompleteMultipartUpload` failed.
    #[error("Failed to complete upload {upload_id} to s3://{bucket}/{key}: {source}")]
    Complete {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Multipart upload id.
        upload_id: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `AbortMultipartUpload` failed.
    #[error("Failed to abort upload {upload_id} to s3://{bucket}/{key}: {source}")]
    Abort {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Multipart upload id.
        upload_id: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `HeadObject` failed.
    #[error("Failed to head s3://{bucket}/{key}: {source}")]
    Head {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A bucket-level request (`HeadBucket`, `GetBucketVersioning`) failed.
    #[error("{operation} on bucket {bucket} failed: {source}")]
    Bucket {
        /// Bucket name.
        bucket: String,
        /// SDK operation name.
        operation: &'static str,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A successful response lacked a field the upload depends on.
    #[error("{operation} on s3://{bucket}/{key} returned no {field}")]
    MissingField {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// SDK operation name.
        operation: &'static str,
        /// Missing response field.
        field: &'static str,
    },

    /// The upload completed but the bucket did not assign a version id,
    /// so the parts cannot be referenced later.
    #[error("s3://{bucket}/{key} was stored without a version id; enable versioning on {bucket}")]
    Unversioned {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
}

/// Identifies one part slot of an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTarget {
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Multipart upload id.
    pub upload_id: String,
    /// 1-based part number.
    pub part_number: u32,
}

/// A byte range of a specific object version to copy from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    /// Source bucket.
    pub bucket: String,
    /// Source key.
    pub key: String,
    /// Source object version id.
    pub version: String,
    /// Bytes to copy.
    pub range: ByteRange,
}

impl CopySource {
    /// `bucket/key?versionId=...` with the key percent-encoded, as
    /// `x-amz-copy-source` expects.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!(
            "{}/{}?versionId={}",
            self.bucket,
            utf8_percent_encode(&self.key, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.version, NON_ALPHANUMERIC),
        )
    }
}

impl From<&Location> for CopySource {
    fn from(location: &Location) -> Self {
        Self {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            version: location.version.clone(),
            range: location.content_range,
        }
    }
}

/// Part number and `ETag` submitted on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartTag {
    /// 1-based part number.
    pub part_number: u32,
    /// Tag returned when the part was uploaded or copied.
    pub etag: String,
}

/// Multipart upload operations used by the sync pipeline.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Starts a multipart upload and returns its upload id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the request fails.
    async fn start_multipart_upload(&self, bucket: &str, key: &str)
    -> Result<String, GatewayError>;

    /// Uploads `body` as one part and returns its `ETag`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the request fails.
    async fn upload_part(&self, target: &PartTarget, body: Vec<u8>)
    -> Result<String, GatewayError>;

    /// Fills one part with a server-side copy and returns its `ETag`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the request fails.
    async fn copy_part(
        &self,
        target: &PartTarget,
        source: &CopySource,
    ) -> Result<String, GatewayError>;

    /// Completes the upload with `parts` (ascending part number) and
    /// returns the version id of the new object.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unversioned`] if the bucket assigned no
    /// version id, or another [`GatewayError`] if the request fails.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartTag],
    ) -> Result<String, GatewayError>;

    /// Discards an in-progress upload and any parts already stored.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the request fails.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), GatewayError>;

    /// Size of part 1 of the existing object at `bucket/key`, or `None` if
    /// there is no such object.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for failures other than "not found".
    async fn head_first_part(&self, bucket: &str, key: &str) -> Result<Option<u64>, GatewayError>;
}

/// [`StorageGateway`] backed by `aws-sdk-s3`.
pub struct S3Gateway {
    client: aws_sdk_s3::Client,
}

impl S3Gateway {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Builds a client from a loaded AWS configuration.
    ///
    /// `force_path_style` is needed for most S3-compatible servers that
    /// don't support virtual-hosted buckets.
    #[must_use]
    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, force_path_style: bool) -> Self {
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(force_path_style)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self::new(aws_sdk_s3::Client::from_conf(config))
    }

    /// Whether `bucket` exists and is reachable with the current
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bucket`] for failures other than "not found".
    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, GatewayError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadBucketError::is_not_found)
                {
                    return Ok(false);
                }
                Err(GatewayError::Bucket {
                    bucket: bucket.to_string(),
                    operation: "HeadBucket",
                    source: Box::new(err),
                })
            }
        }
    }

    /// Whether object versioning is enabled on `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bucket`] if the request fails.
    pub async fn bucket_versioning_enabled(&self, bucket: &str) -> Result<bool, GatewayError> {
        let output = self
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| GatewayError::Bucket {
                bucket: bucket.to_string(),
                operation: "GetBucketVersioning",
                source: Box::new(e),
            })?;

        Ok(output.status() == Some(&BucketVersioningStatus::Enabled))
    }
}

#[async_trait]
impl StorageGateway for S3Gateway {
    async fn start_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, GatewayError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| GatewayError::StartUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Box::new(e),
            })?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| GatewayError::MissingField {
                bucket: bucket.to_string(),
                key: key.to_string(),
                operation: "CreateMultipartUpload",
                field: "upload id",
            })?;

        log::info!("Started multipart upload {upload_id} to s3://{bucket}/{key}");
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        target: &PartTarget,
        body: Vec<u8>,
    ) -> Result<String, GatewayError> {
        let output = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .part_number(sdk_part_number(target.part_number))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| GatewayError::UploadPart {
                bucket: target.bucket.clone(),
                key: target.key.clone(),
                part_number: target.part_number,
                source: Box::new(e),
            })?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| missing_etag(target, "UploadPart"))
    }

    async fn copy_part(
        &self,
        target: &PartTarget,
        source: &CopySource,
    ) -> Result<String, GatewayError> {
        let copy_source = source.header_value();

        let output = self
            .client
            .upload_part_copy()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&target.upload_id)
            .part_number(sdk_part_number(target.part_number))
            .copy_source(&copy_source)
            .copy_source_range(source.range.header_value())
            .send()
            .await
            .map_err(|e| GatewayError::CopyPart {
                bucket: target.bucket.clone(),
                key: target.key.clone(),
                part_number: target.part_number,
                copy_source: copy_source.clone(),
                source: Box::new(e),
            })?;

        output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or_else(|| missing_etag(target, "UploadPartCopy"))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartTag],
    ) -> Result<String, GatewayError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(sdk_part_number(p.part_number))
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| GatewayError::Complete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                source: Box::new(e),
            })?;

        let version = output
            .version_id()
            .filter(|v| !v.is_empty() && *v != "null")
            .ok_or_else(|| GatewayError::Unversioned {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        log::info!(
            "Completed upload {upload_id} to s3://{bucket}/{key} ({} parts, version {version})",
            parts.len()
        );
        Ok(version.to_string())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), GatewayError> {
        log::warn!("Aborting multipart upload {upload_id} to s3://{bucket}/{key}");

        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| GatewayError::Abort {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                source: Box::new(e),
            })?;

        Ok(())
    }

    async fn head_first_part(&self, bucket: &str, key: &str) -> Result<Option<u64>, GatewayError> {
        let result = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .part_number(1)
            .send()
            .await;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0);
                #[allow(clippy::cast_sign_loss)] // S3 content-length is non-negative
                let size = size as u64;
                Ok(Some(size))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(GatewayError::Head {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }
}

/// S3 part numbers are `1..=10_000`, so this never saturates in practice.
fn sdk_part_number(part_number: u32) -> i32 {
    i32::try_from(part_number).unwrap_or(i32::MAX)
}

fn missing_etag(target: &PartTarget, operation: &'static str) -> GatewayError {
    GatewayError::MissingField {
        bucket: target.bucket.clone(),
        key: target.key.clone(),
        operation,
        field: "ETag",
    }
}
