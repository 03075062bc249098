//! AWS SDK backed S3 client

use super::{
    BucketEncryption, DeleteFailure, ObjectRef, ObjectVersionPage, S3Api, S3Endpoint,
    VersionMarker,
};
use crate::controlplane::credentials::S3Credentials;
use crate::controlplane::provisioner::{CreateOutcome, Presence};
use crate::crd::StorageBackend;
use crate::error::{Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    AbortIncompleteMultipartUpload, BucketLifecycleConfiguration, BucketLocationConstraint,
    CreateBucketConfiguration, Delete, ExpirationStatus, LifecycleRule, ObjectIdentifier,
    PublicAccessBlockConfiguration, ServerSideEncryption, ServerSideEncryptionByDefault,
    ServerSideEncryptionConfiguration, ServerSideEncryptionRule, Tag, Tagging,
};
use aws_sdk_s3::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// S3 client scoped to one driver operation
pub struct AwsS3Client {
    client: Client,
}

impl AwsS3Client {
    pub async fn new(credentials: &S3Credentials, endpoint: &S3Endpoint) -> Self {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            "registry-storage-operator",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(endpoint.region.clone()))
            .credentials_provider(provider)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(!endpoint.virtual_hosted_style);
        if !endpoint.region_endpoint.is_empty() {
            debug!("Using S3 endpoint {}", endpoint.region_endpoint);
            builder = builder.endpoint_url(endpoint.region_endpoint.clone());
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

/// Classify an SDK error by its S3 error code, then by HTTP status
fn provider_error<E>(operation: &str, bucket: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match err.code() {
        Some("NoSuchBucket") | Some("NotFound") | Some("NoSuchKey") => ProviderErrorKind::NotFound,
        Some("BucketAlreadyExists") => ProviderErrorKind::AlreadyExists,
        Some("AccessDenied") | Some("Forbidden") => ProviderErrorKind::Forbidden,
        Some("SlowDown") | Some("Throttling") | Some("RequestLimitExceeded") => {
            ProviderErrorKind::Throttled
        }
        Some("OperationAborted") => ProviderErrorKind::Conflict,
        _ => err
            .raw_response()
            .map(|r| ProviderErrorKind::from_status(r.status().as_u16()))
            .unwrap_or(ProviderErrorKind::Other),
    };
    Error::provider(
        StorageBackend::S3,
        operation,
        bucket,
        kind,
        DisplayErrorContext(&err).to_string(),
    )
}

fn build_error(operation: &str, err: impl std::fmt::Display) -> Error {
    Error::Internal(format!("invalid S3 {} request: {}", operation, err))
}

#[async_trait]
impl S3Api for AwsS3Client {
    async fn head_bucket(&self, bucket: &str) -> Result<Presence> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(Presence::Present),
            Err(e) => match provider_error("head-bucket", bucket, e) {
                err if err.is_not_found() => Ok(Presence::Absent),
                err if err.is_forbidden() => Ok(Presence::Forbidden),
                err => Err(err),
            },
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<CreateOutcome> {
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if e.code() == Some("BucketAlreadyOwnedByYou") => Ok(CreateOutcome::Created),
            Err(e) => match provider_error("create-bucket", bucket, e) {
                err if err.is_already_exists() => Ok(CreateOutcome::AlreadyExists),
                err => Err(err),
            },
        }
    }

    async fn put_public_access_block(&self, bucket: &str) -> Result<()> {
        let config = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();
        self.client
            .put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(config)
            .send()
            .await
            .map_err(|e| provider_error("put-public-access-block", bucket, e))?;
        Ok(())
    }

    async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|(key, value)| {
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(|e| build_error("tagging", e))
            })
            .collect::<Result<Vec<_>>>()?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| build_error("tagging", e))?;

        self.client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| provider_error("put-bucket-tagging", bucket, e))?;
        Ok(())
    }

    async fn put_bucket_encryption(
        &self,
        bucket: &str,
        encryption: &BucketEncryption,
    ) -> Result<()> {
        let default = match encryption {
            BucketEncryption::Aes256 => ServerSideEncryptionByDefault::builder()
                .sse_algorithm(ServerSideEncryption::Aes256),
            BucketEncryption::Kms { key_id } => ServerSideEncryptionByDefault::builder()
                .sse_algorithm(ServerSideEncryption::AwsKms)
                .kms_master_key_id(key_id),
        }
        .build()
        .map_err(|e| build_error("encryption", e))?;

        let rule = ServerSideEncryptionRule::builder()
            .apply_server_side_encryption_by_default(default)
            .build();
        let config = ServerSideEncryptionConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| build_error("encryption", e))?;

        self.client
            .put_bucket_encryption()
            .bucket(bucket)
            .server_side_encryption_configuration(config)
            .send()
            .await
            .map_err(|e| provider_error("put-bucket-encryption", bucket, e))?;
        Ok(())
    }

    #[allow(deprecated)]
    async fn put_abort_incomplete_uploads_rule(
        &self,
        bucket: &str,
        rule_id: &str,
        days: i32,
    ) -> Result<()> {
        let rule = LifecycleRule::builder()
            .id(rule_id)
            .status(ExpirationStatus::Enabled)
            .prefix("")
            .abort_incomplete_multipart_upload(
                AbortIncompleteMultipartUpload::builder()
                    .days_after_initiation(days)
                    .build(),
            )
            .build()
            .map_err(|e| build_error("lifecycle", e))?;
        let config = BucketLifecycleConfiguration::builder()
            .rules(rule)
            .build()
            .map_err(|e| build_error("lifecycle", e))?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket)
            .lifecycle_configuration(config)
            .send()
            .await
            .map_err(|e| provider_error("put-bucket-lifecycle", bucket, e))?;
        Ok(())
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> Result<ObjectVersionPage> {
        let marker = marker.unwrap_or_default();
        let output = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .max_keys(1000)
            .set_key_marker(marker.key_marker)
            .set_version_id_marker(marker.version_id_marker)
            .send()
            .await
            .map_err(|e| provider_error("list-object-versions", bucket, e))?;

        let versions = output.versions().iter().filter_map(|v| {
            v.key().map(|key| ObjectRef {
                key: key.to_string(),
                version_id: v.version_id().map(str::to_string),
            })
        });
        let markers = output.delete_markers().iter().filter_map(|m| {
            m.key().map(|key| ObjectRef {
                key: key.to_string(),
                version_id: m.version_id().map(str::to_string),
            })
        });
        let objects = versions.chain(markers).collect();

        let next = if output.is_truncated().unwrap_or(false) {
            Some(VersionMarker {
                key_marker: output.next_key_marker().map(str::to_string),
                version_id_marker: output.next_version_id_marker().map(str::to_string),
            })
        } else {
            None
        };

        Ok(ObjectVersionPage { objects, next })
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[ObjectRef],
    ) -> Result<Vec<DeleteFailure>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let identifiers = objects
            .iter()
            .map(|o| {
                ObjectIdentifier::builder()
                    .key(&o.key)
                    .set_version_id(o.version_id.clone())
                    .build()
                    .map_err(|e| build_error("delete-objects", e))
            })
            .collect::<Result<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| build_error("delete-objects", e))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| provider_error("delete-objects", bucket, e))?;

        Ok(output
            .errors()
            .iter()
            .map(|e| DeleteFailure {
                key: e.key().unwrap_or_default().to_string(),
                code: e.code().unwrap_or_default().to_string(),
                message: e.message().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| provider_error("delete-bucket", bucket, e))?;
        Ok(())
    }
}
