//! Amazon S3 Storage Driver
//!
//! Provisions an S3 (or S3 compatible) bucket for the registry. Buckets the
//! operator creates are hardened: public access blocked, tagged with cluster
//! ownership, default encryption enabled and incomplete multipart uploads
//! aborted after a day.

#[cfg(feature = "aws")]
mod client;

#[cfg(feature = "aws")]
pub use client::AwsS3Client;

use super::DriverContext;
use crate::controlplane::credentials::{
    CredentialResolver, S3Credentials, PRIVATE_CONFIG_SECRET_NAME,
};
use crate::controlplane::naming::{generate_storage_name, MAX_BUCKET_NAME_LEN};
use crate::controlplane::provisioner::{
    CreateOutcome, HardeningStep, Presence, PresenceReasons, ResourceOps, BUCKET_REASONS,
};
use crate::crd::{Infrastructure, RegistryStorage, S3Storage, StorageBackend};
use crate::domain::ports::{CaBundle, RegistryEnvVar, StorageDriver};
use crate::error::{AggregateError, Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume, VolumeMount};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Region used when neither the config nor the cluster provide one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Lifecycle rule aborting stale multipart uploads
pub const ABORT_UPLOADS_RULE_ID: &str = "cleanup-incomplete-multipart-registry-uploads";

/// Days after which incomplete multipart uploads are aborted
pub const ABORT_UPLOADS_AFTER_DAYS: i32 = 1;

/// Namespace holding user supplied CA bundles
pub const TRUSTED_CA_NAMESPACE: &str = "openshift-config";

/// Config map key holding the CA bundle
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Key of the shared credentials file in the private configuration secret
pub const CREDENTIALS_KEY: &str = "credentials";

const CREDENTIALS_VOLUME: &str = "registry-storage-credentials";
const CREDENTIALS_MOUNT_PATH: &str = "/var/run/secrets/cloud";
const CLOUDFRONT_VOLUME: &str = "registry-cloudfront";
const CLOUDFRONT_MOUNT_PATH: &str = "/etc/docker/cloudfront";
const CLOUDFRONT_KEY_FILE: &str = "private.pem";

/// Objects per delete batch, the S3 API maximum
const DELETE_BATCH_SIZE: usize = 1000;

// =============================================================================
// S3 API Port
// =============================================================================

/// Bucket default encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEncryption {
    /// Provider managed keys
    Aes256,
    /// Customer managed KMS key
    Kms { key_id: String },
}

/// One object version (or delete marker) in a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub key: String,
    pub version_id: Option<String>,
}

/// Continuation markers for version listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMarker {
    pub key_marker: Option<String>,
    pub version_id_marker: Option<String>,
}

/// One page of object versions
#[derive(Debug, Clone, Default)]
pub struct ObjectVersionPage {
    pub objects: Vec<ObjectRef>,
    pub next: Option<VersionMarker>,
}

/// Per object failure reported by a batch delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Bucket level S3 operations used by the driver
#[async_trait]
pub trait S3Api: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<Presence>;

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<CreateOutcome>;

    async fn put_public_access_block(&self, bucket: &str) -> Result<()>;

    async fn put_bucket_tagging(&self, bucket: &str, tags: &BTreeMap<String, String>)
        -> Result<()>;

    async fn put_bucket_encryption(&self, bucket: &str, encryption: &BucketEncryption)
        -> Result<()>;

    async fn put_abort_incomplete_uploads_rule(
        &self,
        bucket: &str,
        rule_id: &str,
        days: i32,
    ) -> Result<()>;

    async fn list_object_versions(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> Result<ObjectVersionPage>;

    async fn delete_objects(&self, bucket: &str, objects: &[ObjectRef])
        -> Result<Vec<DeleteFailure>>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

/// Connection parameters for an S3 client
#[derive(Debug, Clone)]
pub struct S3Endpoint {
    pub region: String,
    pub region_endpoint: String,
    pub virtual_hosted_style: bool,
}

/// Builds S3 clients from freshly resolved credentials
#[async_trait]
pub trait S3Connector: Send + Sync {
    async fn connect(
        &self,
        credentials: &S3Credentials,
        endpoint: &S3Endpoint,
    ) -> Result<Arc<dyn S3Api>>;
}

/// Connector backed by the AWS SDK
#[derive(Debug, Clone, Default)]
pub struct AwsS3Connector;

#[async_trait]
impl S3Connector for AwsS3Connector {
    #[cfg(feature = "aws")]
    async fn connect(
        &self,
        credentials: &S3Credentials,
        endpoint: &S3Endpoint,
    ) -> Result<Arc<dyn S3Api>> {
        Ok(Arc::new(AwsS3Client::new(credentials, endpoint).await))
    }

    #[cfg(not(feature = "aws"))]
    async fn connect(
        &self,
        _credentials: &S3Credentials,
        _endpoint: &S3Endpoint,
    ) -> Result<Arc<dyn S3Api>> {
        Err(Error::BackendUnavailable {
            backend: StorageBackend::S3,
            reason: "built without the `aws` feature".into(),
        })
    }
}

// =============================================================================
// Bucket Operations
// =============================================================================

/// `ResourceOps` strategy for S3 buckets
pub struct S3BucketOps {
    api: Arc<dyn S3Api>,
    region: String,
    tags: BTreeMap<String, String>,
    encryption: BucketEncryption,
}

impl S3BucketOps {
    /// Remove every object version and delete marker in batches.
    ///
    /// Per object failures are collected and the listing continues.
    async fn delete_all_versions(&self, bucket: &str) -> Result<()> {
        let mut failures = AggregateError::new();
        let mut marker = None;
        let mut deleted = 0usize;

        loop {
            let page = self.api.list_object_versions(bucket, marker).await?;
            for batch in page.objects.chunks(DELETE_BATCH_SIZE) {
                for failure in self.api.delete_objects(bucket, batch).await? {
                    if failure.code == "NoSuchKey" {
                        continue;
                    }
                    failures.record(
                        "delete-object",
                        &format!("{}/{}", bucket, failure.key),
                        &Error::Internal(format!("{}: {}", failure.code, failure.message)),
                    );
                }
                deleted += batch.len();
            }
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!("Deleted {} object versions from bucket {}", deleted, bucket);
        failures.into_result()
    }
}

#[async_trait]
impl ResourceOps for S3BucketOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::S3
    }

    fn kind(&self) -> &'static str {
        "bucket"
    }

    fn reasons(&self) -> PresenceReasons {
        BUCKET_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.api.head_bucket(name).await
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        self.api.create_bucket(name, &self.region).await
    }

    fn hardening_steps(&self) -> Vec<HardeningStep> {
        vec![
            HardeningStep::BlockPublicAccess,
            HardeningStep::Tag,
            HardeningStep::Encrypt,
            HardeningStep::AbortIncompleteUploads,
        ]
    }

    async fn harden(&self, name: &str, step: HardeningStep) -> Result<String> {
        match step {
            HardeningStep::BlockPublicAccess => {
                self.api.put_public_access_block(name).await?;
                Ok("Public access to the S3 bucket and its contents has been blocked".into())
            }
            HardeningStep::Tag => {
                self.api.put_bucket_tagging(name, &self.tags).await?;
                Ok(format!("Tags were applied to the S3 bucket: {}", self.tags.len()))
            }
            HardeningStep::Encrypt => {
                self.api.put_bucket_encryption(name, &self.encryption).await?;
                Ok(match &self.encryption {
                    BucketEncryption::Aes256 => {
                        "Default AES256 encryption was enabled on the S3 bucket".into()
                    }
                    BucketEncryption::Kms { .. } => {
                        "Default aws:kms encryption was enabled on the S3 bucket".into()
                    }
                })
            }
            HardeningStep::AbortIncompleteUploads => {
                self.api
                    .put_abort_incomplete_uploads_rule(
                        name,
                        ABORT_UPLOADS_RULE_ID,
                        ABORT_UPLOADS_AFTER_DAYS,
                    )
                    .await?;
                Ok("Incomplete multipart uploads are aborted after one day".into())
            }
        }
    }

    async fn empty(&self, name: &str) -> Result<()> {
        self.delete_all_versions(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete_bucket(name).await
    }
}

/// Tags applied to operator owned buckets
pub fn bucket_tags(infra: &Infrastructure) -> BTreeMap<String, String> {
    let name = &infra.infrastructure_name;
    let mut tags = BTreeMap::new();
    if let Some(aws) = &infra.platform_status.aws {
        for tag in &aws.resource_tags {
            tags.insert(tag.key.clone(), tag.value.clone());
        }
    }
    tags.insert(format!("kubernetes.io/cluster/{}", name), "owned".into());
    tags.insert("Name".into(), format!("{}-image-registry", name));
    tags
}

/// Shared credentials file handed to the registry
pub fn shared_credentials_file(credentials: &S3Credentials) -> String {
    format!(
        "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
        credentials.access_key_id, credentials.secret_access_key
    )
}

// =============================================================================
// S3 Driver
// =============================================================================

/// Storage driver for S3 buckets
pub struct S3Driver {
    config: S3Storage,
    ctx: DriverContext,
}

impl S3Driver {
    pub fn new(config: S3Storage, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &S3Storage {
        &self.config
    }

    async fn credentials(&self) -> Result<S3Credentials> {
        CredentialResolver::new(self.ctx.listers.as_ref(), self.ctx.resolver.clone())
            .s3()
            .await
    }

    /// Configured region, else the cluster region, else the default
    async fn region(&self) -> Result<String> {
        if !self.config.region.is_empty() {
            return Ok(self.config.region.clone());
        }
        let infra = self.ctx.listers.infrastructure().await?;
        Ok(infra.aws_region().unwrap_or(DEFAULT_REGION).to_string())
    }

    async fn bucket_ops(&self, infra: &Infrastructure) -> Result<S3BucketOps> {
        let region = self.region().await?;
        let endpoint = S3Endpoint {
            region: region.clone(),
            region_endpoint: self.config.region_endpoint.clone(),
            virtual_hosted_style: self.config.virtual_hosted_style,
        };
        let api = self
            .ctx
            .connectors
            .s3
            .connect(&self.credentials().await?, &endpoint)
            .await?;
        let encryption = if self.config.key_id.is_empty() {
            BucketEncryption::Aes256
        } else {
            BucketEncryption::Kms {
                key_id: self.config.key_id.clone(),
            }
        };

        Ok(S3BucketOps {
            api,
            region,
            tags: bucket_tags(infra),
            encryption,
        })
    }

    fn persist_bucket(&mut self, cr: &mut RegistryStorage, bucket: &str) {
        self.config.bucket = bucket.to_string();
        cr.spec.s3.get_or_insert_with(Default::default).bucket = bucket.to_string();
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn backend(&self) -> StorageBackend {
        StorageBackend::S3
    }

    fn id(&self) -> String {
        self.config.bucket.clone()
    }

    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>> {
        let mut env = vec![
            RegistryEnvVar::literal("REGISTRY_STORAGE", "s3"),
            RegistryEnvVar::literal("REGISTRY_STORAGE_S3_BUCKET", &self.config.bucket),
            RegistryEnvVar::literal("REGISTRY_STORAGE_S3_REGION", self.region().await?),
        ];
        if !self.config.region_endpoint.is_empty() {
            env.push(RegistryEnvVar::literal(
                "REGISTRY_STORAGE_S3_REGIONENDPOINT",
                &self.config.region_endpoint,
            ));
        }
        env.push(RegistryEnvVar::literal(
            "REGISTRY_STORAGE_S3_ENCRYPT",
            self.config.encrypt,
        ));
        if !self.config.key_id.is_empty() {
            env.push(RegistryEnvVar::literal(
                "REGISTRY_STORAGE_S3_KEYID",
                &self.config.key_id,
            ));
        }
        env.push(RegistryEnvVar::literal(
            "REGISTRY_STORAGE_S3_VIRTUALHOSTEDSTYLE",
            self.config.virtual_hosted_style,
        ));
        env.push(RegistryEnvVar::literal(
            "REGISTRY_STORAGE_S3_CREDENTIALSCONFIGPATH",
            format!("{}/{}", CREDENTIALS_MOUNT_PATH, CREDENTIALS_KEY),
        ));

        if let Some(cloud_front) = &self.config.cloud_front {
            let mut options = serde_json::json!({
                "baseurl": cloud_front.base_url,
                "privatekey": format!("{}/{}", CLOUDFRONT_MOUNT_PATH, CLOUDFRONT_KEY_FILE),
                "keypairid": cloud_front.key_pair_id,
            });
            if let Some(duration) = &cloud_front.duration {
                options["duration"] = serde_json::Value::String(duration.clone());
            }
            let middleware = serde_json::json!([{ "name": "cloudfront", "options": options }]);
            env.push(RegistryEnvVar::literal(
                "REGISTRY_MIDDLEWARE_STORAGE",
                serde_json::to_string(&middleware)?,
            ));
        }

        Ok(env)
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let mut volumes = vec![Volume {
            name: CREDENTIALS_VOLUME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PRIVATE_CONFIG_SECRET_NAME.into()),
                items: Some(vec![KeyToPath {
                    key: CREDENTIALS_KEY.into(),
                    path: CREDENTIALS_KEY.into(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: CREDENTIALS_VOLUME.into(),
            mount_path: CREDENTIALS_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        }];

        if let Some(cloud_front) = &self.config.cloud_front {
            volumes.push(Volume {
                name: CLOUDFRONT_VOLUME.into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(cloud_front.private_key.name.clone()),
                    items: Some(vec![KeyToPath {
                        key: cloud_front.private_key.key.clone(),
                        path: CLOUDFRONT_KEY_FILE.into(),
                        mode: None,
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: CLOUDFRONT_VOLUME.into(),
                mount_path: CLOUDFRONT_MOUNT_PATH.into(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Ok((volumes, mounts))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        let credentials = self.credentials().await?;
        Ok(BTreeMap::from([(
            CREDENTIALS_KEY.to_string(),
            shared_credentials_file(&credentials),
        )]))
    }

    async fn storage_exists(&self, cr: &mut RegistryStorage) -> Result<bool> {
        if self.config.bucket.is_empty() {
            return Ok(self.ctx.provisioner.not_configured(&mut cr.status));
        }
        let infra = self.ctx.listers.infrastructure().await?;
        let ops = self.bucket_ops(&infra).await?;
        self.ctx
            .provisioner
            .check_exists(&ops, &self.config.bucket, &mut cr.status)
            .await
    }

    fn storage_changed(&self, cr: &mut RegistryStorage) -> bool {
        let desired = cr.spec.s3.clone();
        let applied = cr.status.storage.s3.clone();
        self.ctx
            .provisioner
            .check_changed(&desired, &applied, &mut cr.status)
    }

    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()> {
        let infra = self.ctx.listers.infrastructure().await?;
        let ops = self.bucket_ops(&infra).await?;
        let provisioner = self.ctx.provisioner.clone();

        let mut bucket = self.config.bucket.clone();
        let region = ops.region.clone();
        let result = provisioner
            .ensure_resource(
                &ops,
                &mut bucket,
                || {
                    generate_storage_name(
                        &infra.infrastructure_name,
                        &[region.as_str()],
                        MAX_BUCKET_NAME_LEN,
                    )
                },
                &mut cr.status,
            )
            .await;
        if !bucket.is_empty() {
            self.persist_bucket(cr, &bucket);
        }
        result?;

        cr.status.storage.s3 = Some(self.config.clone());
        provisioner
            .apply_hardening(&ops, &bucket, &mut cr.status)
            .await
    }

    async fn remove_storage(&mut self, cr: &mut RegistryStorage) -> Result<bool> {
        if !cr.status.is_managed() || self.config.bucket.is_empty() {
            return Ok(false);
        }

        let infra = self.ctx.listers.infrastructure().await?;
        let ops = self.bucket_ops(&infra).await?;
        let removed = self
            .ctx
            .provisioner
            .remove_resource(&ops, &self.config.bucket, &mut cr.status)
            .await?;

        if removed {
            info!("Removed S3 bucket: {}", self.config.bucket);
            self.persist_bucket(cr, "");
            if let Some(applied) = cr.status.storage.s3.as_mut() {
                applied.bucket.clear();
            }
        }
        Ok(false)
    }

    async fn ca_bundle(&self) -> Result<CaBundle> {
        let Some(trusted_ca) = &self.config.trusted_ca else {
            return Ok(CaBundle::system());
        };
        if trusted_ca.name.is_empty() {
            return Ok(CaBundle::system());
        }

        let config_map = self
            .ctx
            .listers
            .config_map(TRUSTED_CA_NAMESPACE, &trusted_ca.name)
            .await?
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "trusted CA config map {}/{} does not exist",
                    TRUSTED_CA_NAMESPACE, trusted_ca.name
                ))
            })?;
        let bundle = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(CA_BUNDLE_KEY))
            .cloned()
            .unwrap_or_default();
        if bundle.is_empty() {
            warn!(
                "Config map {}/{} has no {} key, using the system trust store only",
                TRUSTED_CA_NAMESPACE, trusted_ca.name, CA_BUNDLE_KEY
            );
        }

        Ok(CaBundle {
            bundle,
            use_system_pool: true,
        })
    }
}
