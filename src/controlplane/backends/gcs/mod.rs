//! Google Cloud Storage Driver
//!
//! Provisions a GCS bucket with uniform bucket-level access. Buckets the
//! operator creates get public access prevention enforced, cluster ownership
//! labels plus bound resource manager tags, and the configured KMS key as
//! their default encryption key.

#[cfg(feature = "gcp")]
mod client;
pub mod tags;

#[cfg(feature = "gcp")]
pub use client::GcsClient;
pub use tags::{
    bucket_resource_name, BearerTokenSource, RestTagBindingClient, TagBinder, TagBindingApi,
    TagBindingConfig,
};

use super::DriverContext;
use crate::controlplane::credentials::{
    CredentialResolver, GcsCredentials, PRIVATE_CONFIG_SECRET_NAME,
};
use crate::controlplane::naming::{generate_storage_name, MAX_BUCKET_NAME_LEN};
use crate::controlplane::provisioner::{
    CreateOutcome, HardeningStep, Presence, PresenceReasons, ResourceOps, BUCKET_REASONS,
};
use crate::crd::{GcpResourceTag, GcsStorage, Infrastructure, RegistryStorage, StorageBackend};
use crate::domain::ports::{CaBundle, RegistryEnvVar, StorageDriver};
use crate::error::{AggregateError, Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume, VolumeMount};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Key of the service account key file in the private configuration secret
pub const KEYFILE_KEY: &str = "keyfile";

/// Location used when neither the config nor the cluster provide one
pub const DEFAULT_LOCATION: &str = "us-central1";

const KEYFILE_VOLUME: &str = "registry-storage-keyfile";
const KEYFILE_MOUNT_PATH: &str = "/gcs";

// =============================================================================
// GCS API Port
// =============================================================================

/// One page of object names
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub names: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Bucket level GCS operations used by the driver
#[async_trait]
pub trait GcsApi: Send + Sync {
    async fn bucket_presence(&self, bucket: &str) -> Result<Presence>;

    /// Create a bucket with uniform bucket-level access
    async fn create_bucket(&self, project: &str, bucket: &str, location: &str)
        -> Result<CreateOutcome>;

    async fn enforce_public_access_prevention(&self, bucket: &str) -> Result<()>;

    async fn set_labels(&self, bucket: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    async fn set_default_kms_key(&self, bucket: &str, key: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str, page_token: Option<String>)
        -> Result<ObjectPage>;

    async fn delete_object(&self, bucket: &str, name: &str) -> Result<()>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

/// Storage and tag binding clients sharing one set of credentials
#[derive(Clone)]
pub struct GcsClients {
    pub storage: Arc<dyn GcsApi>,
    pub tags: Arc<dyn TagBindingApi>,
}

/// Builds GCS clients from freshly resolved credentials
#[async_trait]
pub trait GcsConnector: Send + Sync {
    async fn connect(&self, credentials: &GcsCredentials, location: &str) -> Result<GcsClients>;
}

/// Connector backed by `google-cloud-storage`
#[derive(Debug, Clone, Default)]
pub struct CloudStorageConnector;

#[async_trait]
impl GcsConnector for CloudStorageConnector {
    #[cfg(feature = "gcp")]
    async fn connect(&self, credentials: &GcsCredentials, location: &str) -> Result<GcsClients> {
        let client = Arc::new(GcsClient::new(credentials).await?);
        let tags = RestTagBindingClient::new(location, client.clone())?;
        Ok(GcsClients {
            storage: client,
            tags: Arc::new(tags),
        })
    }

    #[cfg(not(feature = "gcp"))]
    async fn connect(&self, _credentials: &GcsCredentials, _location: &str) -> Result<GcsClients> {
        Err(Error::BackendUnavailable {
            backend: StorageBackend::Gcs,
            reason: "built without the `gcp` feature".into(),
        })
    }
}

// =============================================================================
// Bucket Operations
// =============================================================================

/// `ResourceOps` strategy for GCS buckets
pub struct GcsBucketOps {
    clients: GcsClients,
    project: String,
    location: String,
    labels: BTreeMap<String, String>,
    resource_tags: Vec<GcpResourceTag>,
    kms_key: String,
    tag_binding: TagBindingConfig,
}

impl GcsBucketOps {
    async fn delete_all_objects(&self, bucket: &str) -> Result<()> {
        let mut failures = AggregateError::new();
        let mut page_token = None;
        let mut deleted = 0usize;

        loop {
            let page = self.clients.storage.list_objects(bucket, page_token).await?;
            for name in &page.names {
                match self.clients.storage.delete_object(bucket, name).await {
                    Ok(()) => deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => failures.record("delete-object", &format!("{}/{}", bucket, name), &e),
                }
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Deleted {} objects from bucket {}", deleted, bucket);
        failures.into_result()
    }
}

#[async_trait]
impl ResourceOps for GcsBucketOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Gcs
    }

    fn kind(&self) -> &'static str {
        "bucket"
    }

    fn reasons(&self) -> PresenceReasons {
        BUCKET_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.clients.storage.bucket_presence(name).await
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        info!("Creating GCS bucket: {} ({})", name, self.location);
        self.clients
            .storage
            .create_bucket(&self.project, name, &self.location)
            .await
    }

    fn hardening_steps(&self) -> Vec<HardeningStep> {
        vec![
            HardeningStep::BlockPublicAccess,
            HardeningStep::Tag,
            HardeningStep::Encrypt,
        ]
    }

    async fn harden(&self, name: &str, step: HardeningStep) -> Result<String> {
        match step {
            HardeningStep::BlockPublicAccess => {
                self.clients
                    .storage
                    .enforce_public_access_prevention(name)
                    .await?;
                Ok("Public access prevention is enforced on the GCS bucket".into())
            }
            HardeningStep::Tag => {
                self.clients.storage.set_labels(name, &self.labels).await?;
                if self.resource_tags.is_empty() {
                    return Ok(format!(
                        "Labels were applied to the GCS bucket: {}",
                        self.labels.len()
                    ));
                }
                let binder = TagBinder::new(self.clients.tags.clone(), self.tag_binding.clone());
                let bound = binder
                    .bind(&bucket_resource_name(name), &self.resource_tags)
                    .await?;
                Ok(format!(
                    "Labels were applied and {} new tag(s) bound to the GCS bucket",
                    bound.len()
                ))
            }
            HardeningStep::Encrypt => {
                if self.kms_key.is_empty() {
                    return Ok("The GCS bucket uses Google-managed encryption keys".into());
                }
                self.clients
                    .storage
                    .set_default_kms_key(name, &self.kms_key)
                    .await?;
                Ok("Default KMS key was set on the GCS bucket".into())
            }
            other => Err(Error::Internal(format!(
                "unsupported GCS hardening step {}",
                other
            ))),
        }
    }

    async fn empty(&self, name: &str) -> Result<()> {
        self.delete_all_objects(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.clients.storage.delete_bucket(name).await
    }
}

/// Labels applied to operator owned buckets
pub fn bucket_labels(infra: &Infrastructure) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(gcp) = &infra.platform_status.gcp {
        for label in &gcp.resource_labels {
            labels.insert(label.key.clone(), label.value.clone());
        }
    }
    labels.insert(
        format!("kubernetes-io-cluster-{}", infra.infrastructure_name),
        "owned".into(),
    );
    labels
}

// =============================================================================
// GCS Driver
// =============================================================================

/// Storage driver for Google Cloud Storage
pub struct GcsDriver {
    config: GcsStorage,
    ctx: DriverContext,
}

impl GcsDriver {
    pub fn new(config: GcsStorage, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &GcsStorage {
        &self.config
    }

    async fn credentials(&self) -> Result<GcsCredentials> {
        CredentialResolver::new(self.ctx.listers.as_ref(), self.ctx.resolver.clone())
            .gcs()
            .await
    }

    fn location(&self, infra: &Infrastructure) -> String {
        if !self.config.region.is_empty() {
            return self.config.region.clone();
        }
        infra.gcp_region().unwrap_or(DEFAULT_LOCATION).to_string()
    }

    /// Configured project, else the cluster project, else the key file's
    fn project(&self, infra: &Infrastructure, credentials: &GcsCredentials) -> Result<String> {
        if !self.config.project_id.is_empty() {
            return Ok(self.config.project_id.clone());
        }
        if let Some(project) = infra.gcp_project() {
            return Ok(project.to_string());
        }
        credentials.project_id().ok_or_else(|| {
            Error::Configuration("no GCP project id configured or discoverable".into())
        })
    }

    async fn bucket_ops(&self, infra: &Infrastructure) -> Result<GcsBucketOps> {
        let credentials = self.credentials().await?;
        let location = self.location(infra);
        let project = self.project(infra, &credentials)?;
        let clients = self
            .ctx
            .connectors
            .gcs
            .connect(&credentials, &location)
            .await?;

        Ok(GcsBucketOps {
            clients,
            project,
            location,
            labels: bucket_labels(infra),
            resource_tags: infra
                .platform_status
                .gcp
                .as_ref()
                .map(|g| g.resource_tags.clone())
                .unwrap_or_default(),
            kms_key: self.config.key_id.clone(),
            tag_binding: self.ctx.tag_binding.clone(),
        })
    }

    fn persist_bucket(&mut self, cr: &mut RegistryStorage, bucket: &str) {
        self.config.bucket = bucket.to_string();
        cr.spec.gcs.get_or_insert_with(Default::default).bucket = bucket.to_string();
    }
}

#[async_trait]
impl StorageDriver for GcsDriver {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Gcs
    }

    fn id(&self) -> String {
        self.config.bucket.clone()
    }

    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>> {
        Ok(vec![
            RegistryEnvVar::literal("REGISTRY_STORAGE", "gcs"),
            RegistryEnvVar::literal("REGISTRY_STORAGE_GCS_BUCKET", &self.config.bucket),
            RegistryEnvVar::literal(
                "REGISTRY_STORAGE_GCS_KEYFILE",
                format!("{}/{}", KEYFILE_MOUNT_PATH, KEYFILE_KEY),
            ),
        ])
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let volume = Volume {
            name: KEYFILE_VOLUME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PRIVATE_CONFIG_SECRET_NAME.into()),
                items: Some(vec![KeyToPath {
                    key: KEYFILE_KEY.into(),
                    path: KEYFILE_KEY.into(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: KEYFILE_VOLUME.into(),
            mount_path: KEYFILE_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        };
        Ok((vec![volume], vec![mount]))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        let credentials = self.credentials().await?;
        Ok(BTreeMap::from([(
            KEYFILE_KEY.to_string(),
            credentials.key_file_json,
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
        let desired = cr.spec.gcs.clone();
        let applied = cr.status.storage.gcs.clone();
        self.ctx
            .provisioner
            .check_changed(&desired, &applied, &mut cr.status)
    }

    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()> {
        let infra = self.ctx.listers.infrastructure().await?;
        let ops = self.bucket_ops(&infra).await?;
        let provisioner = self.ctx.provisioner.clone();

        let mut bucket = self.config.bucket.clone();
        let result = provisioner
            .ensure_resource(
                &ops,
                &mut bucket,
                || generate_storage_name(&infra.infrastructure_name, &[], MAX_BUCKET_NAME_LEN),
                &mut cr.status,
            )
            .await;
        if !bucket.is_empty() {
            self.persist_bucket(cr, &bucket);
        }
        result?;

        if self.config.project_id.is_empty() {
            self.config.project_id = ops.project.clone();
            cr.spec.gcs.get_or_insert_with(Default::default).project_id = ops.project.clone();
        }
        if self.config.region.is_empty() {
            self.config.region = ops.location.clone();
            cr.spec.gcs.get_or_insert_with(Default::default).region = ops.location.clone();
        }

        cr.status.storage.gcs = Some(self.config.clone());
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
            info!("Removed GCS bucket: {}", self.config.bucket);
            self.persist_bucket(cr, "");
            if let Some(applied) = cr.status.storage.gcs.as_mut() {
                applied.bucket.clear();
            }
        }
        Ok(false)
    }

    async fn ca_bundle(&self) -> Result<CaBundle> {
        Ok(CaBundle::system())
    }
}
