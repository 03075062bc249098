//! Filesystem Storage Driver
//!
//! Serves the registry from a local volume. Without a claim source the pod
//! gets an emptyDir that lives and dies with it. With a claim source the
//! registry mounts a persistent volume claim in the operator namespace; a
//! default claim is created (and owned) when no claim name is given.

use super::DriverContext;
use crate::controlplane::credentials::OPERATOR_NAMESPACE;
use crate::controlplane::provisioner::{
    CreateOutcome, Presence, PresenceReasons, ResourceOps, CLAIM_REASONS,
};
use crate::crd::{
    ConditionStatus, ConditionType, FilesystemStorage, ManagementState, PvcStorage,
    RegistryStorage, StorageBackend,
};
use crate::domain::ports::{CaBundle, ClusterListersRef, RegistryEnvVar, StorageDriver};
use crate::error::{Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Claim created when none is named
pub const DEFAULT_CLAIM_NAME: &str = "image-registry-storage";

/// Requested size of the default claim
pub const DEFAULT_CLAIM_SIZE: &str = "100Gi";

/// Where the registry keeps its data
pub const ROOT_DIRECTORY: &str = "/registry";

/// Marks claims created by the operator
pub const OWNER_ANNOTATION: &str = "imageregistry.openshift.io/storage-owner";
const OWNER_VALUE: &str = "registry-storage-operator";

const STORAGE_VOLUME: &str = "registry-storage";
const EMPTY_DIR_REASON: &str = "EmptyDir";

// =============================================================================
// Claim Operations
// =============================================================================

fn default_claim(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(OPERATOR_NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                OWNER_ANNOTATION.to_string(),
                OWNER_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(DEFAULT_CLAIM_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_operator_owned(claim: &PersistentVolumeClaim) -> bool {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .is_some_and(|v| v == OWNER_VALUE)
}

/// `ResourceOps` strategy for persistent volume claims in the operator namespace
pub struct ClaimOps {
    listers: ClusterListersRef,
}

#[async_trait]
impl ResourceOps for ClaimOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Filesystem
    }

    fn kind(&self) -> &'static str {
        "claim"
    }

    fn reasons(&self) -> PresenceReasons {
        CLAIM_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        let claim = self
            .listers
            .persistent_volume_claim(OPERATOR_NAMESPACE, name)
            .await?;
        Ok(match claim {
            Some(_) => Presence::Present,
            None => Presence::Absent,
        })
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        info!("Creating claim {}/{}", OPERATOR_NAMESPACE, name);
        match self
            .listers
            .create_persistent_volume_claim(OPERATOR_NAMESPACE, &default_claim(name))
            .await
        {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(e) if e.is_conflict() || e.is_already_exists() => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self
            .listers
            .delete_persistent_volume_claim(OPERATOR_NAMESPACE, name)
            .await?
        {
            return Ok(());
        }
        Err(Error::provider(
            StorageBackend::Filesystem,
            "delete-claim",
            name,
            ProviderErrorKind::NotFound,
            "claim does not exist",
        ))
    }
}

// =============================================================================
// Filesystem Driver
// =============================================================================

/// Storage driver for emptyDir and persistent volume claim storage
pub struct FilesystemDriver {
    config: FilesystemStorage,
    ctx: DriverContext,
}

impl FilesystemDriver {
    pub fn new(config: FilesystemStorage, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &FilesystemStorage {
        &self.config
    }

    fn claim(&self) -> Option<&PvcStorage> {
        self.config.persistent_volume_claim.as_ref()
    }

    fn claim_ops(&self) -> ClaimOps {
        ClaimOps {
            listers: self.ctx.listers.clone(),
        }
    }

    fn persist(&self, cr: &mut RegistryStorage) {
        cr.spec.filesystem = Some(self.config.clone());
    }

    /// A default claim left behind by an earlier run is still ours
    async fn reclaim_default(&self, cr: &mut RegistryStorage) -> Result<()> {
        if cr.status.management_state.is_some() {
            return Ok(());
        }
        let existing = self
            .ctx
            .listers
            .persistent_volume_claim(OPERATOR_NAMESPACE, DEFAULT_CLAIM_NAME)
            .await?;
        if existing.as_ref().is_some_and(is_operator_owned) {
            debug!("Default claim {} carries the owner annotation", DEFAULT_CLAIM_NAME);
            cr.status.management_state = Some(ManagementState::Managed);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Filesystem
    }

    fn id(&self) -> String {
        self.claim().map(|c| c.claim.clone()).unwrap_or_default()
    }

    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>> {
        Ok(vec![
            RegistryEnvVar::literal("REGISTRY_STORAGE", "filesystem"),
            RegistryEnvVar::literal("REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY", ROOT_DIRECTORY),
        ])
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let mut volume = Volume {
            name: STORAGE_VOLUME.into(),
            ..Default::default()
        };
        match self.claim() {
            Some(pvc) => {
                let claim_name = if pvc.claim.is_empty() {
                    DEFAULT_CLAIM_NAME.to_string()
                } else {
                    pvc.claim.clone()
                };
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: None,
                });
            }
            None => volume.empty_dir = Some(EmptyDirVolumeSource::default()),
        }
        let mount = VolumeMount {
            name: STORAGE_VOLUME.into(),
            mount_path: ROOT_DIRECTORY.into(),
            ..Default::default()
        };
        Ok((vec![volume], vec![mount]))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn storage_exists(&self, cr: &mut RegistryStorage) -> Result<bool> {
        let Some(pvc) = self.claim() else {
            cr.status.set_condition(
                ConditionType::StorageExists,
                ConditionStatus::True,
                EMPTY_DIR_REASON,
                "emptyDir storage is always available",
            );
            return Ok(true);
        };
        self.ctx
            .provisioner
            .check_exists(&self.claim_ops(), &pvc.claim, &mut cr.status)
            .await
    }

    fn storage_changed(&self, cr: &mut RegistryStorage) -> bool {
        let desired = cr.spec.filesystem.clone();
        let applied = cr.status.storage.filesystem.clone();
        self.ctx
            .provisioner
            .check_changed(&desired, &applied, &mut cr.status)
    }

    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()> {
        let Some(pvc) = self.claim().cloned() else {
            cr.status.set_condition(
                ConditionType::StorageExists,
                ConditionStatus::True,
                EMPTY_DIR_REASON,
                "emptyDir storage is always available",
            );
            cr.status.storage.filesystem = Some(self.config.clone());
            return Ok(());
        };

        let mut claim = pvc.claim;
        if claim.is_empty() {
            self.reclaim_default(cr).await?;
            claim = DEFAULT_CLAIM_NAME.to_string();
        }

        let ops = self.claim_ops();
        let result = self
            .ctx
            .provisioner
            .ensure_resource(
                &ops,
                &mut claim,
                || Ok(DEFAULT_CLAIM_NAME.to_string()),
                &mut cr.status,
            )
            .await;
        self.config.persistent_volume_claim = Some(PvcStorage { claim });
        self.persist(cr);
        result?;

        cr.status.storage.filesystem = Some(self.config.clone());
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut RegistryStorage) -> Result<bool> {
        let claim = self.id();
        if !cr.status.is_managed() || claim.is_empty() {
            return Ok(false);
        }

        let removed = self
            .ctx
            .provisioner
            .remove_resource(&self.claim_ops(), &claim, &mut cr.status)
            .await?;
        if removed {
            info!("Removed claim {}/{}", OPERATOR_NAMESPACE, claim);
            self.config.persistent_volume_claim = Some(PvcStorage::default());
            self.persist(cr);
            if let Some(applied) = cr.status.storage.filesystem.as_mut() {
                applied.persistent_volume_claim = Some(PvcStorage::default());
            }
        }
        Ok(false)
    }

    async fn ca_bundle(&self) -> Result<CaBundle> {
        Ok(CaBundle::system())
    }
}
