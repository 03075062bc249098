//! Domain Ports - Core trait definitions for the storage drivers
//!
//! These traits define the boundaries between the provisioning logic and
//! external systems: the outer operator loop consumes `StorageDriver`, and
//! the drivers read cluster state through `ClusterListers`.

use crate::crd::{Infrastructure, RegistryStorage, StorageBackend};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, EnvVarSource, PersistentVolumeClaim, Secret, SecretKeySelector, Volume,
    VolumeMount,
};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Registry Environment
// =============================================================================

/// Value of an environment variable handed to the registry workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Literal value
    Literal(String),
    /// Reference to a key in a secret
    SecretKey { secret: String, key: String },
}

/// One environment variable of the registry workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl RegistryEnvVar {
    pub fn literal(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.to_string()),
        }
    }

    pub fn secret_key(
        name: impl Into<String>,
        secret: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::SecretKey {
                secret: secret.into(),
                key: key.into(),
            },
        }
    }
}

impl From<&RegistryEnvVar> for EnvVar {
    fn from(var: &RegistryEnvVar) -> Self {
        match &var.value {
            EnvValue::Literal(value) => EnvVar {
                name: var.name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            },
            EnvValue::SecretKey { secret, key } => EnvVar {
                name: var.name.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret.clone()),
                        key: key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }
}

/// Find a variable by name
pub fn find_env<'a>(vars: &'a [RegistryEnvVar], name: &str) -> Option<&'a EnvValue> {
    vars.iter().find(|v| v.name == name).map(|v| &v.value)
}

/// CA bundle the registry should trust when talking to the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaBundle {
    /// PEM bundle, empty when no custom CA is configured
    pub bundle: String,
    /// Whether the system trust store should be used in addition to the bundle
    pub use_system_pool: bool,
}

impl CaBundle {
    pub fn system() -> Self {
        Self {
            bundle: String::new(),
            use_system_pool: true,
        }
    }
}

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Contract every storage backend implements for the outer operator loop.
///
/// Operations are level triggered: each may be called any number of times
/// and must converge on the same observed state.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Backend implemented by this driver
    fn backend(&self) -> StorageBackend;

    /// Identifier of the backing resource (bucket, container or claim name)
    fn id(&self) -> String;

    /// Environment variables configuring the registry for this backend
    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>>;

    /// Volumes and mounts the registry pod needs
    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)>;

    /// Content of the generated private configuration secret
    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>>;

    /// Whether the backing resource exists
    async fn storage_exists(&self, cr: &mut RegistryStorage) -> Result<bool>;

    /// Whether the desired configuration differs from the last applied one
    fn storage_changed(&self, cr: &mut RegistryStorage) -> bool;

    /// Create or adopt the backing resource and apply hardening
    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()>;

    /// Remove the backing resource if the operator owns it.
    ///
    /// The returned flag asks the caller for another removal pass. It is
    /// `Ok(false)` once the resource is gone or when there was nothing the
    /// operator owns. Errors carry the retry signal through
    /// `Error::is_retryable`.
    async fn remove_storage(&mut self, cr: &mut RegistryStorage) -> Result<bool>;

    /// Custom CA bundle for the backend endpoint
    async fn ca_bundle(&self) -> Result<CaBundle>;
}

// =============================================================================
// Cluster Listers Port
// =============================================================================

/// Read access to cluster objects plus the claim operations of the
/// filesystem driver
#[async_trait]
pub trait ClusterListers: Send + Sync {
    /// Get a secret, `None` when it does not exist
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Get a config map, `None` when it does not exist
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Status of the cluster infrastructure object
    async fn infrastructure(&self) -> Result<Infrastructure>;

    /// Get a persistent volume claim, `None` when it does not exist
    async fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a persistent volume claim
    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<()>;

    /// Delete a persistent volume claim. Returns `false` if it was already gone.
    async fn delete_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterListersRef = Arc<dyn ClusterListers>;
pub type StorageDriverBox = Box<dyn StorageDriver>;
