//! Storage configuration
//!
//! `StorageSpec` is a union over the supported backends: exactly one variant
//! may be set. The same type is stored in the status as the last applied
//! configuration, alongside the management state and conditions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::condition::{Condition, ConditionStatus, ConditionType};

// =============================================================================
// Backend Identity
// =============================================================================

/// Storage backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Azure,
    Gcs,
    Swift,
    Filesystem,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Azure => write!(f, "azure"),
            StorageBackend::Gcs => write!(f, "gcs"),
            StorageBackend::Swift => write!(f, "swift"),
            StorageBackend::Filesystem => write!(f, "filesystem"),
        }
    }
}

// =============================================================================
// Storage Spec
// =============================================================================

/// Desired storage configuration. Exactly one backend must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Amazon S3 (or S3 compatible) bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Storage>,

    /// Azure Blob Storage container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorage>,

    /// Google Cloud Storage bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsStorage>,

    /// OpenStack Swift container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftStorage>,

    /// Local filesystem (emptyDir or persistent volume claim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemStorage>,
}

impl StorageSpec {
    /// Backends that have a configuration block set
    pub fn configured_backends(&self) -> Vec<StorageBackend> {
        let mut backends = Vec::new();
        if self.s3.is_some() {
            backends.push(StorageBackend::S3);
        }
        if self.azure.is_some() {
            backends.push(StorageBackend::Azure);
        }
        if self.gcs.is_some() {
            backends.push(StorageBackend::Gcs);
        }
        if self.swift.is_some() {
            backends.push(StorageBackend::Swift);
        }
        if self.filesystem.is_some() {
            backends.push(StorageBackend::Filesystem);
        }
        backends
    }

    pub fn is_empty(&self) -> bool {
        self.configured_backends().is_empty()
    }
}

/// S3 bucket configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    /// Bucket name. Generated when empty.
    #[serde(default)]
    pub bucket: String,

    /// Bucket region. Defaults to the cluster region.
    #[serde(default)]
    pub region: String,

    /// Endpoint for S3 compatible services
    #[serde(default)]
    pub region_endpoint: String,

    /// Whether the registry stores objects encrypted
    #[serde(default)]
    pub encrypt: bool,

    /// KMS key used for default bucket encryption
    #[serde(default)]
    pub key_id: String,

    /// Use virtual hosted style addressing
    #[serde(default)]
    pub virtual_hosted_style: bool,

    /// Config map holding a CA bundle to trust for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_ca: Option<ConfigMapRef>,

    /// Serve blobs through CloudFront
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_front: Option<CloudFront>,
}

/// CloudFront middleware configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudFront {
    /// Distribution base URL
    pub base_url: String,
    /// Secret holding the signing private key
    pub private_key: SecretKeyRef,
    /// Key pair identifier
    pub key_pair_id: String,
    /// Signed URL lifetime (e.g. "20m")
    #[serde(default)]
    pub duration: Option<String>,
}

/// Reference to a key of a secret in the operator namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Reference to a config map by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    pub name: String,
}

/// Azure Blob Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorage {
    /// Storage account name. Generated when empty.
    #[serde(default)]
    pub account_name: String,

    /// Blob container name. Generated when empty.
    #[serde(default)]
    pub container: String,

    /// Azure cloud environment (e.g. AzurePublicCloud)
    #[serde(default)]
    pub cloud_name: String,
}

/// Google Cloud Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcsStorage {
    /// Bucket name. Generated when empty.
    #[serde(default)]
    pub bucket: String,

    /// Bucket location. Defaults to the cluster region.
    #[serde(default)]
    pub region: String,

    /// Project owning the bucket. Defaults to the cluster project.
    #[serde(default)]
    pub project_id: String,

    /// KMS key used as the bucket default encryption key
    #[serde(default)]
    pub key_id: String,
}

/// OpenStack Swift configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwiftStorage {
    /// Keystone endpoint. Defaults to the clouds.yaml value.
    #[serde(default)]
    pub auth_url: String,

    /// Keystone API version
    #[serde(default)]
    pub auth_version: String,

    /// Container name. Generated when empty.
    #[serde(default)]
    pub container: String,

    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub domain_id: String,

    #[serde(default)]
    pub tenant: String,

    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub region_name: String,
}

/// Filesystem storage. Without a claim source an emptyDir volume is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcStorage>,
}

/// Persistent volume claim source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcStorage {
    /// Claim name. A default claim is created when empty.
    #[serde(default)]
    pub claim: String,
}

// =============================================================================
// Status
// =============================================================================

/// Whether the operator owns the lifecycle of the storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ManagementState {
    /// Created by the operator; hardened and removable
    Managed,
    /// Pre-existing and user owned; never configured or deleted
    Unmanaged,
    /// Removed by the operator
    Removed,
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Removed => write!(f, "Removed"),
        }
    }
}

/// Observed storage state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    /// Ownership of the storage resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_state: Option<ManagementState>,

    /// Last successfully applied configuration
    #[serde(default)]
    pub storage: StorageSpec,

    /// Storage conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl StorageStatus {
    pub fn is_managed(&self) -> bool {
        self.management_state == Some(ManagementState::Managed)
    }

    /// Upsert a condition by type
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        super::condition::upsert(&mut self.conditions, condition_type, status, reason, message);
    }

    /// Find a condition by type
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// The desired and observed storage of one registry, mutated by driver operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStorage {
    pub spec: StorageSpec,
    #[serde(default)]
    pub status: StorageStatus,
}

impl RegistryStorage {
    pub fn new(spec: StorageSpec) -> Self {
        Self {
            spec,
            status: StorageStatus::default(),
        }
    }
}
