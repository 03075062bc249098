//! Registry Storage Operator - Storage Drivers
//!
//! Provisions and tears down the object storage an in-cluster container
//! image registry keeps its layers in, and renders the registry
//! configuration that points at it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Outer operator reconcile loop                         │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Driver Selector │  │   Credential    │  │       Name Generator        │  │
//! │  │                 │  │    Resolver     │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │      Provisioner      │                                │
//! │                    │ (shared state machine)│                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Storage Drivers                                 │
//! │  ┌────────┐  ┌──────────┐  ┌────────────────┐  ┌─────────┐  ┌────────────┐  │
//! │  │   S3   │  │  Azure   │  │  GCS (+tags)   │  │  Swift  │  │ Filesystem │  │
//! │  └────────┘  └──────────┘  └────────────────┘  └─────────┘  └────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                    Blob migration engine (move-blobs)                        │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Drivers, provisioner, credentials and selection
//! - [`crd`]: Storage spec/status, conditions and infrastructure types
//! - [`domain`]: Driver and cluster lister ports
//! - [`migration`]: Prefix to prefix blob moves within one container
//! - [`metrics`]: Prometheus instrumentation of cloud operations
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod migration;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use controlplane::{
    infer_driver, platform_default_spec, select_driver, Connectors, CredentialResolver,
    DriverContext, KubeListers, Provisioner, ResolverConfig, WaitPolicy,
};

pub use crd::{
    Condition, ConditionStatus, ConditionType, Infrastructure, ManagementState, PlatformType,
    RegistryStorage, StorageBackend, StorageSpec, StorageStatus,
};

pub use domain::ports::{
    CaBundle, ClusterListers, ClusterListersRef, EnvValue, RegistryEnvVar, StorageDriver,
    StorageDriverBox,
};

pub use error::{AggregateError, Error, ErrorAction, ProviderErrorKind, Result};

pub use metrics::Metrics;

pub use migration::{BlobContainer, BlobMigration, MigrationConfig, MigrationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
