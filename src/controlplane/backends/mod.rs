//! Storage Backend Drivers
//!
//! One driver per backend the registry can store images in:
//! - S3: AWS and S3 compatible object storage
//! - Azure: storage account plus blob container
//! - GCS: Google Cloud Storage bucket with resource manager tags
//! - Swift: OpenStack object storage
//! - Filesystem: emptyDir or persistent volume claim
//!
//! Drivers share a `DriverContext` holding the cluster listers, the
//! credential resolver settings, the provisioner and the client connectors.

pub mod azure;
pub mod filesystem;
pub mod gcs;
pub mod s3;
pub mod swift;

pub use azure::{AzureConnector, AzureDriver, AzureStorageApi, ArmConnector};
pub use filesystem::FilesystemDriver;
pub use gcs::{CloudStorageConnector, GcsApi, GcsConnector, GcsDriver, TagBindingConfig};
pub use s3::{AwsS3Connector, S3Api, S3Connector, S3Driver};
pub use swift::{KeystoneConnector, SwiftApi, SwiftConnector, SwiftDriver};

use crate::controlplane::credentials::ResolverConfig;
use crate::controlplane::provisioner::Provisioner;
use crate::domain::ports::ClusterListersRef;
use std::sync::Arc;

/// Client factories, one per cloud backend
#[derive(Clone)]
pub struct Connectors {
    pub s3: Arc<dyn S3Connector>,
    pub azure: Arc<dyn AzureConnector>,
    pub gcs: Arc<dyn GcsConnector>,
    pub swift: Arc<dyn SwiftConnector>,
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            s3: Arc::new(AwsS3Connector),
            azure: Arc::new(ArmConnector::default()),
            gcs: Arc::new(CloudStorageConnector),
            swift: Arc::new(KeystoneConnector),
        }
    }
}

/// Everything a driver needs besides its own configuration
#[derive(Clone)]
pub struct DriverContext {
    pub listers: ClusterListersRef,
    pub resolver: ResolverConfig,
    pub provisioner: Provisioner,
    pub connectors: Connectors,
    pub tag_binding: TagBindingConfig,
}

impl DriverContext {
    /// Context with production connectors and default timings
    pub fn new(listers: ClusterListersRef) -> Self {
        Self {
            listers,
            resolver: ResolverConfig::default(),
            provisioner: Provisioner::default(),
            connectors: Connectors::default(),
            tag_binding: TagBindingConfig::default(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_connectors(mut self, connectors: Connectors) -> Self {
        self.connectors = connectors;
        self
    }
}
