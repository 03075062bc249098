//! Storage Control Plane
//!
//! Everything between the outer operator loop and the cloud APIs: credential
//! resolution, resource naming, the shared provisioning state machine, the
//! backend drivers and driver selection.

pub mod backends;
pub mod credentials;
pub mod listers;
pub mod naming;
pub mod provisioner;
pub mod selector;

pub use backends::{Connectors, DriverContext};
pub use credentials::{CredentialResolver, ResolverConfig};
pub use listers::KubeListers;
pub use provisioner::{Provisioner, WaitPolicy};
pub use selector::{infer_driver, platform_default_spec, select_driver};
