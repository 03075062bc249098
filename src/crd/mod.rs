//! Declarative data model shared with the outer operator
//!
//! This module contains the types embedded into the image registry
//! custom resource:
//! - Storage: desired (`StorageSpec`) and observed (`StorageStatus`) backend configuration
//! - Condition: tri-state status facts upserted by type
//! - Infrastructure: platform metadata read from the cluster

pub mod condition;
pub mod infrastructure;
pub mod storage;

pub use condition::*;
pub use infrastructure::*;
pub use storage::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
