//! Storage conditions
//!
//! Conditions are named tri-state facts about the storage. They are upserted
//! by type: created on first observation, updated on every reconcile and
//! only dropped when the whole status is reset.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types reported by the storage drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    StorageExists,
    StorageTagged,
    StorageEncrypted,
    StoragePublicAccessBlocked,
    StorageIncompleteUploadCleanupEnabled,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionType::StorageExists => "StorageExists",
            ConditionType::StorageTagged => "StorageTagged",
            ConditionType::StorageEncrypted => "StorageEncrypted",
            ConditionType::StoragePublicAccessBlocked => "StoragePublicAccessBlocked",
            ConditionType::StorageIncompleteUploadCleanupEnabled => {
                "StorageIncompleteUploadCleanupEnabled"
            }
        };
        write!(f, "{name}")
    }
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition for storage status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status value changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Insert or update the condition of the given type.
///
/// The transition time only moves when the status value changes, so calling
/// this repeatedly with the same outcome leaves the condition untouched.
pub fn upsert(
    conditions: &mut Vec<Condition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) {
    let reason = reason.into();
    let message = message.into();

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.status = status;
            existing.last_transition_time = Some(Utc::now());
        }
        existing.reason = reason;
        existing.message = message;
    } else {
        conditions.push(Condition {
            condition_type,
            status,
            reason,
            message,
            last_transition_time: Some(Utc::now()),
        });
    }
}

/// Condition reasons
pub mod reason {
    pub const STORAGE_NOT_CONFIGURED: &str = "StorageNotConfigured";
    pub const BUCKET_EXISTS: &str = "BucketExists";
    pub const BUCKET_NOT_FOUND: &str = "BucketNotFound";
    pub const CONTAINER_EXISTS: &str = "ContainerExists";
    pub const CONTAINER_NOT_FOUND: &str = "ContainerNotFound";
    pub const CLAIM_EXISTS: &str = "ClaimExists";
    pub const CLAIM_NOT_FOUND: &str = "ClaimNotFound";
    pub const CREATION_SUCCESSFUL: &str = "CreationSuccessful";
    pub const ADOPTED: &str = "Adopted";
    pub const NOT_ACCESSIBLE: &str = "NotAccessible";
    pub const CREATION_FAILED: &str = "CreationFailed";
    pub const CONFIGURATION_CHANGED: &str = "ConfigurationChanged";
    pub const UNKNOWN_ERROR: &str = "Unknown";
    pub const DELETED: &str = "Deleted";
    pub const DELETION_FAILED: &str = "DeletionFailed";
    pub const APPLIED: &str = "Applied";
    pub const FAILED: &str = "Failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_inserts_then_updates() {
        let mut conditions = Vec::new();
        upsert(
            &mut conditions,
            ConditionType::StorageExists,
            ConditionStatus::False,
            reason::BUCKET_NOT_FOUND,
            "missing",
        );
        upsert(
            &mut conditions,
            ConditionType::StorageTagged,
            ConditionStatus::True,
            reason::APPLIED,
            "",
        );
        upsert(
            &mut conditions,
            ConditionType::StorageExists,
            ConditionStatus::True,
            reason::BUCKET_EXISTS,
            "found",
        );

        assert_eq!(conditions.len(), 2);
        let exists = &conditions[0];
        assert_eq!(exists.status, ConditionStatus::True);
        assert_eq!(exists.reason, reason::BUCKET_EXISTS);
        assert_eq!(exists.message, "found");
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut conditions = Vec::new();
        upsert(
            &mut conditions,
            ConditionType::StorageEncrypted,
            ConditionStatus::True,
            reason::APPLIED,
            "AES256",
        );
        let first = conditions[0].last_transition_time;

        upsert(
            &mut conditions,
            ConditionType::StorageEncrypted,
            ConditionStatus::True,
            reason::APPLIED,
            "aws:kms",
        );
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "aws:kms");
    }

    #[test]
    fn test_serialized_type_field() {
        let mut conditions = Vec::new();
        upsert(
            &mut conditions,
            ConditionType::StoragePublicAccessBlocked,
            ConditionStatus::Unknown,
            reason::UNKNOWN_ERROR,
            "",
        );
        let json = serde_json::to_value(&conditions[0]).unwrap();
        assert_eq!(json["type"], "StoragePublicAccessBlocked");
        assert_eq!(json["status"], "Unknown");
    }
}
