//! Cluster infrastructure metadata
//!
//! Mirrors the parts of the cluster `Infrastructure` object the storage
//! drivers consume: the infrastructure name used to derive resource names,
//! and the platform status holding region, tags and cloud identifiers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cloud platform the cluster runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PlatformType {
    AWS,
    Azure,
    GCP,
    OpenStack,
    BareMetal,
    VSphere,
    #[default]
    None,
    #[serde(other)]
    Other,
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformType::AWS => write!(f, "AWS"),
            PlatformType::Azure => write!(f, "Azure"),
            PlatformType::GCP => write!(f, "GCP"),
            PlatformType::OpenStack => write!(f, "OpenStack"),
            PlatformType::BareMetal => write!(f, "BareMetal"),
            PlatformType::VSphere => write!(f, "VSphere"),
            PlatformType::None => write!(f, "None"),
            PlatformType::Other => write!(f, "Other"),
        }
    }
}

/// Status of the cluster `Infrastructure` object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    /// Unique, human friendly cluster identifier
    #[serde(default)]
    pub infrastructure_name: String,

    #[serde(default)]
    pub platform_status: PlatformStatus,
}

/// Platform specific status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(rename = "type", default)]
    pub platform: PlatformType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatformStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzurePlatformStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpPlatformStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackPlatformStatus>,
}

/// A user defined key/value tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatformStatus {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub resource_tags: Vec<ResourceTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatformStatus {
    #[serde(default)]
    pub resource_group_name: String,
    #[serde(default)]
    pub cloud_name: String,
    #[serde(default)]
    pub resource_tags: Vec<ResourceTag>,
}

/// GCP tag attached through the Resource Manager tag bindings API
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpResourceTag {
    /// Organization or project id owning the tag key
    pub parent_id: String,
    pub key: String,
    pub value: String,
}

impl GcpResourceTag {
    /// `{parentID}/{key}/{value}` form accepted by the tag bindings API
    pub fn namespaced_value(&self) -> String {
        format!("{}/{}/{}", self.parent_id, self.key, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatformStatus {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub resource_labels: Vec<ResourceTag>,
    #[serde(default)]
    pub resource_tags: Vec<GcpResourceTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackPlatformStatus {
    #[serde(default)]
    pub cloud_name: String,
}

impl Infrastructure {
    pub fn platform(&self) -> PlatformType {
        self.platform_status.platform
    }

    pub fn aws_region(&self) -> Option<&str> {
        self.platform_status
            .aws
            .as_ref()
            .map(|a| a.region.as_str())
            .filter(|r| !r.is_empty())
    }

    pub fn gcp_region(&self) -> Option<&str> {
        self.platform_status
            .gcp
            .as_ref()
            .map(|g| g.region.as_str())
            .filter(|r| !r.is_empty())
    }

    pub fn gcp_project(&self) -> Option<&str> {
        self.platform_status
            .gcp
            .as_ref()
            .map(|g| g.project_id.as_str())
            .filter(|p| !p.is_empty())
    }
}
