//! Azure cloud environments

use crate::error::{Error, Result};

/// Endpoints of one Azure cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AzureEnvironment {
    pub name: &'static str,
    pub resource_manager: &'static str,
    pub active_directory: &'static str,
    pub storage_suffix: &'static str,
}

impl AzureEnvironment {
    pub const PUBLIC: AzureEnvironment = AzureEnvironment {
        name: "AzurePublicCloud",
        resource_manager: "https://management.azure.com",
        active_directory: "https://login.microsoftonline.com",
        storage_suffix: "core.windows.net",
    };

    pub const US_GOVERNMENT: AzureEnvironment = AzureEnvironment {
        name: "AzureUSGovernmentCloud",
        resource_manager: "https://management.usgovcloudapi.net",
        active_directory: "https://login.microsoftonline.us",
        storage_suffix: "core.usgovcloudapi.net",
    };

    pub const CHINA: AzureEnvironment = AzureEnvironment {
        name: "AzureChinaCloud",
        resource_manager: "https://management.chinacloudapi.cn",
        active_directory: "https://login.chinacloudapi.cn",
        storage_suffix: "core.chinacloudapi.cn",
    };

    /// Look up a cloud by name. An empty name means the public cloud.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "azurepubliccloud" | "azurecloud" | "public" => Ok(Self::PUBLIC),
            "azureusgovernmentcloud" | "azureusgovernment" | "usgovernment" => {
                Ok(Self::US_GOVERNMENT)
            }
            "azurechinacloud" | "china" => Ok(Self::CHINA),
            _ => Err(Error::Configuration(format!(
                "unknown Azure cloud environment {:?}",
                name
            ))),
        }
    }

    /// OAuth scope for Resource Manager tokens
    pub fn management_scope(&self) -> String {
        format!("{}/.default", self.resource_manager)
    }

    /// OAuth scope for blob data plane tokens, shared by all clouds
    pub fn storage_scope(&self) -> String {
        "https://storage.azure.com/.default".to_string()
    }

    /// Blob endpoint of a storage account
    pub fn blob_endpoint(&self, account: &str) -> String {
        format!("https://{}.blob.{}", account, self.storage_suffix)
    }
}

impl Default for AzureEnvironment {
    fn default() -> Self {
        Self::PUBLIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(AzureEnvironment::from_name("").unwrap(), AzureEnvironment::PUBLIC);
        assert_eq!(
            AzureEnvironment::from_name("AzureChinaCloud").unwrap(),
            AzureEnvironment::CHINA
        );
        assert_eq!(
            AzureEnvironment::from_name("AzureUSGovernmentCloud")
                .unwrap()
                .storage_suffix,
            "core.usgovcloudapi.net"
        );
        assert!(AzureEnvironment::from_name("AzureGermanCloud").is_err());
    }

    #[test]
    fn test_endpoints() {
        let env = AzureEnvironment::PUBLIC;
        assert_eq!(env.blob_endpoint("acct"), "https://acct.blob.core.windows.net");
        assert_eq!(env.management_scope(), "https://management.azure.com/.default");
        assert_eq!(env.storage_scope(), "https://storage.azure.com/.default");
    }
}
