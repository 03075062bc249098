//! Azure Blob Storage Driver
//!
//! Provisions a storage account and a blob container through Azure Resource
//! Manager. The operator owns the storage only when it created the account;
//! a container created inside a user supplied account stays user owned.

mod client;
mod environment;

#[cfg(feature = "azure")]
pub mod blob;

pub use client::{ArmConnector, ArmConfig, ArmStorageClient, OAuthClient};
pub use environment::AzureEnvironment;

use super::DriverContext;
use crate::controlplane::credentials::{
    keys, AzureCredentials, CredentialResolver, PRIVATE_CONFIG_SECRET_NAME,
};
use crate::controlplane::naming::{
    generate_account_name, generate_storage_name, MAX_CONTAINER_NAME_LEN,
};
use crate::controlplane::provisioner::{
    CreateOutcome, HardeningStep, Presence, PresenceReasons, ResourceOps, BUCKET_REASONS,
    CONTAINER_REASONS,
};
use crate::crd::{AzureStorage, Infrastructure, RegistryStorage, StorageBackend};
use crate::domain::ports::{CaBundle, RegistryEnvVar, StorageDriver};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Volume, VolumeMount};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Azure Storage API Port
// =============================================================================

/// Properties of a storage account the operator creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountParams {
    pub location: String,
    pub tags: BTreeMap<String, String>,
}

/// Storage account and container management operations
#[async_trait]
pub trait AzureStorageApi: Send + Sync {
    async fn account_presence(&self, account: &str) -> Result<Presence>;

    /// Create an account, waiting for the long running operation to finish.
    /// A globally taken name reports `AlreadyExists`.
    async fn create_account(&self, account: &str, params: &AccountParams)
        -> Result<CreateOutcome>;

    /// Update account tags
    async fn update_account_tags(&self, account: &str, tags: &BTreeMap<String, String>)
        -> Result<()>;

    /// Disallow anonymous blob access on the account
    async fn disable_public_access(&self, account: &str) -> Result<()>;

    async fn delete_account(&self, account: &str) -> Result<()>;

    /// Primary access key of the account
    async fn account_key(&self, account: &str) -> Result<String>;

    async fn container_presence(&self, account: &str, container: &str) -> Result<Presence>;

    async fn create_container(&self, account: &str, container: &str) -> Result<CreateOutcome>;

    async fn delete_container(&self, account: &str, container: &str) -> Result<()>;
}

/// Builds management clients from freshly resolved credentials
#[async_trait]
pub trait AzureConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &AzureCredentials,
        environment: &AzureEnvironment,
    ) -> Result<Arc<dyn AzureStorageApi>>;
}

// =============================================================================
// Account and Container Operations
// =============================================================================

/// `ResourceOps` strategy for storage accounts.
///
/// Emptying an account deletes the registry container in it.
pub struct AzureAccountOps {
    api: Arc<dyn AzureStorageApi>,
    params: AccountParams,
    container: String,
}

#[async_trait]
impl ResourceOps for AzureAccountOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Azure
    }

    fn kind(&self) -> &'static str {
        "storage account"
    }

    fn reasons(&self) -> PresenceReasons {
        BUCKET_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.api.account_presence(name).await
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        info!(
            "Creating Azure storage account: {} ({})",
            name, self.params.location
        );
        self.api.create_account(name, &self.params).await
    }

    fn hardening_steps(&self) -> Vec<HardeningStep> {
        vec![HardeningStep::BlockPublicAccess, HardeningStep::Tag]
    }

    async fn harden(&self, name: &str, step: HardeningStep) -> Result<String> {
        match step {
            HardeningStep::BlockPublicAccess => {
                self.api.disable_public_access(name).await?;
                Ok("Public blob access is disabled on the storage account".into())
            }
            HardeningStep::Tag => {
                self.api.update_account_tags(name, &self.params.tags).await?;
                Ok(format!(
                    "Tags were applied to the storage account: {}",
                    self.params.tags.len()
                ))
            }
            other => Err(Error::Internal(format!(
                "unsupported Azure hardening step {}",
                other
            ))),
        }
    }

    async fn empty(&self, name: &str) -> Result<()> {
        if self.container.is_empty() {
            return Ok(());
        }
        match self.api.delete_container(name, &self.container).await {
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone from {}", self.container, name);
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete_account(name).await
    }
}

/// `ResourceOps` strategy for blob containers inside one account
pub struct AzureContainerOps {
    api: Arc<dyn AzureStorageApi>,
    account: String,
}

#[async_trait]
impl ResourceOps for AzureContainerOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Azure
    }

    fn kind(&self) -> &'static str {
        "container"
    }

    fn reasons(&self) -> PresenceReasons {
        CONTAINER_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.api.container_presence(&self.account, name).await
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        self.api.create_container(&self.account, name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete_container(&self.account, name).await
    }
}

/// Tags applied to operator owned storage accounts
pub fn account_tags(infra: &Infrastructure) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    if let Some(azure) = &infra.platform_status.azure {
        for tag in &azure.resource_tags {
            tags.insert(tag.key.clone(), tag.value.clone());
        }
    }
    tags.insert(
        format!("kubernetes.io_cluster.{}", infra.infrastructure_name),
        "owned".into(),
    );
    tags
}

// =============================================================================
// Azure Driver
// =============================================================================

/// Storage driver for Azure Blob Storage
pub struct AzureDriver {
    config: AzureStorage,
    ctx: DriverContext,
}

impl AzureDriver {
    pub fn new(config: AzureStorage, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &AzureStorage {
        &self.config
    }

    async fn credentials(&self) -> Result<AzureCredentials> {
        CredentialResolver::new(self.ctx.listers.as_ref(), self.ctx.resolver.clone())
            .azure()
            .await
    }

    async fn environment(&self) -> Result<AzureEnvironment> {
        if !self.config.cloud_name.is_empty() {
            return AzureEnvironment::from_name(&self.config.cloud_name);
        }
        let infra = self.ctx.listers.infrastructure().await?;
        let cloud_name = infra
            .platform_status
            .azure
            .as_ref()
            .map(|a| a.cloud_name.as_str())
            .unwrap_or_default();
        AzureEnvironment::from_name(cloud_name)
    }

    async fn connect(&self) -> Result<(Arc<dyn AzureStorageApi>, AzureCredentials)> {
        let credentials = self.credentials().await?;
        let environment = self.environment().await?;
        let api = self
            .ctx
            .connectors
            .azure
            .connect(&credentials, &environment)
            .await?;
        Ok((api, credentials))
    }

    fn persist(&mut self, cr: &mut RegistryStorage) {
        let spec = cr.spec.azure.get_or_insert_with(Default::default);
        spec.account_name = self.config.account_name.clone();
        spec.container = self.config.container.clone();
    }
}

#[async_trait]
impl StorageDriver for AzureDriver {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Azure
    }

    fn id(&self) -> String {
        self.config.container.clone()
    }

    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>> {
        let environment = self.environment().await?;
        Ok(vec![
            RegistryEnvVar::literal("REGISTRY_STORAGE", "azure"),
            RegistryEnvVar::literal("REGISTRY_STORAGE_AZURE_CONTAINER", &self.config.container),
            RegistryEnvVar::literal(
                "REGISTRY_STORAGE_AZURE_ACCOUNTNAME",
                &self.config.account_name,
            ),
            RegistryEnvVar::secret_key(
                "REGISTRY_STORAGE_AZURE_ACCOUNTKEY",
                PRIVATE_CONFIG_SECRET_NAME,
                keys::AZURE_ACCOUNT_KEY,
            ),
            RegistryEnvVar::literal("REGISTRY_STORAGE_AZURE_REALM", environment.storage_suffix),
        ])
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        Ok((Vec::new(), Vec::new()))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        let (api, credentials) = self.connect().await?;
        let key = match credentials.account_key {
            Some(key) => key,
            None => {
                if self.config.account_name.is_empty() {
                    return Err(Error::Configuration(
                        "storage account name is not set yet".into(),
                    ));
                }
                api.account_key(&self.config.account_name).await?
            }
        };
        Ok(BTreeMap::from([(keys::AZURE_ACCOUNT_KEY.to_string(), key)]))
    }

    async fn storage_exists(&self, cr: &mut RegistryStorage) -> Result<bool> {
        if self.config.account_name.is_empty() || self.config.container.is_empty() {
            return Ok(self.ctx.provisioner.not_configured(&mut cr.status));
        }
        let (api, _) = self.connect().await?;
        let ops = AzureContainerOps {
            api,
            account: self.config.account_name.clone(),
        };
        self.ctx
            .provisioner
            .check_exists(&ops, &self.config.container, &mut cr.status)
            .await
    }

    fn storage_changed(&self, cr: &mut RegistryStorage) -> bool {
        let desired = cr.spec.azure.clone();
        let applied = cr.status.storage.azure.clone();
        self.ctx
            .provisioner
            .check_changed(&desired, &applied, &mut cr.status)
    }

    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()> {
        let infra = self.ctx.listers.infrastructure().await?;
        let (api, credentials) = self.connect().await?;
        let provisioner = self.ctx.provisioner.clone();
        let infra_name = infra.infrastructure_name.clone();

        // Storage account, which decides ownership
        let account_ops = AzureAccountOps {
            api: api.clone(),
            params: AccountParams {
                location: credentials.identity.region.clone(),
                tags: account_tags(&infra),
            },
            container: self.config.container.clone(),
        };
        let mut account = self.config.account_name.clone();
        let result = provisioner
            .ensure_resource(
                &account_ops,
                &mut account,
                || generate_account_name(&infra_name),
                &mut cr.status,
            )
            .await;
        if !account.is_empty() {
            self.config.account_name = account.clone();
            self.persist(cr);
        }
        result?;

        // Container; never changes ownership
        let ownership = cr.status.management_state;
        let container_ops = AzureContainerOps {
            api,
            account: account.clone(),
        };
        let mut container = self.config.container.clone();
        let result = provisioner
            .ensure_resource(
                &container_ops,
                &mut container,
                || generate_storage_name(&infra_name, &[], MAX_CONTAINER_NAME_LEN),
                &mut cr.status,
            )
            .await;
        cr.status.management_state = ownership;
        if !container.is_empty() {
            self.config.container = container;
            self.persist(cr);
        }
        result?;

        cr.status.storage.azure = Some(self.config.clone());
        provisioner
            .apply_hardening(&account_ops, &account, &mut cr.status)
            .await
    }

    async fn remove_storage(&mut self, cr: &mut RegistryStorage) -> Result<bool> {
        if !cr.status.is_managed() || self.config.account_name.is_empty() {
            return Ok(false);
        }

        let infra = self.ctx.listers.infrastructure().await?;
        let (api, credentials) = self.connect().await?;
        let ops = AzureAccountOps {
            api,
            params: AccountParams {
                location: credentials.identity.region,
                tags: account_tags(&infra),
            },
            container: self.config.container.clone(),
        };
        let removed = self
            .ctx
            .provisioner
            .remove_resource(&ops, &self.config.account_name, &mut cr.status)
            .await?;

        if removed {
            info!(
                "Removed Azure storage account {} and container {}",
                self.config.account_name, self.config.container
            );
            self.config.account_name.clear();
            self.config.container.clear();
            self.persist(cr);
            cr.status.storage.azure = None;
        }
        Ok(false)
    }

    async fn ca_bundle(&self) -> Result<CaBundle> {
        Ok(CaBundle::system())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, ConditionType, ManagementState, StorageSpec};
    use crate::domain::ports::{find_env, EnvValue};
    use crate::testing::TestEnv;

    fn azure_cr(config: AzureStorage) -> RegistryStorage {
        RegistryStorage::new(StorageSpec {
            azure: Some(config),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_bootstrap_creates_account_and_container() {
        let env = TestEnv::azure();
        let mut cr = azure_cr(AzureStorage::default());
        let mut driver = AzureDriver::new(AzureStorage::default(), env.ctx());

        driver.create_storage(&mut cr).await.unwrap();

        let spec = cr.spec.azure.clone().unwrap();
        assert!(spec.account_name.starts_with("myclusterx7k2pre"));
        assert!(spec.account_name.len() <= 24);
        assert!(spec.container.starts_with("mycluster-x7k2p-image-registry-"));
        assert_eq!(cr.status.storage.azure, Some(spec.clone()));
        assert!(cr.status.is_managed());
        assert!(env.azure.has_container(&spec.account_name, &spec.container));
        assert_eq!(
            env.azure
                .account_tags(&spec.account_name)
                .unwrap()
                .get("kubernetes.io_cluster.mycluster-x7k2p")
                .map(String::as_str),
            Some("owned")
        );
        assert_eq!(
            cr.status
                .condition(ConditionType::StoragePublicAccessBlocked)
                .map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[tokio::test]
    async fn test_taken_account_name_is_regenerated() {
        let env = TestEnv::azure();
        env.azure.reject_next_account_names(2);
        let mut cr = azure_cr(AzureStorage::default());
        let mut driver = AzureDriver::new(AzureStorage::default(), env.ctx());

        driver.create_storage(&mut cr).await.unwrap();
        assert_eq!(env.azure.calls("create_account"), 3);
        assert_eq!(env.azure.account_count(), 1);
    }

    #[tokio::test]
    async fn test_container_in_user_account_stays_unmanaged() {
        let env = TestEnv::azure();
        env.azure.add_account("useraccount");
        let config = AzureStorage {
            account_name: "useraccount".into(),
            ..Default::default()
        };
        let mut cr = azure_cr(config.clone());
        let mut driver = AzureDriver::new(config, env.ctx());

        driver.create_storage(&mut cr).await.unwrap();

        assert_eq!(cr.status.management_state, Some(ManagementState::Unmanaged));
        assert_eq!(env.azure.calls("create_account"), 0);
        assert_eq!(env.azure.calls("create_container"), 1);
        assert_eq!(env.azure.hardening_calls(), 0);

        let before = env.azure.total_calls();
        assert!(!driver.remove_storage(&mut cr).await.unwrap());
        assert_eq!(env.azure.total_calls(), before);
        assert!(env.azure.has_account("useraccount"));
    }

    #[tokio::test]
    async fn test_remove_deletes_container_then_account() {
        let env = TestEnv::azure();
        let mut cr = azure_cr(AzureStorage::default());
        let mut driver = AzureDriver::new(AzureStorage::default(), env.ctx());
        driver.create_storage(&mut cr).await.unwrap();
        let account = driver.config().account_name.clone();

        assert!(!driver.remove_storage(&mut cr).await.unwrap());
        assert!(!env.azure.has_account(&account));
        assert_eq!(env.azure.calls("delete_container"), 1);
        assert_eq!(env.azure.calls("delete_account"), 1);
        assert_eq!(driver.id(), "");
        assert_eq!(cr.status.management_state, Some(ManagementState::Removed));
    }

    #[tokio::test]
    async fn test_account_key_from_user_secret_overrides_list_keys() {
        let env = TestEnv::azure();
        env.put_user_secret(&[(keys::AZURE_ACCOUNT_KEY, "user-key")]);
        let driver = AzureDriver::new(
            AzureStorage {
                account_name: "acct".into(),
                container: "c".into(),
                ..Default::default()
            },
            env.ctx(),
        );

        let secrets = driver.volume_secrets().await.unwrap();
        assert_eq!(secrets[keys::AZURE_ACCOUNT_KEY], "user-key");
        assert_eq!(env.azure.calls("account_key"), 0);
    }

    #[tokio::test]
    async fn test_config_env_realm_follows_cloud() {
        let env = TestEnv::azure();
        let driver = AzureDriver::new(
            AzureStorage {
                account_name: "acct".into(),
                container: "c".into(),
                cloud_name: "AzureUSGovernmentCloud".into(),
            },
            env.ctx(),
        );

        let vars = driver.config_env().await.unwrap();
        assert_eq!(
            find_env(&vars, "REGISTRY_STORAGE_AZURE_REALM"),
            Some(&EnvValue::Literal("core.usgovcloudapi.net".into()))
        );
        assert_eq!(
            find_env(&vars, "REGISTRY_STORAGE_AZURE_ACCOUNTKEY"),
            Some(&EnvValue::SecretKey {
                secret: PRIVATE_CONFIG_SECRET_NAME.into(),
                key: keys::AZURE_ACCOUNT_KEY.into(),
            })
        );
    }

    #[tokio::test]
    async fn test_storage_exists_without_names_makes_no_calls() {
        let env = TestEnv::azure();
        let mut cr = azure_cr(AzureStorage::default());
        let driver = AzureDriver::new(AzureStorage::default(), env.ctx());
        assert!(!driver.storage_exists(&mut cr).await.unwrap());
        assert_eq!(env.azure.total_calls(), 0);
    }
}
