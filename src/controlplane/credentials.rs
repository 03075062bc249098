//! Credential Resolution
//!
//! Backend credentials are read from a user override secret when present and
//! from the cluster-minted cloud credentials secret otherwise. The minted
//! secret is created asynchronously by another controller, so for cloud
//! backends it is polled at a fixed interval before giving up.
//!
//! Credentials are resolved on every call and never cached.

use crate::crd::StorageBackend;
use crate::domain::ports::ClusterListers;
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Well-known Names
// =============================================================================

/// Namespace the registry and its secrets live in
pub const OPERATOR_NAMESPACE: &str = "openshift-image-registry";

/// Secret the cluster administrator may create to override credentials
pub const USER_SECRET_NAME: &str = "image-registry-private-configuration-user";

/// Secret minted by the cloud credential controller
pub const MINTED_SECRET_NAME: &str = "installer-cloud-credentials";

/// Secret generated from `volume_secrets` and mounted into the registry
pub const PRIVATE_CONFIG_SECRET_NAME: &str = "image-registry-private-configuration";

pub mod keys {
    pub const S3_ACCESS_KEY: &str = "REGISTRY_STORAGE_S3_ACCESSKEY";
    pub const S3_SECRET_KEY: &str = "REGISTRY_STORAGE_S3_SECRETKEY";
    pub const AWS_ACCESS_KEY_ID: &str = "aws_access_key_id";
    pub const AWS_SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

    pub const AZURE_ACCOUNT_KEY: &str = "REGISTRY_STORAGE_AZURE_ACCOUNTKEY";
    pub const AZURE_CLIENT_ID: &str = "azure_client_id";
    pub const AZURE_TENANT_ID: &str = "azure_tenant_id";
    pub const AZURE_SUBSCRIPTION_ID: &str = "azure_subscription_id";
    pub const AZURE_RESOURCE_GROUP: &str = "azure_resourcegroup";
    pub const AZURE_REGION: &str = "azure_region";
    pub const AZURE_CLIENT_SECRET: &str = "azure_client_secret";
    pub const AZURE_FEDERATED_TOKEN_FILE: &str = "azure_federated_token_file";

    pub const GCS_KEYFILE: &str = "REGISTRY_STORAGE_GCS_KEYFILE";
    pub const GCP_SERVICE_ACCOUNT: &str = "service_account.json";

    pub const SWIFT_USERNAME: &str = "REGISTRY_STORAGE_SWIFT_USERNAME";
    pub const SWIFT_PASSWORD: &str = "REGISTRY_STORAGE_SWIFT_PASSWORD";
    pub const OPENSTACK_CLOUDS: &str = "clouds.yaml";
}

/// Cloud entry looked up in `clouds.yaml`
pub const OPENSTACK_CLOUD_NAME: &str = "openstack";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for credential resolution
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Namespace holding both secrets
    pub namespace: String,
    /// User override secret name
    pub user_secret: String,
    /// Cluster-minted secret name
    pub minted_secret: String,
    /// Fixed interval between polls for the minted secret
    pub poll_interval: Duration,
    /// Ceiling on the total time spent polling
    pub poll_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            namespace: OPERATOR_NAMESPACE.to_string(),
            user_secret: USER_SECRET_NAME.to_string(),
            minted_secret: MINTED_SECRET_NAME.to_string(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Credential Types
// =============================================================================

/// Which secret the credentials were read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    User,
    Minted,
}

/// Static S3 access keys
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub source: CredentialSource,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// How an Azure workload identity authenticates
#[derive(Clone, PartialEq, Eq)]
pub enum AzureAuth {
    ClientSecret(String),
    FederatedTokenFile(String),
}

impl fmt::Debug for AzureAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AzureAuth::ClientSecret(_) => write!(f, "ClientSecret(..)"),
            AzureAuth::FederatedTokenFile(path) => write!(f, "FederatedTokenFile({path})"),
        }
    }
}

/// Identity used against Azure Resource Manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureIdentity {
    pub client_id: String,
    pub tenant_id: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub region: String,
    pub auth: AzureAuth,
}

/// Azure credentials: the minted identity plus an optional user supplied
/// storage account key
#[derive(Clone, PartialEq, Eq)]
pub struct AzureCredentials {
    pub identity: AzureIdentity,
    pub account_key: Option<String>,
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("identity", &self.identity)
            .field("account_key", &self.account_key.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Google service account key file
#[derive(Clone, PartialEq, Eq)]
pub struct GcsCredentials {
    pub key_file_json: String,
    pub source: CredentialSource,
}

impl GcsCredentials {
    /// Project id embedded in the key file, if any
    pub fn project_id(&self) -> Option<String> {
        serde_json::from_str::<serde_json::Value>(&self.key_file_json)
            .ok()?
            .get("project_id")?
            .as_str()
            .map(str::to_string)
    }
}

impl fmt::Debug for GcsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsCredentials")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Keystone credentials and the endpoint metadata that comes with them
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SwiftCredentials {
    pub username: String,
    pub password: String,
    pub auth_url: String,
    pub domain: String,
    pub domain_id: String,
    pub tenant: String,
    pub tenant_id: String,
    pub region_name: String,
    pub identity_api_version: String,
}

impl fmt::Debug for SwiftCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwiftCredentials")
            .field("username", &self.username)
            .field("auth_url", &self.auth_url)
            .field("region_name", &self.region_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
struct CloudsYaml {
    #[serde(default)]
    clouds: BTreeMap<String, CloudEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudEntry {
    #[serde(default)]
    auth: CloudAuth,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    identity_api_version: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudAuth {
    #[serde(default)]
    auth_url: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    project_name: String,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    domain_name: String,
    #[serde(default)]
    domain_id: String,
    #[serde(default)]
    user_domain_name: String,
    #[serde(default)]
    user_domain_id: String,
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves backend credentials from the layered secret lookup
pub struct CredentialResolver<'a> {
    listers: &'a dyn ClusterListers,
    config: ResolverConfig,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(listers: &'a dyn ClusterListers, config: ResolverConfig) -> Self {
        Self { listers, config }
    }

    /// S3 access keys. User keys win over the minted ones.
    pub async fn s3(&self) -> Result<S3Credentials> {
        if let Some(secret) = self.user_secret().await? {
            debug!("Using S3 credentials from {}", self.config.user_secret);
            return Ok(S3Credentials {
                access_key_id: self.value(&secret, keys::S3_ACCESS_KEY)?,
                secret_access_key: self.value(&secret, keys::S3_SECRET_KEY)?,
                source: CredentialSource::User,
            });
        }

        let secret = self.minted_secret(StorageBackend::S3, true).await?;
        Ok(S3Credentials {
            access_key_id: self.minted_value(&secret, keys::AWS_ACCESS_KEY_ID)?,
            secret_access_key: self.minted_value(&secret, keys::AWS_SECRET_ACCESS_KEY)?,
            source: CredentialSource::Minted,
        })
    }

    /// Azure identity from the minted secret plus the optional user account key
    pub async fn azure(&self) -> Result<AzureCredentials> {
        let account_key = match self.user_secret().await? {
            Some(secret) => {
                debug!("Using Azure account key from {}", self.config.user_secret);
                Some(self.value(&secret, keys::AZURE_ACCOUNT_KEY)?)
            }
            None => None,
        };

        let secret = self.minted_secret(StorageBackend::Azure, true).await?;
        let auth = match optional_value(&secret, keys::AZURE_CLIENT_SECRET) {
            Some(client_secret) => AzureAuth::ClientSecret(client_secret),
            None => match optional_value(&secret, keys::AZURE_FEDERATED_TOKEN_FILE) {
                Some(path) => AzureAuth::FederatedTokenFile(path),
                None => {
                    return Err(Error::MissingSecretKey {
                        secret: self.config.minted_secret.clone(),
                        key: keys::AZURE_CLIENT_SECRET.to_string(),
                    })
                }
            },
        };

        Ok(AzureCredentials {
            identity: AzureIdentity {
                client_id: self.minted_value(&secret, keys::AZURE_CLIENT_ID)?,
                tenant_id: self.minted_value(&secret, keys::AZURE_TENANT_ID)?,
                subscription_id: self.minted_value(&secret, keys::AZURE_SUBSCRIPTION_ID)?,
                resource_group: self.minted_value(&secret, keys::AZURE_RESOURCE_GROUP)?,
                region: self.minted_value(&secret, keys::AZURE_REGION)?,
                auth,
            },
            account_key,
        })
    }

    /// Google service account key file
    pub async fn gcs(&self) -> Result<GcsCredentials> {
        if let Some(secret) = self.user_secret().await? {
            debug!("Using GCS key file from {}", self.config.user_secret);
            return Ok(GcsCredentials {
                key_file_json: self.value(&secret, keys::GCS_KEYFILE)?,
                source: CredentialSource::User,
            });
        }

        let secret = self.minted_secret(StorageBackend::Gcs, true).await?;
        Ok(GcsCredentials {
            key_file_json: self.minted_value(&secret, keys::GCP_SERVICE_ACCOUNT)?,
            source: CredentialSource::Minted,
        })
    }

    /// Keystone credentials. The minted secret is not polled for Swift.
    pub async fn swift(&self) -> Result<SwiftCredentials> {
        if let Some(secret) = self.user_secret().await? {
            debug!("Using Swift credentials from {}", self.config.user_secret);
            return Ok(SwiftCredentials {
                username: self.value(&secret, keys::SWIFT_USERNAME)?,
                password: self.value(&secret, keys::SWIFT_PASSWORD)?,
                ..Default::default()
            });
        }

        let secret = self.minted_secret(StorageBackend::Swift, false).await?;
        let raw = self.minted_value(&secret, keys::OPENSTACK_CLOUDS)?;
        let clouds: CloudsYaml = serde_yaml::from_str(&raw)?;
        let cloud = clouds.clouds.get(OPENSTACK_CLOUD_NAME).ok_or_else(|| {
            Error::Configuration(format!(
                "{} in secret {} has no cloud named {:?}",
                keys::OPENSTACK_CLOUDS,
                self.config.minted_secret,
                OPENSTACK_CLOUD_NAME
            ))
        })?;

        let auth = &cloud.auth;
        let domain = first_non_empty(&[&auth.domain_name, &auth.user_domain_name]);
        let domain_id = first_non_empty(&[&auth.domain_id, &auth.user_domain_id]);
        let identity_api_version = match &cloud.identity_api_version {
            Some(serde_yaml::Value::Number(n)) => n.to_string(),
            Some(serde_yaml::Value::String(s)) => s.clone(),
            _ => String::new(),
        };

        Ok(SwiftCredentials {
            username: auth.username.clone(),
            password: auth.password.clone(),
            auth_url: auth.auth_url.clone(),
            domain,
            domain_id,
            tenant: auth.project_name.clone(),
            tenant_id: auth.project_id.clone(),
            region_name: cloud.region_name.clone(),
            identity_api_version,
        })
    }

    // =========================================================================
    // Secret Lookup
    // =========================================================================

    /// The user override secret. Only not-found falls through.
    async fn user_secret(&self) -> Result<Option<Secret>> {
        self.listers
            .secret(&self.config.namespace, &self.config.user_secret)
            .await
    }

    /// The cluster-minted secret, polled at a fixed interval when `poll` is set
    async fn minted_secret(&self, backend: StorageBackend, poll: bool) -> Result<Secret> {
        let not_found = || Error::CredentialsNotFound {
            backend,
            user_secret: self.config.user_secret.clone(),
            minted_secret: self.config.minted_secret.clone(),
        };

        if !poll {
            return self
                .listers
                .secret(&self.config.namespace, &self.config.minted_secret)
                .await?
                .ok_or_else(not_found);
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.poll_interval)
            .with_max_interval(self.config.poll_interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(self.config.poll_timeout))
            .build();

        let this = self;
        backoff::future::retry(policy, move || async move {
            match this
                .listers
                .secret(&this.config.namespace, &this.config.minted_secret)
                .await
            {
                Ok(Some(secret)) => Ok(secret),
                Ok(None) => {
                    info!(
                        "Waiting for {} credentials secret {}/{}",
                        backend, this.config.namespace, this.config.minted_secret
                    );
                    Err(backoff::Error::transient(not_found()))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
        .map_err(|e| {
            warn!("Giving up on {} credentials: {}", backend, e);
            e
        })
    }

    fn value(&self, secret: &Secret, key: &str) -> Result<String> {
        required_value(secret, &self.config.user_secret, key)
    }

    fn minted_value(&self, secret: &Secret, key: &str) -> Result<String> {
        required_value(secret, &self.config.minted_secret, key)
    }
}

/// Read a key from a secret, checking `data` then `stringData`
pub fn optional_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(value.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

fn required_value(secret: &Secret, secret_name: &str, key: &str) -> Result<String> {
    optional_value(secret, key).ok_or_else(|| Error::MissingSecretKey {
        secret: secret_name.to_string(),
        key: key.to_string(),
    })
}

fn first_non_empty(values: &[&String]) -> String {
    values
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_default()
}
