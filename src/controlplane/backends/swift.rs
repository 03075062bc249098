//! OpenStack Swift Storage Driver
//!
//! Provisions a Swift container. Authentication goes through Keystone
//! (v3 by default, v2 when asked for) and the object-store endpoint is taken
//! from the service catalog. Swift has no public access, tagging or default
//! encryption APIs, so containers are created without hardening.

use super::DriverContext;
use crate::controlplane::credentials::{
    keys, CredentialResolver, SwiftCredentials, PRIVATE_CONFIG_SECRET_NAME,
};
use crate::controlplane::naming::{generate_storage_name, MAX_CONTAINER_NAME_LEN};
use crate::controlplane::provisioner::{
    CreateOutcome, Presence, PresenceReasons, ResourceOps, CONTAINER_REASONS,
};
use crate::crd::{RegistryStorage, StorageBackend, SwiftStorage};
use crate::domain::ports::{CaBundle, RegistryEnvVar, StorageDriver};
use crate::error::{AggregateError, Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Volume, VolumeMount};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Keystone API version used when none is configured
pub const DEFAULT_AUTH_VERSION: &str = "3";

const OBJECT_STORE_SERVICE: &str = "object-store";

// =============================================================================
// Swift API Port
// =============================================================================

/// One page of object names in a container
#[derive(Debug, Clone, Default)]
pub struct SwiftObjectPage {
    pub names: Vec<String>,
    /// Marker for the next page, absent on the last one
    pub next_marker: Option<String>,
}

/// Container operations used by the driver
#[async_trait]
pub trait SwiftApi: Send + Sync {
    async fn container_presence(&self, container: &str) -> Result<Presence>;

    async fn create_container(&self, container: &str) -> Result<CreateOutcome>;

    async fn list_objects(&self, container: &str, marker: Option<String>)
        -> Result<SwiftObjectPage>;

    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;

    async fn delete_container(&self, container: &str) -> Result<()>;
}

/// Builds Swift clients from freshly resolved credentials
#[async_trait]
pub trait SwiftConnector: Send + Sync {
    async fn connect(&self, credentials: &SwiftCredentials) -> Result<Arc<dyn SwiftApi>>;
}

/// Connector authenticating against Keystone
#[derive(Debug, Clone, Default)]
pub struct KeystoneConnector;

#[async_trait]
impl SwiftConnector for KeystoneConnector {
    async fn connect(&self, credentials: &SwiftCredentials) -> Result<Arc<dyn SwiftApi>> {
        Ok(Arc::new(SwiftClient::authenticate(credentials).await?))
    }
}

// =============================================================================
// Keystone Authentication
// =============================================================================

#[derive(Deserialize)]
struct V3TokenResponse {
    token: V3Token,
}

#[derive(Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3CatalogEntry>,
}

#[derive(Deserialize)]
struct V3CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Deserialize)]
struct V3Endpoint {
    interface: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    region_id: String,
    url: String,
}

#[derive(Deserialize)]
struct V2TokenResponse {
    access: V2Access,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct V2Access {
    token: V2Token,
    #[serde(default)]
    service_catalog: Vec<V2CatalogEntry>,
}

#[derive(Deserialize)]
struct V2Token {
    id: String,
}

#[derive(Deserialize)]
struct V2CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct V2Endpoint {
    #[serde(default)]
    region: String,
    #[serde(rename = "publicURL")]
    public_url: String,
}

fn keystone_error(operation: &str, resource: &str, status: StatusCode, body: String) -> Error {
    Error::provider(
        StorageBackend::Swift,
        operation,
        resource,
        ProviderErrorKind::from_status(status.as_u16()),
        format!("HTTP {}: {}", status.as_u16(), body),
    )
}

/// Keystone v3 password authentication request
fn v3_auth_body(credentials: &SwiftCredentials) -> Value {
    let domain = if !credentials.domain_id.is_empty() {
        json!({ "id": credentials.domain_id })
    } else if !credentials.domain.is_empty() {
        json!({ "name": credentials.domain })
    } else {
        json!({ "id": "default" })
    };

    let mut auth = json!({
        "identity": {
            "methods": ["password"],
            "password": {
                "user": {
                    "name": credentials.username,
                    "domain": domain,
                    "password": credentials.password,
                },
            },
        },
    });
    if !credentials.tenant_id.is_empty() {
        auth["scope"] = json!({ "project": { "id": credentials.tenant_id } });
    } else if !credentials.tenant.is_empty() {
        auth["scope"] = json!({ "project": { "name": credentials.tenant, "domain": domain } });
    }
    json!({ "auth": auth })
}

/// Keystone v2 password authentication request
fn v2_auth_body(credentials: &SwiftCredentials) -> Value {
    let mut auth = json!({
        "passwordCredentials": {
            "username": credentials.username,
            "password": credentials.password,
        },
    });
    if !credentials.tenant_id.is_empty() {
        auth["tenantId"] = json!(credentials.tenant_id);
    } else if !credentials.tenant.is_empty() {
        auth["tenantName"] = json!(credentials.tenant);
    }
    json!({ "auth": auth })
}

/// Public object-store endpoint for `region`, any region when empty
fn v3_object_store_url(catalog: &[V3CatalogEntry], region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == OBJECT_STORE_SERVICE)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && (region.is_empty() || ep.region == region || ep.region_id == region)
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
}

fn v2_object_store_url(catalog: &[V2CatalogEntry], region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == OBJECT_STORE_SERVICE)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| region.is_empty() || ep.region == region)
        .map(|ep| ep.public_url.trim_end_matches('/').to_string())
}

// =============================================================================
// Swift Client
// =============================================================================

/// `SwiftApi` over the Swift REST API with a Keystone token
pub struct SwiftClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl SwiftClient {
    /// Authenticate and look up the object-store endpoint
    pub async fn authenticate(credentials: &SwiftCredentials) -> Result<Self> {
        if credentials.auth_url.is_empty() {
            return Err(Error::Configuration("Swift auth URL is not set".into()));
        }
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let auth_url = credentials.auth_url.trim_end_matches('/');
        let version = if credentials.identity_api_version.is_empty() {
            DEFAULT_AUTH_VERSION
        } else {
            credentials.identity_api_version.as_str()
        };

        let (token, endpoint) = if version.starts_with('2') {
            let response = http
                .post(format!("{}/tokens", auth_url))
                .json(&v2_auth_body(credentials))
                .send()
                .await?;
            let response = Self::check(response, "authenticate", auth_url).await?;
            let body: V2TokenResponse = response.json().await?;
            let endpoint = v2_object_store_url(&body.access.service_catalog, &credentials.region_name);
            (body.access.token.id, endpoint)
        } else {
            let response = http
                .post(format!("{}/auth/tokens", auth_url))
                .json(&v3_auth_body(credentials))
                .send()
                .await?;
            let response = Self::check(response, "authenticate", auth_url).await?;
            let token = response
                .headers()
                .get("X-Subject-Token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Internal("Keystone response carries no X-Subject-Token".into())
                })?;
            let body: V3TokenResponse = response.json().await?;
            (token, v3_object_store_url(&body.token.catalog, &credentials.region_name))
        };

        let endpoint = endpoint.ok_or_else(|| {
            Error::Configuration(format!(
                "no public object-store endpoint in region {:?}",
                credentials.region_name
            ))
        })?;
        debug!("Using Swift endpoint {}", endpoint);

        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    async fn check(response: Response, operation: &str, resource: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(keystone_error(operation, resource, status, body))
    }

    fn url(&self, container: &str, object: Option<&str>) -> String {
        match object {
            Some(object) => format!(
                "{}/{}/{}",
                self.endpoint,
                urlencoding::encode(container),
                urlencoding::encode(object)
            ),
            None => format!("{}/{}", self.endpoint, urlencoding::encode(container)),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        operation: &str,
        resource: &str,
    ) -> Result<Response> {
        let response = self
            .http
            .request(method, url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        Self::check(response, operation, resource).await
    }
}

#[derive(Deserialize)]
struct SwiftObject {
    name: String,
}

#[async_trait]
impl SwiftApi for SwiftClient {
    async fn container_presence(&self, container: &str) -> Result<Presence> {
        match self
            .send(Method::HEAD, self.url(container, None), "head-container", container)
            .await
        {
            Ok(_) => Ok(Presence::Present),
            Err(e) if e.is_not_found() => Ok(Presence::Absent),
            Err(e) if e.is_forbidden() => Ok(Presence::Forbidden),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, container: &str) -> Result<CreateOutcome> {
        self.send(Method::PUT, self.url(container, None), "create-container", container)
            .await?;
        Ok(CreateOutcome::Created)
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: Option<String>,
    ) -> Result<SwiftObjectPage> {
        let mut request = self
            .http
            .get(self.url(container, None))
            .header("X-Auth-Token", &self.token)
            .query(&[("format", "json")]);
        if let Some(marker) = &marker {
            request = request.query(&[("marker", marker.as_str())]);
        }
        let response = Self::check(request.send().await?, "list-objects", container).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(SwiftObjectPage::default());
        }
        let objects: Vec<SwiftObject> = response.json().await?;
        let next_marker = objects.last().map(|o| o.name.clone());
        Ok(SwiftObjectPage {
            names: objects.into_iter().map(|o| o.name).collect(),
            next_marker,
        })
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            self.url(container, Some(name)),
            "delete-object",
            name,
        )
        .await?;
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.send(Method::DELETE, self.url(container, None), "delete-container", container)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Container Operations
// =============================================================================

/// `ResourceOps` strategy for Swift containers
pub struct SwiftContainerOps {
    api: Arc<dyn SwiftApi>,
}

#[async_trait]
impl ResourceOps for SwiftContainerOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Swift
    }

    fn kind(&self) -> &'static str {
        "container"
    }

    fn reasons(&self) -> PresenceReasons {
        CONTAINER_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.api.container_presence(name).await
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        info!("Creating Swift container: {}", name);
        self.api.create_container(name).await
    }

    async fn empty(&self, name: &str) -> Result<()> {
        let mut failures = AggregateError::new();
        let mut marker = None;
        loop {
            let page = self.api.list_objects(name, marker).await?;
            if page.names.is_empty() {
                break;
            }
            for object in &page.names {
                match self.api.delete_object(name, object).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => failures.record("delete-object", &format!("{}/{}", name, object), &e),
                }
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        failures.into_result()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete_container(name).await
    }
}

// =============================================================================
// Swift Driver
// =============================================================================

/// Storage driver for OpenStack Swift
pub struct SwiftDriver {
    config: SwiftStorage,
    ctx: DriverContext,
}

impl SwiftDriver {
    pub fn new(config: SwiftStorage, ctx: DriverContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &SwiftStorage {
        &self.config
    }

    /// Resolved credentials with the configured endpoint fields taking
    /// precedence over the ones from clouds.yaml
    async fn credentials(&self) -> Result<SwiftCredentials> {
        let mut credentials =
            CredentialResolver::new(self.ctx.listers.as_ref(), self.ctx.resolver.clone())
                .swift()
                .await?;
        let overrides = [
            (&self.config.auth_url, &mut credentials.auth_url),
            (&self.config.auth_version, &mut credentials.identity_api_version),
            (&self.config.domain, &mut credentials.domain),
            (&self.config.domain_id, &mut credentials.domain_id),
            (&self.config.tenant, &mut credentials.tenant),
            (&self.config.tenant_id, &mut credentials.tenant_id),
            (&self.config.region_name, &mut credentials.region_name),
        ];
        for (configured, resolved) in overrides {
            if !configured.is_empty() {
                *resolved = configured.clone();
            }
        }
        Ok(credentials)
    }

    async fn container_ops(&self) -> Result<(SwiftContainerOps, SwiftCredentials)> {
        let credentials = self.credentials().await?;
        let api = self.ctx.connectors.swift.connect(&credentials).await?;
        Ok((SwiftContainerOps { api }, credentials))
    }

    fn persist(&mut self, cr: &mut RegistryStorage) {
        cr.spec.swift = Some(self.config.clone());
    }
}

#[async_trait]
impl StorageDriver for SwiftDriver {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Swift
    }

    fn id(&self) -> String {
        self.config.container.clone()
    }

    async fn config_env(&self) -> Result<Vec<RegistryEnvVar>> {
        let credentials = self.credentials().await?;
        let auth_version = if credentials.identity_api_version.is_empty() {
            DEFAULT_AUTH_VERSION.to_string()
        } else {
            credentials.identity_api_version.clone()
        };

        let mut env = vec![
            RegistryEnvVar::literal("REGISTRY_STORAGE", "swift"),
            RegistryEnvVar::literal("REGISTRY_STORAGE_SWIFT_CONTAINER", &self.config.container),
            RegistryEnvVar::literal("REGISTRY_STORAGE_SWIFT_AUTHURL", &credentials.auth_url),
            RegistryEnvVar::secret_key(
                "REGISTRY_STORAGE_SWIFT_USERNAME",
                PRIVATE_CONFIG_SECRET_NAME,
                keys::SWIFT_USERNAME,
            ),
            RegistryEnvVar::secret_key(
                "REGISTRY_STORAGE_SWIFT_PASSWORD",
                PRIVATE_CONFIG_SECRET_NAME,
                keys::SWIFT_PASSWORD,
            ),
            RegistryEnvVar::literal("REGISTRY_STORAGE_SWIFT_AUTHVERSION", auth_version),
        ];
        let optional = [
            ("REGISTRY_STORAGE_SWIFT_DOMAIN", &credentials.domain),
            ("REGISTRY_STORAGE_SWIFT_DOMAINID", &credentials.domain_id),
            ("REGISTRY_STORAGE_SWIFT_TENANT", &credentials.tenant),
            ("REGISTRY_STORAGE_SWIFT_TENANTID", &credentials.tenant_id),
            ("REGISTRY_STORAGE_SWIFT_REGION", &credentials.region_name),
        ];
        for (name, value) in optional {
            if !value.is_empty() {
                env.push(RegistryEnvVar::literal(name, value));
            }
        }
        Ok(env)
    }

    async fn volumes(&self) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        Ok((Vec::new(), Vec::new()))
    }

    async fn volume_secrets(&self) -> Result<BTreeMap<String, String>> {
        let credentials = self.credentials().await?;
        Ok(BTreeMap::from([
            (keys::SWIFT_USERNAME.to_string(), credentials.username),
            (keys::SWIFT_PASSWORD.to_string(), credentials.password),
        ]))
    }

    async fn storage_exists(&self, cr: &mut RegistryStorage) -> Result<bool> {
        if self.config.container.is_empty() {
            return Ok(self.ctx.provisioner.not_configured(&mut cr.status));
        }
        let (ops, _) = self.container_ops().await?;
        self.ctx
            .provisioner
            .check_exists(&ops, &self.config.container, &mut cr.status)
            .await
    }

    fn storage_changed(&self, cr: &mut RegistryStorage) -> bool {
        let desired = cr.spec.swift.clone();
        let applied = cr.status.storage.swift.clone();
        self.ctx
            .provisioner
            .check_changed(&desired, &applied, &mut cr.status)
    }

    async fn create_storage(&mut self, cr: &mut RegistryStorage) -> Result<()> {
        let infra = self.ctx.listers.infrastructure().await?;
        let (ops, credentials) = self.container_ops().await?;
        let provisioner = self.ctx.provisioner.clone();

        let mut container = self.config.container.clone();
        let result = provisioner
            .ensure_resource(
                &ops,
                &mut container,
                || {
                    generate_storage_name(
                        &infra.infrastructure_name,
                        &[],
                        MAX_CONTAINER_NAME_LEN,
                    )
                },
                &mut cr.status,
            )
            .await;
        if !container.is_empty() {
            self.config.container = container;
            if self.config.auth_url.is_empty() {
                self.config.auth_url = credentials.auth_url.clone();
            }
            self.persist(cr);
        }
        result?;

        cr.status.storage.swift = Some(self.config.clone());
        Ok(())
    }

    async fn remove_storage(&mut self, cr: &mut RegistryStorage) -> Result<bool> {
        if !cr.status.is_managed() || self.config.container.is_empty() {
            return Ok(false);
        }

        let (ops, _) = self.container_ops().await?;
        let removed = self
            .ctx
            .provisioner
            .remove_resource(&ops, &self.config.container, &mut cr.status)
            .await?;

        if removed {
            info!("Removed Swift container: {}", self.config.container);
            self.config.container.clear();
            self.persist(cr);
            if let Some(applied) = cr.status.storage.swift.as_mut() {
                applied.container.clear();
            }
        }
        Ok(false)
    }

    async fn ca_bundle(&self) -> Result<CaBundle> {
        Ok(CaBundle::system())
    }
}
