//! Azure Resource Manager REST client
//!
//! Talks to the `Microsoft.Storage` resource provider directly over HTTPS
//! with tokens from the Microsoft identity platform.

use super::{AccountParams, AzureConnector, AzureEnvironment, AzureStorageApi};
use crate::controlplane::credentials::{AzureAuth, AzureCredentials, AzureIdentity};
use crate::controlplane::provisioner::{CreateOutcome, Presence};
use crate::crd::StorageBackend;
use crate::error::{Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN_SECS: i64 = 120;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for Resource Manager calls
#[derive(Debug, Clone)]
pub struct ArmConfig {
    /// `api-version` of the Microsoft.Storage provider
    pub api_version: String,
    /// Delay between polls of a long running operation
    pub poll_interval: Duration,
    /// Give up on a long running operation after this long
    pub poll_timeout: Duration,
    /// Per request timeout
    pub request_timeout: Duration,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            api_version: "2023-01-01".to_string(),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// OAuth Tokens
// =============================================================================

/// Bearer token with its expiry
#[derive(Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Client credentials flow against the identity platform v2 endpoint.
///
/// Signs in with either a client secret or a federated token read fresh
/// from disk on every refresh.
pub struct OAuthClient {
    http: Client,
    token_url: String,
    identity: AzureIdentity,
    scope: String,
    cached: Mutex<Option<AccessToken>>,
}

impl OAuthClient {
    pub fn new(
        http: Client,
        environment: &AzureEnvironment,
        identity: AzureIdentity,
        scope: impl Into<String>,
    ) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            environment.active_directory, identity.tenant_id
        );
        Self {
            http,
            token_url,
            identity,
            scope: scope.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current token, refreshed when close to expiry
    pub async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            let margin = chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
            if token.expires_at - margin > Utc::now() {
                return Ok(token.clone());
            }
        }

        let token = self.request_token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn token_form(&self) -> Result<Vec<(&'static str, String)>> {
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.identity.client_id.clone()),
            ("scope", self.scope.clone()),
        ];
        match &self.identity.auth {
            AzureAuth::ClientSecret(secret) => form.push(("client_secret", secret.clone())),
            AzureAuth::FederatedTokenFile(path) => {
                let assertion = tokio::fs::read_to_string(path).await?;
                form.push(("client_assertion_type", JWT_BEARER_ASSERTION.to_string()));
                form.push(("client_assertion", assertion.trim().to_string()));
            }
        }
        Ok(form)
    }

    async fn request_token(&self) -> Result<AccessToken> {
        let form = self.token_form().await?;
        debug!("Requesting Azure token for scope {}", self.scope);
        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let response = check_response(response, "get-token", &self.identity.client_id).await?;
        let body: TokenResponse = response.json().await?;

        Ok(AccessToken {
            secret: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in as i64),
        })
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

#[derive(Deserialize)]
struct ArmErrorBody {
    error: ArmErrorDetail,
}

#[derive(Deserialize)]
struct ArmErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Classify a Resource Manager error by its code, then by HTTP status
fn classify(status: StatusCode, code: &str) -> ProviderErrorKind {
    match code {
        "ResourceNotFound" | "StorageAccountNotFound" | "ContainerNotFound" => {
            ProviderErrorKind::NotFound
        }
        "StorageAccountAlreadyTaken" | "StorageAccountAlreadyExists" | "ContainerAlreadyExists" => {
            ProviderErrorKind::AlreadyExists
        }
        "AuthorizationFailed" | "AuthenticationFailed" | "LinkedAuthorizationFailed" => {
            ProviderErrorKind::Forbidden
        }
        "StorageAccountOperationInProgress" | "Conflict" => ProviderErrorKind::Conflict,
        "TooManyRequests" => ProviderErrorKind::Throttled,
        _ => ProviderErrorKind::from_status(status.as_u16()),
    }
}

fn provider_error(
    operation: &str,
    resource: &str,
    status: StatusCode,
    body: &str,
) -> Error {
    let (code, message) = match serde_json::from_str::<ArmErrorBody>(body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (String::new(), body.to_string()),
    };
    let kind = classify(status, &code);
    let message = if code.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), message)
    } else {
        format!("HTTP {} {}: {}", status.as_u16(), code, message)
    };
    Error::provider(StorageBackend::Azure, operation, resource, kind, message)
}

/// Pass successful responses through, turn the rest into provider errors
async fn check_response(response: Response, operation: &str, resource: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(provider_error(operation, resource, status, &body))
}

fn presence_from(err: Error) -> Result<Presence> {
    if err.is_not_found() {
        Ok(Presence::Absent)
    } else if err.is_forbidden() {
        Ok(Presence::Forbidden)
    } else {
        Err(err)
    }
}

// =============================================================================
// Request Bodies
// =============================================================================

fn account_body(params: &AccountParams) -> Value {
    json!({
        "location": params.location,
        "kind": "StorageV2",
        "sku": { "name": "Standard_LRS" },
        "tags": params.tags,
        "properties": {
            "allowBlobPublicAccess": false,
            "minimumTlsVersion": "TLS1_2",
            "supportsHttpsTrafficOnly": true,
        },
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NameAvailability {
    name_available: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<AccountKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountKey {
    key_name: String,
    value: String,
}

// =============================================================================
// Storage Management Client
// =============================================================================

/// `AzureStorageApi` over the Resource Manager REST API
pub struct ArmStorageClient {
    http: Client,
    oauth: OAuthClient,
    config: ArmConfig,
    resource_manager: String,
    subscription_id: String,
    resource_group: String,
}

impl ArmStorageClient {
    pub fn new(
        credentials: &AzureCredentials,
        environment: &AzureEnvironment,
        config: ArmConfig,
    ) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let identity = credentials.identity.clone();
        Ok(Self {
            oauth: OAuthClient::new(
                http.clone(),
                environment,
                identity.clone(),
                environment.management_scope(),
            ),
            http,
            config,
            resource_manager: environment.resource_manager.to_string(),
            subscription_id: identity.subscription_id,
            resource_group: identity.resource_group,
        })
    }

    fn account_url(&self, account: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}",
            self.resource_manager,
            urlencoding::encode(&self.subscription_id),
            urlencoding::encode(&self.resource_group),
            urlencoding::encode(account)
        )
    }

    fn container_url(&self, account: &str, container: &str) -> String {
        format!(
            "{}/blobServices/default/containers/{}",
            self.account_url(account),
            urlencoding::encode(container)
        )
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.oauth.token().await?;
        Ok(self
            .http
            .request(method, url)
            .query(&[("api-version", self.config.api_version.as_str())])
            .bearer_auth(token.secret))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        operation: &str,
        resource: &str,
    ) -> Result<Response> {
        let mut request = self.request(method, url).await?;
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        check_response(response, operation, resource).await
    }

    async fn name_available(&self, account: &str) -> Result<bool> {
        let url = format!(
            "{}/subscriptions/{}/providers/Microsoft.Storage/checkNameAvailability",
            self.resource_manager,
            urlencoding::encode(&self.subscription_id)
        );
        let body = json!({ "name": account, "type": "Microsoft.Storage/storageAccounts" });
        let response = self
            .send(Method::POST, &url, Some(&body), "check-name-availability", account)
            .await?;
        let availability: NameAvailability = response.json().await?;
        if !availability.name_available {
            debug!(
                "Storage account name {} is not available: {} {}",
                account,
                availability.reason.unwrap_or_default(),
                availability.message.unwrap_or_default()
            );
        }
        Ok(availability.name_available)
    }

    /// Follow an accepted operation's `Location` header until it completes
    async fn wait_for_operation(
        &self,
        response: Response,
        operation: &str,
        resource: &str,
    ) -> Result<()> {
        if response.status() != StatusCode::ACCEPTED {
            return Ok(());
        }
        let location = match response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(location) => location.to_string(),
            None => return Ok(()),
        };

        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("Azure {} of {}", operation, resource),
                    duration: self.config.poll_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;

            let token = self.oauth.token().await?;
            let poll = self
                .http
                .get(&location)
                .bearer_auth(token.secret)
                .send()
                .await?;
            let poll = check_response(poll, operation, resource).await?;
            if poll.status() != StatusCode::ACCEPTED {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl AzureStorageApi for ArmStorageClient {
    async fn account_presence(&self, account: &str) -> Result<Presence> {
        let url = self.account_url(account);
        match self.send(Method::GET, &url, None, "get-account", account).await {
            Ok(_) => Ok(Presence::Present),
            Err(e) => presence_from(e),
        }
    }

    async fn create_account(
        &self,
        account: &str,
        params: &AccountParams,
    ) -> Result<CreateOutcome> {
        if !self.name_available(account).await? {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let url = self.account_url(account);
        let body = account_body(params);
        let response = match self
            .send(Method::PUT, &url, Some(&body), "create-account", account)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_already_exists() => return Ok(CreateOutcome::AlreadyExists),
            Err(e) => return Err(e),
        };
        self.wait_for_operation(response, "create-account", account)
            .await?;
        info!("Created Azure storage account {}", account);
        Ok(CreateOutcome::Created)
    }

    async fn update_account_tags(
        &self,
        account: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let url = self.account_url(account);
        let body = json!({ "tags": tags });
        self.send(Method::PATCH, &url, Some(&body), "update-tags", account)
            .await?;
        Ok(())
    }

    async fn disable_public_access(&self, account: &str) -> Result<()> {
        let url = self.account_url(account);
        let body = json!({ "properties": { "allowBlobPublicAccess": false } });
        self.send(Method::PATCH, &url, Some(&body), "disable-public-access", account)
            .await?;
        Ok(())
    }

    async fn delete_account(&self, account: &str) -> Result<()> {
        let url = self.account_url(account);
        let response = self
            .send(Method::DELETE, &url, None, "delete-account", account)
            .await?;
        // 204 means the account was already gone
        if response.status() == StatusCode::NO_CONTENT {
            warn!("Azure storage account {} did not exist at deletion", account);
        }
        Ok(())
    }

    async fn account_key(&self, account: &str) -> Result<String> {
        let url = format!("{}/listKeys", self.account_url(account));
        let response = self
            .send(Method::POST, &url, None, "list-keys", account)
            .await?;
        let keys: ListKeysResponse = response.json().await?;
        keys.keys
            .into_iter()
            .find(|k| k.key_name == "key1")
            .map(|k| k.value)
            .ok_or_else(|| {
                Error::provider(
                    StorageBackend::Azure,
                    "list-keys",
                    account,
                    ProviderErrorKind::NotFound,
                    "storage account has no primary key",
                )
            })
    }

    async fn container_presence(&self, account: &str, container: &str) -> Result<Presence> {
        let url = self.container_url(account, container);
        match self
            .send(Method::GET, &url, None, "get-container", container)
            .await
        {
            Ok(_) => Ok(Presence::Present),
            Err(e) => presence_from(e),
        }
    }

    async fn create_container(&self, account: &str, container: &str) -> Result<CreateOutcome> {
        let url = self.container_url(account, container);
        let body = json!({ "properties": { "publicAccess": "None" } });
        match self
            .send(Method::PUT, &url, Some(&body), "create-container", container)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if e.is_already_exists() => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn delete_container(&self, account: &str, container: &str) -> Result<()> {
        let url = self.container_url(account, container);
        let response = self
            .send(Method::DELETE, &url, None, "delete-container", container)
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(Error::provider(
                StorageBackend::Azure,
                "delete-container",
                container,
                ProviderErrorKind::NotFound,
                "container does not exist",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Connector building Resource Manager clients
#[derive(Debug, Clone, Default)]
pub struct ArmConnector {
    pub config: ArmConfig,
}

#[async_trait]
impl AzureConnector for ArmConnector {
    async fn connect(
        &self,
        credentials: &AzureCredentials,
        environment: &AzureEnvironment,
    ) -> Result<Arc<dyn AzureStorageApi>> {
        let client = ArmStorageClient::new(credentials, environment, self.config.clone())?;
        Ok(Arc::new(client))
    }
}
