//! Blob data plane access through the Azure SDK

use super::{AzureEnvironment, OAuthClient};
use crate::controlplane::credentials::AzureIdentity;
use crate::crd::StorageBackend;
use crate::error::{Error, ProviderErrorKind, Result};
use crate::migration::{BlobContainer, CopyState};
use async_trait::async_trait;
use azure_core::auth::{AccessToken, TokenCredential};
use azure_core::error::ErrorKind;
use azure_storage::{CloudLocation, StorageCredentials};
use azure_storage_blobs::blob::CopyStatus;
use azure_storage_blobs::prelude::{ClientBuilder, ContainerClient};
use futures::StreamExt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

/// Bridges `OAuthClient` into the SDK's credential trait
pub struct OAuthTokenCredential {
    oauth: OAuthClient,
}

impl std::fmt::Debug for OAuthTokenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenCredential").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenCredential for OAuthTokenCredential {
    async fn get_token(&self, _scopes: &[&str]) -> azure_core::Result<AccessToken> {
        let token = self
            .oauth
            .token()
            .await
            .map_err(|e| azure_core::Error::new(ErrorKind::Credential, e))?;
        let expires_on = OffsetDateTime::from_unix_timestamp(token.expires_at.timestamp())
            .map_err(|e| azure_core::Error::new(ErrorKind::Credential, e))?;
        Ok(AccessToken::new(token.secret, expires_on))
    }

    async fn clear_cache(&self) -> azure_core::Result<()> {
        Ok(())
    }
}

/// How the blob client authenticates
#[derive(Debug)]
pub enum BlobAuth {
    /// Entra ID identity, client secret or federated token
    Identity(AzureIdentity),
    /// Shared account key
    AccountKey(String),
}

/// One container reached through `azure_storage_blobs`
pub struct AzureBlobContainer {
    client: ContainerClient,
    container: String,
}

impl AzureBlobContainer {
    pub fn new(
        account: &str,
        container: &str,
        auth: BlobAuth,
        environment: &AzureEnvironment,
    ) -> Result<Self> {
        let credentials = match auth {
            BlobAuth::AccountKey(key) => StorageCredentials::access_key(account.to_string(), key),
            BlobAuth::Identity(identity) => {
                let http = reqwest::Client::builder().build()?;
                let oauth =
                    OAuthClient::new(http, environment, identity, environment.storage_scope());
                StorageCredentials::token_credential(Arc::new(OAuthTokenCredential { oauth }))
            }
        };
        let location = CloudLocation::Custom {
            account: account.to_string(),
            uri: environment.blob_endpoint(account),
        };
        let client = ClientBuilder::with_location(location, credentials).container_client(container);
        Ok(Self {
            client,
            container: container.to_string(),
        })
    }

    fn sdk_error(&self, operation: &str, blob: &str, err: azure_core::Error) -> Error {
        let kind = match err.kind() {
            ErrorKind::HttpResponse { status, .. } => {
                ProviderErrorKind::from_status(*status as u16)
            }
            _ => ProviderErrorKind::Other,
        };
        Error::provider(
            StorageBackend::Azure,
            operation,
            format!("{}/{}", self.container, blob),
            kind,
            err.to_string(),
        )
    }
}

fn copy_state(status: Option<CopyStatus>, description: Option<String>) -> CopyState {
    let description = description.unwrap_or_default();
    match status {
        Some(CopyStatus::Pending) => CopyState::Pending,
        Some(CopyStatus::Failed) => CopyState::Failed(description),
        Some(CopyStatus::Aborted) => CopyState::Aborted(description),
        Some(CopyStatus::Success) | None => CopyState::Success,
    }
}

#[async_trait]
impl BlobContainer for AzureBlobContainer {
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_blobs()
            .prefix(prefix.to_string())
            .into_stream();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| self.sdk_error("list-blobs", prefix, e))?;
            names.extend(page.blobs.blobs().map(|blob| blob.name.clone()));
        }
        debug!("Listed {} blob(s) under {:?}", names.len(), prefix);
        Ok(names)
    }

    async fn start_copy(&self, source: &str, dest: &str) -> Result<CopyState> {
        let source_url = self
            .client
            .blob_client(source)
            .url()
            .map_err(|e| self.sdk_error("copy", source, e))?;
        let response = self
            .client
            .blob_client(dest)
            .copy(source_url)
            .await
            .map_err(|e| self.sdk_error("copy", source, e))?;
        Ok(copy_state(Some(response.copy_status), None))
    }

    async fn copy_state(&self, dest: &str) -> Result<CopyState> {
        let response = self
            .client
            .blob_client(dest)
            .get_properties()
            .await
            .map_err(|e| self.sdk_error("get-properties", dest, e))?;
        let properties = response.blob.properties;
        Ok(copy_state(
            properties.copy_status,
            properties.copy_status_description,
        ))
    }

    async fn delete_blob(&self, name: &str) -> Result<()> {
        self.client
            .blob_client(name)
            .delete()
            .await
            .map_err(|e| self.sdk_error("delete", name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_state_mapping() {
        assert_eq!(copy_state(Some(CopyStatus::Pending), None), CopyState::Pending);
        assert_eq!(
            copy_state(Some(CopyStatus::Failed), Some("500 InternalError".into())),
            CopyState::Failed("500 InternalError".into())
        );
        assert_eq!(copy_state(None, None), CopyState::Success);
    }
}
