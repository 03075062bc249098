//! `google-cloud-storage` backed GCS client

use super::{BearerTokenSource, GcsApi, ObjectPage};
use crate::controlplane::credentials::GcsCredentials;
use crate::controlplane::provisioner::{CreateOutcome, Presence};
use crate::crd::StorageBackend;
use crate::error::{Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::buckets::delete::DeleteBucketRequest;
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::buckets::insert::{
    BucketCreationConfig, InsertBucketParam, InsertBucketRequest,
};
use google_cloud_storage::http::buckets::patch::{BucketPatchConfig, PatchBucketRequest};
use google_cloud_storage::http::buckets::{
    Encryption, IamConfiguration, PublicAccessPrevention, UniformBucketLevelAccess,
};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_token::TokenSource;
use std::collections::BTreeMap;
use std::sync::Arc;

/// GCS client plus the token source it authenticates with
pub struct GcsClient {
    client: Client,
    token_source: Arc<dyn TokenSource>,
}

impl GcsClient {
    pub async fn new(credentials: &GcsCredentials) -> Result<Self> {
        let file = CredentialsFile::new_from_str(&credentials.key_file_json)
            .await
            .map_err(|e| Error::Configuration(format!("invalid GCS key file: {}", e)))?;
        let config = ClientConfig::default()
            .with_credentials(file)
            .await
            .map_err(|e| Error::Configuration(format!("GCS authentication failed: {}", e)))?;
        let token_source = config
            .token_source_provider
            .as_ref()
            .map(|provider| provider.token_source())
            .ok_or_else(|| Error::Internal("GCS client has no token source".into()))?;

        Ok(Self {
            client: Client::new(config),
            token_source,
        })
    }
}

fn provider_error(
    operation: &str,
    resource: &str,
    err: google_cloud_storage::http::Error,
) -> Error {
    let kind = match &err {
        google_cloud_storage::http::Error::Response(response) => {
            ProviderErrorKind::from_status(response.code)
        }
        google_cloud_storage::http::Error::HttpClient(e) => e
            .status()
            .map(|s| ProviderErrorKind::from_status(s.as_u16()))
            .unwrap_or(ProviderErrorKind::Other),
        _ => ProviderErrorKind::Other,
    };
    Error::provider(StorageBackend::Gcs, operation, resource, kind, err.to_string())
}

fn iam_configuration() -> IamConfiguration {
    IamConfiguration {
        uniform_bucket_level_access: Some(UniformBucketLevelAccess {
            enabled: true,
            locked_time: None,
        }),
        public_access_prevention: Some(PublicAccessPrevention::Enforced),
    }
}

#[async_trait]
impl GcsApi for GcsClient {
    async fn bucket_presence(&self, bucket: &str) -> Result<Presence> {
        let request = GetBucketRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        match self.client.get_bucket(&request).await {
            Ok(_) => Ok(Presence::Present),
            Err(e) => match provider_error("get-bucket", bucket, e) {
                err if err.is_not_found() => Ok(Presence::Absent),
                err if err.is_forbidden() => Ok(Presence::Forbidden),
                err => Err(err),
            },
        }
    }

    async fn create_bucket(
        &self,
        project: &str,
        bucket: &str,
        location: &str,
    ) -> Result<CreateOutcome> {
        let request = InsertBucketRequest {
            name: bucket.to_string(),
            param: InsertBucketParam {
                project: project.to_string(),
                ..Default::default()
            },
            bucket: BucketCreationConfig {
                location: location.to_string(),
                iam_configuration: Some(IamConfiguration {
                    uniform_bucket_level_access: Some(UniformBucketLevelAccess {
                        enabled: true,
                        locked_time: None,
                    }),
                    public_access_prevention: None,
                }),
                ..Default::default()
            },
        };
        match self.client.insert_bucket(&request).await {
            Ok(_) => Ok(CreateOutcome::Created),
            // bucket names are global; a conflict means someone else has it
            Err(e) => match provider_error("create-bucket", bucket, e) {
                err if err.is_conflict() => Ok(CreateOutcome::AlreadyExists),
                err => Err(err),
            },
        }
    }

    async fn enforce_public_access_prevention(&self, bucket: &str) -> Result<()> {
        let request = PatchBucketRequest {
            bucket: bucket.to_string(),
            metadata: Some(BucketPatchConfig {
                iam_configuration: Some(iam_configuration()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client
            .patch_bucket(&request)
            .await
            .map_err(|e| provider_error("enforce-public-access-prevention", bucket, e))?;
        Ok(())
    }

    async fn set_labels(&self, bucket: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let request = PatchBucketRequest {
            bucket: bucket.to_string(),
            metadata: Some(BucketPatchConfig {
                labels: Some(labels.clone().into_iter().collect()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client
            .patch_bucket(&request)
            .await
            .map_err(|e| provider_error("set-labels", bucket, e))?;
        Ok(())
    }

    async fn set_default_kms_key(&self, bucket: &str, key: &str) -> Result<()> {
        let request = PatchBucketRequest {
            bucket: bucket.to_string(),
            metadata: Some(BucketPatchConfig {
                encryption: Some(Encryption {
                    default_kms_key_name: key.to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client
            .patch_bucket(&request)
            .await
            .map_err(|e| provider_error("set-default-kms-key", bucket, e))?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, page_token: Option<String>) -> Result<ObjectPage> {
        let request = ListObjectsRequest {
            bucket: bucket.to_string(),
            page_token,
            ..Default::default()
        };
        let response = self
            .client
            .list_objects(&request)
            .await
            .map_err(|e| provider_error("list-objects", bucket, e))?;
        Ok(ObjectPage {
            names: response
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|o| o.name)
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
        let request = DeleteObjectRequest {
            bucket: bucket.to_string(),
            object: name.to_string(),
            ..Default::default()
        };
        self.client
            .delete_object(&request)
            .await
            .map_err(|e| provider_error("delete-object", name, e))
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let request = DeleteBucketRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        self.client
            .delete_bucket(&request)
            .await
            .map_err(|e| provider_error("delete-bucket", bucket, e))
    }
}

#[async_trait]
impl BearerTokenSource for GcsClient {
    async fn authorization(&self) -> Result<String> {
        self.token_source
            .token()
            .await
            .map_err(|e| Error::Configuration(format!("GCP token request failed: {}", e)))
    }
}
