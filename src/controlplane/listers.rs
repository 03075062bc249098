//! Kubernetes backed cluster listers

use crate::crd::Infrastructure;
use crate::domain::ports::ClusterListers;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// Name of the cluster scoped infrastructure object
pub const INFRASTRUCTURE_NAME: &str = "cluster";

const FIELD_MANAGER: &str = "registry-storage-operator";

/// Reads cluster state through the Kubernetes API
#[derive(Clone)]
pub struct KubeListers {
    client: Client,
}

impl KubeListers {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn infrastructure_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure");
        let resource = ApiResource::from_gvk(&gvk);
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl ClusterListers for KubeListers {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn infrastructure(&self) -> Result<Infrastructure> {
        let object = self.infrastructure_api().get(INFRASTRUCTURE_NAME).await?;
        let status = object.data.get("status").cloned().ok_or_else(|| {
            Error::Configuration(format!(
                "infrastructure {} has no status",
                INFRASTRUCTURE_NAME
            ))
        })?;
        Ok(serde_json::from_value(status)?)
    }

    async fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<()> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.into()),
        };
        api.create(&params, claim).await?;
        Ok(())
    }

    async fn delete_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("Claim {}/{} already deleted", namespace, name);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
