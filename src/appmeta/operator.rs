use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::Result;

/// Cluster writes on behalf of application meta.
///
/// The watcher never writes; only lifecycle operations go through here.
#[async_trait]
pub trait SecretOperator: Send + Sync {
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn update(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Names of all config maps in `namespace`
    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<String>>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeSecretOperator {
    client: Client,
}

impl KubeSecretOperator {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretOperator for KubeSecretOperator {
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        Ok(self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await?)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret> {
        Ok(self.secrets(namespace).get(name).await?)
    }

    async fn update(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        Ok(self
            .secrets(namespace)
            .replace(&name, &PostParams::default(), secret)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        debug!("Deleted secret {}/{}", namespace, name);
        Ok(())
    }

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<String>> {
        let list = self.config_maps(namespace).list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|cm| cm.metadata.name)
            .collect())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
