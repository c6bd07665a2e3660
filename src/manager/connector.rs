use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use std::sync::Arc;
use tracing::debug;

use crate::appmeta::helm::RELEASE_LABEL_SELECTOR;
use crate::appmeta::{KubeSecretOperator, RECORD_TYPE, SecretOperator};
use crate::config;
use crate::error::Result;
use crate::k8s::{Credential, KubeSource, RecordSource, client};

/// Everything a watcher needs to talk to one namespace
#[derive(Clone)]
pub struct Connection {
    /// Application meta records
    pub app_meta_source: Arc<dyn RecordSource<Secret>>,
    /// Helm releases kept by the secret driver; `None` disables the Helm watcher
    pub helm_release_source: Option<Arc<dyn RecordSource<Secret>>>,
    /// Helm releases kept by the configmap driver
    pub helm_config_map_source: Option<Arc<dyn RecordSource<ConfigMap>>>,
    pub operator: Arc<dyn SecretOperator>,
}

/// Opens connections for (namespace, credential) pairs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, namespace: &str, credential: &Credential) -> Result<Connection>;
}

#[derive(Debug, Clone)]
pub struct KubeConnector {
    user_agent: String,
}

impl Default for KubeConnector {
    fn default() -> Self {
        Self {
            user_agent: config::user_agent(),
        }
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, namespace: &str, credential: &Credential) -> Result<Connection> {
        let client = client::new(credential, Some(&self.user_agent)).await?;
        debug!("Connected to ns {} with {:?}", namespace, credential);

        let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let app_meta_source =
            KubeSource::with_fields(secrets.clone(), &format!("type={RECORD_TYPE}"));
        let helm_release_source = KubeSource::with_labels(secrets, RELEASE_LABEL_SELECTOR);
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let helm_config_map_source = KubeSource::with_labels(config_maps, RELEASE_LABEL_SELECTOR);

        Ok(Connection {
            app_meta_source: Arc::new(app_meta_source),
            helm_release_source: Some(Arc::new(helm_release_source)),
            helm_config_map_source: Some(Arc::new(helm_config_map_source)),
            operator: Arc::new(KubeSecretOperator::new(client)),
        })
    }
}
