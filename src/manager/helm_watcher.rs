/**
 * Helm release watcher
 *
 * Mirrors Helm releases installed outside of our tooling into application
 * meta records, and removes those records once the release is gone. Helm
 * keeps releases either in secrets or in config maps depending on its storage
 * driver; one watcher tracks the revisions of both.
 */
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::watcher::AppMetaCache;
use crate::appmeta::helm::{RELEASE_DATA_KEY, decode_release, release_name_from_key};
use crate::appmeta::{AppType, ApplicationMeta, ApplicationState, SecretOperator};
use crate::error::{Error, Result};
use crate::k8s::Reconciler;

/// A cluster object Helm stores release revisions in
pub trait ReleaseStorage: Resource + Clone + Send + Sync + 'static {
    /// Storage driver name, as Helm calls it
    const DRIVER: &'static str;

    /// The encoded release payload
    fn release_payload(&self) -> Option<&[u8]>;
}

impl ReleaseStorage for Secret {
    const DRIVER: &'static str = "secret";

    fn release_payload(&self) -> Option<&[u8]> {
        self.data
            .as_ref()
            .and_then(|data| data.get(RELEASE_DATA_KEY))
            .map(|value| value.0.as_slice())
    }
}

impl ReleaseStorage for ConfigMap {
    const DRIVER: &'static str = "configmap";

    fn release_payload(&self) -> Option<&[u8]> {
        self.data
            .as_ref()
            .and_then(|data| data.get(RELEASE_DATA_KEY))
            .map(String::as_bytes)
    }
}

/// Revision keys of different drivers never collide
fn revision_key<K: ReleaseStorage>(key: &str) -> String {
    format!("{}:{}", K::DRIVER, key)
}

pub struct HelmReleaseWatcher {
    namespace: String,
    apps: Arc<AppMetaCache>,
    operator: Arc<dyn SecretOperator>,
    /// Live revision keys, across drivers, per release name
    revisions: Mutex<HashMap<String, HashSet<String>>>,
}

impl HelmReleaseWatcher {
    #[must_use]
    pub fn new(namespace: &str, apps: Arc<AppMetaCache>, operator: Arc<dyn SecretOperator>) -> Self {
        Self {
            namespace: namespace.to_string(),
            apps,
            operator,
            revisions: Mutex::new(HashMap::new()),
        }
    }

    /// Names of releases that currently have a live revision
    pub async fn releases(&self) -> HashSet<String> {
        self.revisions.lock().await.keys().cloned().collect()
    }

    /// Delete application records that can't be decoded, and Helm-managed
    /// records whose release no longer exists. Failures are logged.
    pub async fn reconcile_orphans(&self, records: &[Secret]) {
        let releases = self.releases().await;
        for record in records {
            let name = record.name_any();
            let reason = match ApplicationMeta::decode(record) {
                Err(e) => format!("the record is broken: {e}"),
                Ok(meta) if meta.is_helm() && !releases.contains(&meta.helm_release_name) => {
                    "the corresponding helm release is deleted".to_string()
                }
                Ok(_) => continue,
            };
            info!("Application record '{}' will be deleted, {}", name, reason);
            match self.operator.delete(&self.namespace, &name).await {
                Ok(()) => info!("Application record '{}' from ns {} has been deleted", name, self.namespace),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(
                    "Application record '{}' from ns {} needs to be deleted but fail: {}",
                    name, self.namespace, e
                ),
            }
        }
    }

    async fn join<K: ReleaseStorage>(&self, key: &str, obj: &K) -> Result<()> {
        let payload = obj
            .release_payload()
            .ok_or_else(|| Error::Custom(format!("{key} carries no release")))?;
        let release = decode_release(payload)?;
        let revision = revision_key::<K>(key);

        if release.is_deleted() {
            return self.forget_revision(&release.name, &revision).await;
        }
        self.revisions
            .lock()
            .await
            .entry(release.name.clone())
            .or_default()
            .insert(revision);

        let meta = self.apps.get(&release.name).await;
        if meta.is_installed() || meta.is_installing() {
            return Ok(());
        }

        let mut meta = ApplicationMeta::new(&self.namespace, &release.name);
        meta.one_time_initial(self.operator.as_ref(), |m| {
            m.application_type = AppType::HelmLocal;
            m.helm_release_name = release.name.clone();
        })
        .await?;
        info!("Application '{}' created from helm release", release.name);
        Ok(())
    }

    async fn forget_revision(&self, release: &str, revision: &str) -> Result<()> {
        let gone = {
            let mut revisions = self.revisions.lock().await;
            let remaining = revisions.entry(release.to_string()).or_default();
            remaining.remove(revision);
            let gone = remaining.is_empty();
            if gone {
                revisions.remove(release);
            }
            gone
        };
        if !gone {
            debug!("Release {} still has live revisions", release);
            return Ok(());
        }

        let mut meta = self.apps.get(release).await;
        if meta.application_state != ApplicationState::Installed {
            return Ok(());
        }
        meta.delete(self.operator.as_ref()).await?;
        info!("Uninstall application {} by managed helm", release);
        Ok(())
    }
}

#[async_trait]
impl<K: ReleaseStorage> Reconciler<K> for HelmReleaseWatcher {
    async fn create_or_update(&self, key: &str, obj: &K) -> Result<()> {
        if let Err(e) = self.join(key, obj).await {
            warn!(
                "Helm release found from {} {}, but error occur while processing: {}",
                K::DRIVER,
                key,
                e
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = match release_name_from_key(key) {
            Ok(release) => self.forget_revision(&release, &revision_key::<K>(key)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Helm release {} is deleted, but error occur while processing: {}", key, e);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("'Helm-{} - ns:{}'", K::DRIVER, self.namespace)
    }
}
