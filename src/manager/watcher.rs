/**
 * Application meta watcher
 *
 * One watcher per (namespace, credential). It keeps the decoded application
 * meta of every record in the namespace and turns each change into dev-mode
 * events on the bus.
 */
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connector::Connection;
use super::event_bus::{ApplicationEventPack, EventBus};
use crate::appmeta::{ApplicationEvent, ApplicationMeta, DevMeta, SecretOperator, application_name};
use crate::config::WatcherSettings;
use crate::error::Result;
use crate::k8s::{Controller, Credential, ErrorReporter, RecordSource, Reconciler};

/// Decoded application meta by application name
pub struct AppMetaCache {
    namespace: String,
    credential: Credential,
    metas: Mutex<HashMap<String, ApplicationMeta>>,
    bus: Arc<EventBus>,
}

impl AppMetaCache {
    #[must_use]
    pub fn new(namespace: &str, credential: Credential, bus: Arc<EventBus>) -> Self {
        Self {
            namespace: namespace.to_string(),
            credential,
            metas: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// The cached meta, or an uninstalled default
    pub async fn get(&self, application: &str) -> ApplicationMeta {
        self.metas
            .lock()
            .await
            .get(application)
            .cloned()
            .unwrap_or_else(|| ApplicationMeta::new(&self.namespace, application))
    }

    /// Every cached meta, ordered by application name
    pub async fn all(&self) -> Vec<ApplicationMeta> {
        let mut metas: Vec<_> = self.metas.lock().await.values().cloned().collect();
        metas.sort_by(|a, b| a.application.cmp(&b.application));
        metas
    }

    async fn join(&self, secret: &Secret) -> Result<()> {
        let current = ApplicationMeta::decode(secret)?;
        let application = current.application.clone();

        let mut metas = self.metas.lock().await;
        let events = metas
            .get(&application)
            .map_or_else(DevMeta::new, |before| before.dev_meta.clone())
            .events(&current.dev_meta);
        metas.insert(application.clone(), current);

        for event in events {
            self.bus.push(self.pack(&application, event)).await;
        }
        Ok(())
    }

    async fn left(&self, application: &str) {
        let mut metas = self.metas.lock().await;
        let Some(before) = metas.remove(application) else {
            return;
        };

        for event in before.dev_meta.events(&DevMeta::new()) {
            self.bus.push(self.pack(application, event)).await;
        }
    }

    fn pack(&self, application: &str, event: ApplicationEvent) -> ApplicationEventPack {
        ApplicationEventPack {
            event,
            namespace: self.namespace.clone(),
            app_name: application.to_string(),
            credential: self.credential.clone(),
        }
    }
}

#[async_trait]
impl Reconciler<Secret> for AppMetaCache {
    async fn create_or_update(&self, key: &str, secret: &Secret) -> Result<()> {
        debug!("Reconciling application record {}", key);
        self.join(secret).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let application = application_name(key)?;
        self.left(&application).await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("'Secret - ns:{}'", self.namespace)
    }
}

pub struct ResourceWatcher {
    namespace: String,
    cache: Arc<AppMetaCache>,
    controller: Arc<Controller<Secret, AppMetaCache>>,
    operator: Arc<dyn SecretOperator>,
}

impl ResourceWatcher {
    #[must_use]
    pub fn new(
        namespace: &str,
        credential: Credential,
        connection: &Connection,
        bus: Arc<EventBus>,
        settings: WatcherSettings,
        reporter: Arc<dyn ErrorReporter>,
        cancel: CancellationToken,
    ) -> Self {
        let cache = Arc::new(AppMetaCache::new(namespace, credential, bus));
        let source: Arc<dyn RecordSource<Secret>> = Arc::clone(&connection.app_meta_source);
        let controller = Controller::new(source, Arc::clone(&cache), settings, reporter, cancel);
        Self {
            namespace: namespace.to_string(),
            cache,
            controller: Arc::new(controller),
            operator: Arc::clone(&connection.operator),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<AppMetaCache> {
        &self.cache
    }

    /// Writes go through here
    #[must_use]
    pub fn operator(&self) -> Arc<dyn SecretOperator> {
        Arc::clone(&self.operator)
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.controller.cancellation().clone()
    }

    /// Load and reconcile every existing record, returning how many were found.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the records can not be listed
    pub async fn prepare(&self) -> Result<usize> {
        self.controller.prepare().await
    }

    /// Block until the watcher is stopped or its watch is lost for good.
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::FatalWatch)` if the watch can not be re-established
    pub async fn run(&self) -> Result<()> {
        Arc::clone(&self.controller).run().await
    }

    pub fn stop(&self) {
        self.controller.cancellation().cancel();
    }

    pub async fn get_application_meta(&self, application: &str) -> ApplicationMeta {
        self.cache.get(application).await
    }

    pub async fn get_application_metas(&self) -> Vec<ApplicationMeta> {
        self.cache.all().await
    }

    /// Records as last seen by the watch
    pub async fn records(&self) -> Vec<Secret> {
        self.controller.snapshot().await
    }

    /// Apply a record the caller just wrote (`None` when deleted) without
    /// waiting for the watch to deliver it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record can not be decoded
    pub async fn apply_manually(&self, record_name: &str, secret: Option<Secret>) -> Result<()> {
        let key = format!("{}/{}", self.namespace, record_name);
        self.controller.apply_now(&key, secret).await
    }
}
