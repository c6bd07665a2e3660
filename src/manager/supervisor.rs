/**
 * Watcher registry
 *
 * Exactly one live watcher per (namespace, credential fingerprint). Watchers
 * start on first use and leave the registry when their watch is lost, so the
 * next lookup builds a fresh one.
 */
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connector::{Connection, Connector};
use super::event_bus::EventBus;
use super::helm_watcher::HelmReleaseWatcher;
use super::watcher::ResourceWatcher;
use crate::config::WatcherSettings;
use crate::error::Result;
use crate::k8s::{Controller, Credential, ErrorReporter, RecordSource};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatcherKey {
    pub namespace: String,
    pub fingerprint: String,
}

impl WatcherKey {
    #[must_use]
    pub fn new(namespace: &str, credential: &Credential) -> Self {
        Self {
            namespace: namespace.to_string(),
            fingerprint: credential.fingerprint(),
        }
    }
}

type Slot = Arc<OnceCell<Arc<ResourceWatcher>>>;

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    settings: WatcherSettings,
    reporter: Arc<dyn ErrorReporter>,
    cancel: CancellationToken,
    deck: DashMap<WatcherKey, Slot>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        settings: WatcherSettings,
        reporter: Arc<dyn ErrorReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            bus,
            settings,
            reporter,
            cancel,
            deck: DashMap::new(),
        }
    }

    /// Number of registered watchers
    #[must_use]
    pub fn len(&self) -> usize {
        self.deck.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deck.is_empty()
    }

    /// The watcher for `namespace` and `credential`, started on first use.
    ///
    /// Concurrent first calls for the same key share one creation.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the namespace can not be connected to
    pub async fn get_or_create(
        self: &Arc<Self>,
        namespace: &str,
        credential: &Credential,
    ) -> Result<Arc<ResourceWatcher>> {
        let key = WatcherKey::new(namespace, credential);
        let slot: Slot = Arc::clone(self.deck.entry(key.clone()).or_default().value());

        let created = slot
            .get_or_try_init(|| self.create(&key, credential, &slot))
            .await
            .map(Arc::clone);
        if created.is_err() {
            self.deck
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot) && !slot.initialized());
        }
        created
    }

    async fn create(
        self: &Arc<Self>,
        key: &WatcherKey,
        credential: &Credential,
        slot: &Slot,
    ) -> Result<Arc<ResourceWatcher>> {
        let namespace = key.namespace.as_str();
        let connection = self.connector.connect(namespace, credential).await?;
        let watcher = Arc::new(ResourceWatcher::new(
            namespace,
            credential.clone(),
            &connection,
            Arc::clone(&self.bus),
            self.settings.clone(),
            Arc::clone(&self.reporter),
            self.cancel.child_token(),
        ));

        info!("Prepare SecretWatcher for ns {}", namespace);
        match watcher.prepare().await {
            Ok(count) => info!(
                "Prepare complete with {} records, start to watch for ns {}",
                count, namespace
            ),
            Err(e) => warn!(
                "Records of ns {} can not be listed, start to watch anyway: {}",
                namespace, e
            ),
        }

        let supervisor = Arc::clone(self);
        let running = Arc::clone(&watcher);
        let key = key.clone();
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            match running.run().await {
                Ok(()) => info!("Watcher for ns {} stopped", key.namespace),
                Err(e) => error!("Watcher for ns {} terminated: {}", key.namespace, e),
            }
            running.stop();
            supervisor.evict(&key, &slot);
        });

        self.start_helm_watcher(&watcher, &connection).await;
        Ok(watcher)
    }

    async fn start_helm_watcher(&self, watcher: &Arc<ResourceWatcher>, connection: &Connection) {
        let Some(source) = connection.helm_release_source.as_ref() else {
            debug!("No helm release source for ns {}, helm watch disabled", watcher.namespace());
            return;
        };
        let namespace = watcher.namespace();
        let helm = Arc::new(HelmReleaseWatcher::new(
            namespace,
            Arc::clone(watcher.cache()),
            watcher.operator(),
        ));
        let cancel = watcher.cancellation();

        let secrets: Arc<dyn RecordSource<Secret>> = Arc::clone(source);
        let secrets = Arc::new(Controller::new(
            secrets,
            Arc::clone(&helm),
            self.settings.clone(),
            Arc::clone(&self.reporter),
            cancel.child_token(),
        ));
        info!("Prepare HelmSecretWatcher for ns {}", namespace);
        if let Err(e) = secrets.prepare().await {
            warn!(
                "Helm secrets of ns {} can not be listed, helm watch feature will not be enabled: {}",
                namespace, e
            );
            return;
        }

        let config_maps = match connection.helm_config_map_source.as_ref() {
            Some(source) => {
                let source: Arc<dyn RecordSource<ConfigMap>> = Arc::clone(source);
                let controller = Arc::new(Controller::new(
                    source,
                    Arc::clone(&helm),
                    self.settings.clone(),
                    Arc::clone(&self.reporter),
                    cancel.child_token(),
                ));
                info!("Prepare HelmConfigMapWatcher for ns {}", namespace);
                if let Err(e) = controller.prepare().await {
                    warn!(
                        "Helm config maps of ns {} can not be listed, helm watch feature will not be enabled: {}",
                        namespace, e
                    );
                    return;
                }
                Some(controller)
            }
            None => None,
        };

        // Both drivers are listed, so a release missing from both is really gone
        helm.reconcile_orphans(&watcher.records().await).await;

        let name = namespace.to_string();
        tokio::spawn(async move {
            if let Err(e) = secrets.run().await {
                warn!("Helm secret watch for ns {} is disabled: {}", name, e);
            }
        });
        if let Some(controller) = config_maps {
            let name = namespace.to_string();
            tokio::spawn(async move {
                if let Err(e) = controller.run().await {
                    warn!("Helm config map watch for ns {} is disabled: {}", name, e);
                }
            });
        }
    }

    fn evict(&self, key: &WatcherKey, slot: &Slot) {
        if self
            .deck
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            info!("Watcher for ns {} removed from the registry", key.namespace);
        }
    }
}
