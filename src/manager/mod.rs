//! Process-wide access to application meta: one watcher per namespace and
//! credential, a shared event bus, and the read API the rest of the tooling
//! uses.
pub mod connector;
pub mod event_bus;
pub mod helm_watcher;
pub mod supervisor;
pub mod watcher;

use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::appmeta::ApplicationMeta;
use crate::config::WatcherSettings;
use crate::error::Result;
use crate::k8s::{Credential, ErrorReporter, LogReporter};
pub use connector::{Connection, Connector, KubeConnector};
pub use event_bus::{ApplicationEventPack, EventBus, Listener, logging_listener};
pub use supervisor::{Supervisor, WatcherKey};
pub use watcher::ResourceWatcher;

pub struct AppMetaManager {
    supervisor: Arc<Supervisor>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    started: AtomicBool,
    /// Cleared when the delivery loop ends, whether cancelled or panicked
    delivering: Arc<AtomicBool>,
}

impl AppMetaManager {
    /// A manager whose bus logs every transition
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, settings: WatcherSettings) -> Self {
        Self::with_reporter(connector, settings, Arc::new(LogReporter))
    }

    #[must_use]
    pub fn with_reporter(
        connector: Arc<dyn Connector>,
        settings: WatcherSettings,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let bus = Arc::new(EventBus::with_listeners(
            settings.listener_delivery_attempts,
            vec![logging_listener()],
        ));
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            connector,
            Arc::clone(&bus),
            settings,
            reporter,
            cancel.child_token(),
        ));
        Self {
            supervisor,
            bus,
            cancel,
            started: AtomicBool::new(false),
            delivering: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub const fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn register_listener(&self, listener: Listener) {
        self.bus.register_listener(listener).await;
    }

    /// Start delivering events to listeners. Only the first call has an effect.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Application event delivery started");
        self.delivering.store(true, Ordering::SeqCst);
        let delivery = self.bus.start(self.cancel.child_token());
        let delivering = Arc::clone(&self.delivering);
        tokio::spawn(async move {
            match delivery.await {
                Ok(()) => info!("Application event delivery ended"),
                Err(e) => error!("Application event delivery aborted: {}", e),
            }
            delivering.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Whether the delivery loop is running
    #[must_use]
    pub fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::SeqCst)
    }

    /// Stop every watcher and the event loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The watcher for `namespace`, started on first use
    ///
    /// # Errors
    ///
    /// Will return `Err` if the namespace can not be connected to
    pub async fn watcher(
        &self,
        namespace: &str,
        credential: &Credential,
    ) -> Result<Arc<ResourceWatcher>> {
        self.supervisor.get_or_create(namespace, credential).await
    }

    /// Always returns a meta; an unknown or unreachable application reads as uninstalled.
    pub async fn get_application_meta(
        &self,
        namespace: &str,
        application: &str,
        credential: &Credential,
    ) -> ApplicationMeta {
        match self.watcher(namespace, credential).await {
            Ok(watcher) => watcher.get_application_meta(application).await,
            Err(e) => {
                error!("Error while watching ns {}: {}", namespace, e);
                ApplicationMeta::new(namespace, application)
            }
        }
    }

    pub async fn get_application_metas(
        &self,
        namespace: &str,
        credential: &Credential,
    ) -> Vec<ApplicationMeta> {
        match self.watcher(namespace, credential).await {
            Ok(watcher) => watcher.get_application_metas().await,
            Err(e) => {
                error!("Error while watching ns {}: {}", namespace, e);
                Vec::new()
            }
        }
    }

    /// Push a record this process just wrote (or deleted) into its watcher
    ///
    /// # Errors
    ///
    /// Will return `Err` if the watcher is unavailable or rejects the record
    pub async fn update_application_meta_manually(
        &self,
        namespace: &str,
        credential: &Credential,
        record_name: &str,
        secret: Option<Secret>,
    ) -> Result<()> {
        let deleting = secret.is_none();
        let result = self
            .watcher(namespace, credential)
            .await?
            .apply_manually(record_name, secret)
            .await;
        info!(
            "receive {} record operation, name: {}, ok: {}",
            if deleting { "delete" } else { "update" },
            record_name,
            result.is_ok()
        );
        result
    }
}

impl Drop for AppMetaManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
