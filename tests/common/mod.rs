#![allow(dead_code)]

use appmeta::appmeta::{RECORD_TYPE, SecretOperator, record_name};
use appmeta::config::WatcherSettings;
use appmeta::error::{Error, Result};
use appmeta::k8s::{ChannelFeed, ChannelSource, Credential, ErrorReporter};
use appmeta::manager::{ApplicationEventPack, Connection, Connector, Listener};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NS: &str = "dev";

pub fn fast_settings() -> WatcherSettings {
    WatcherSettings {
        requeue_base_delay: Duration::from_millis(1),
        requeue_max_delay: Duration::from_millis(10),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        ..WatcherSettings::default()
    }
}

pub fn app_record(app: &str, state: &str, dev_meta: &str) -> Secret {
    let mut data = BTreeMap::from([("s".to_string(), ByteString(state.as_bytes().to_vec()))]);
    if !dev_meta.is_empty() {
        data.insert("v".to_string(), ByteString(dev_meta.as_bytes().to_vec()));
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(record_name(app)),
            namespace: Some(NS.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some(RECORD_TYPE.to_string()),
        data: Some(data),
        ..Secret::default()
    }
}

/// Record without the mandatory state key
pub fn broken_record(app: &str) -> Secret {
    let mut secret = app_record(app, "INSTALLED", "");
    if let Some(data) = secret.data.as_mut() {
        data.clear();
        data.insert("m".to_string(), ByteString(b"kind: Service".to_vec()));
    }
    secret
}

#[derive(Default)]
pub struct MemoryOperator {
    pub secrets: Mutex<BTreeMap<String, Secret>>,
}

impl MemoryOperator {
    pub fn with(records: &[Secret]) -> Self {
        let op = Self::default();
        for record in records {
            op.put(record.clone());
        }
        op
    }

    pub fn put(&self, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets.lock().unwrap().insert(name, secret);
    }

    pub fn get_record(&self, name: &str) -> Option<Secret> {
        self.secrets.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl SecretOperator for MemoryOperator {
    async fn create(&self, _namespace: &str, secret: &Secret) -> Result<Secret> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.contains_key(&name) {
            return Err(Error::Custom(format!("{name} already exists")));
        }
        secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn get(&self, _namespace: &str, name: &str) -> Result<Secret> {
        self.get_record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn update(&self, _namespace: &str, secret: &Secret) -> Result<Secret> {
        self.put(secret.clone());
        Ok(secret.clone())
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn list_config_maps(&self, _namespace: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn delete_config_map(&self, _namespace: &str, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Hands out in-memory sources and keeps their feeds for the test to drive
pub struct FakeConnector {
    initial: Vec<Secret>,
    helm_initial: Option<Vec<Secret>>,
    helm_config_maps: Option<Vec<ConfigMap>>,
    helm_list_error: Option<String>,
    pub operator: Arc<MemoryOperator>,
    pub connects: AtomicUsize,
    pub sources: Mutex<Vec<Arc<ChannelSource<Secret>>>>,
    pub feeds: Mutex<Vec<ChannelFeed<Secret>>>,
    pub helm_feeds: Mutex<Vec<ChannelFeed<Secret>>>,
    pub helm_config_map_feeds: Mutex<Vec<ChannelFeed<ConfigMap>>>,
    delay: Duration,
}

impl FakeConnector {
    pub fn new(initial: Vec<Secret>) -> Self {
        Self {
            operator: Arc::new(MemoryOperator::with(&initial)),
            initial,
            helm_initial: None,
            helm_config_maps: None,
            helm_list_error: None,
            connects: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
            helm_feeds: Mutex::new(Vec::new()),
            helm_config_map_feeds: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_helm(mut self, releases: Vec<Secret>) -> Self {
        self.helm_initial = Some(releases);
        self
    }

    /// Releases kept by Helm's configmap driver
    #[must_use]
    pub fn with_helm_config_maps(mut self, releases: Vec<ConfigMap>) -> Self {
        self.helm_config_maps = Some(releases);
        self
    }

    /// Make listing Helm secrets fail with `message`
    #[must_use]
    pub fn with_failing_helm_list(mut self, message: &str) -> Self {
        self.helm_list_error = Some(message.to_string());
        self
    }

    /// Slow down `connect` so concurrent callers overlap
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn feed(&self, index: usize) -> ChannelFeed<Secret> {
        self.feeds.lock().unwrap()[index].clone()
    }

    pub fn helm_feed(&self, index: usize) -> ChannelFeed<Secret> {
        self.helm_feeds.lock().unwrap()[index].clone()
    }

    pub fn helm_config_map_feed(&self, index: usize) -> ChannelFeed<ConfigMap> {
        self.helm_config_map_feeds.lock().unwrap()[index].clone()
    }

    pub fn source(&self, index: usize) -> Arc<ChannelSource<Secret>> {
        Arc::clone(&self.sources.lock().unwrap()[index])
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _namespace: &str, _credential: &Credential) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let (source, feed) = ChannelSource::new(self.initial.clone());
        let source = Arc::new(source);
        self.sources.lock().unwrap().push(Arc::clone(&source));
        self.feeds.lock().unwrap().push(feed);

        let helm_release_source = self.helm_initial.as_ref().map(|releases| {
            let (mut helm_source, helm_feed) = ChannelSource::new(releases.clone());
            if let Some(message) = &self.helm_list_error {
                helm_source = helm_source.failing_list(message);
            }
            self.helm_feeds.lock().unwrap().push(helm_feed);
            Arc::new(helm_source) as Arc<dyn appmeta::k8s::RecordSource<Secret>>
        });
        let helm_config_map_source = self.helm_config_maps.as_ref().map(|releases| {
            let (cm_source, cm_feed) = ChannelSource::new(releases.clone());
            self.helm_config_map_feeds.lock().unwrap().push(cm_feed);
            Arc::new(cm_source) as Arc<dyn appmeta::k8s::RecordSource<ConfigMap>>
        });

        Ok(Connection {
            app_meta_source: source,
            helm_release_source,
            helm_config_map_source,
            operator: Arc::clone(&self.operator) as Arc<dyn SecretOperator>,
        })
    }
}

/// Collects every delivered pack
#[derive(Clone, Default)]
pub struct Collector {
    pub packs: Arc<Mutex<Vec<ApplicationEventPack>>>,
}

impl Collector {
    pub fn listener(&self) -> Listener {
        let packs = Arc::clone(&self.packs);
        Arc::new(move |pack: &ApplicationEventPack| -> Result<()> {
            packs.lock().unwrap().push(pack.clone());
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.packs.lock().unwrap().len()
    }

    /// `(event type, resource, identifier)` in delivery order
    pub fn seen(&self) -> Vec<(String, String, String)> {
        self.packs
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                (
                    p.event.event_type.to_string(),
                    p.event.resource_name.clone(),
                    p.event.identifier.clone(),
                )
            })
            .collect()
    }
}

/// Counts keys dropped after exhausting their retries
#[derive(Default)]
pub struct CountingReporter {
    pub dropped: Mutex<Vec<String>>,
}

impl ErrorReporter for CountingReporter {
    fn report(&self, _watcher: &str, key: &str, _err: &Error) {
        self.dropped.lock().unwrap().push(key.to_string());
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn triple(event_type: &str, resource: &str, identifier: &str) -> (String, String, String) {
    (event_type.to_string(), resource.to_string(), identifier.to_string())
}
