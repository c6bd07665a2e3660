/**
 * Record sources
 *
 * A source lists the records of one kind in one namespace and streams the
 * changes that follow. The cluster-backed source wraps the kube runtime
 * watcher; the channel-backed source is driven by hand.
 */
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::{Error, Result};

/// One change delivered by a source
#[derive(Debug, Clone)]
pub enum Notice<K> {
    Applied(K),
    Deleted(K),
    /// The source is re-listing; `Relisted` items follow, then `RelistDone`
    RelistStarted,
    Relisted(K),
    RelistDone,
}

impl<K> From<watcher::Event<K>> for Notice<K> {
    fn from(event: watcher::Event<K>) -> Self {
        match event {
            watcher::Event::Apply(obj) => Self::Applied(obj),
            watcher::Event::Delete(obj) => Self::Deleted(obj),
            watcher::Event::Init => Self::RelistStarted,
            watcher::Event::InitApply(obj) => Self::Relisted(obj),
            watcher::Event::InitDone => Self::RelistDone,
        }
    }
}

/// `namespace/name`, the key records are tracked under
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

#[async_trait]
pub trait RecordSource<K>: Send + Sync {
    /// Full listing of the current records
    async fn list(&self) -> Result<Vec<K>>;

    /// Changes from now on. Errors are transient unless the stream ends.
    fn subscribe(&self) -> BoxStream<'static, Result<Notice<K>>>;
}

/// Records of one kind in one namespace, filtered server-side
pub struct KubeSource<K> {
    api: Api<K>,
    list_params: ListParams,
    watch_config: watcher::Config,
}

impl<K> KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Records matching a field selector, e.g. `type=...`
    #[must_use]
    pub fn with_fields(api: Api<K>, fields: &str) -> Self {
        Self {
            api,
            list_params: ListParams::default().fields(fields),
            watch_config: watcher::Config::default().fields(fields),
        }
    }

    /// Records matching a label selector, e.g. `owner=helm`
    #[must_use]
    pub fn with_labels(api: Api<K>, labels: &str) -> Self {
        Self {
            api,
            list_params: ListParams::default().labels(labels),
            watch_config: watcher::Config::default().labels(labels),
        }
    }
}

#[async_trait]
impl<K> RecordSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.api.list(&self.list_params).await?.items)
    }

    fn subscribe(&self) -> BoxStream<'static, Result<Notice<K>>> {
        watcher(self.api.clone(), self.watch_config.clone())
            .map(|event| event.map(Notice::from).map_err(Error::from))
            .boxed()
    }
}

/// A source fed through a [`ChannelFeed`].
///
/// The first `subscribe` receives the feed's changes; the stream ends when the
/// feed is closed. Later subscriptions fail immediately.
pub struct ChannelSource<K> {
    records: Arc<Mutex<BTreeMap<String, K>>>,
    receiver: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<Notice<K>>>>>,
    lists: AtomicUsize,
    list_error: Option<String>,
}

/// Handle that drives a [`ChannelSource`]
#[derive(Clone)]
pub struct ChannelFeed<K> {
    records: Arc<Mutex<BTreeMap<String, K>>>,
    sender: mpsc::UnboundedSender<Result<Notice<K>>>,
}

impl<K: Resource + Clone + Send + Sync + 'static> ChannelSource<K> {
    #[must_use]
    pub fn new(initial: Vec<K>) -> (Self, ChannelFeed<K>) {
        let records: BTreeMap<String, K> = initial
            .into_iter()
            .map(|obj| (object_key(&obj), obj))
            .collect();
        let records = Arc::new(Mutex::new(records));
        let (sender, receiver) = mpsc::unbounded_channel();
        let source = Self {
            records: Arc::clone(&records),
            receiver: std::sync::Mutex::new(Some(receiver)),
            lists: AtomicUsize::new(0),
            list_error: None,
        };
        (source, ChannelFeed { records, sender })
    }

    /// Every `list` fails with `message`, as an unavailable API server would
    #[must_use]
    pub fn failing_list(mut self, message: &str) -> Self {
        self.list_error = Some(message.to_string());
        self
    }

    /// How many times the source was listed
    #[must_use]
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K: Resource + Clone + Send + Sync + 'static> RecordSource<K> for ChannelSource<K> {
    async fn list(&self) -> Result<Vec<K>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.list_error {
            return Err(Error::Custom(message.clone()));
        }
        Ok(self.records.lock().await.values().cloned().collect())
    }

    fn subscribe(&self) -> BoxStream<'static, Result<Notice<K>>> {
        let receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take());
        match receiver {
            Some(receiver) => UnboundedReceiverStream::new(receiver).boxed(),
            None => stream::once(async {
                Err(Error::FatalWatch("channel source already consumed".to_string()))
            })
            .boxed(),
        }
    }
}

impl<K: Resource + Clone + Send + Sync + 'static> ChannelFeed<K> {
    /// Store `obj` and announce it. Returns false once the source is gone.
    pub async fn apply(&self, obj: K) -> bool {
        self.records
            .lock()
            .await
            .insert(object_key(&obj), obj.clone());
        self.sender.send(Ok(Notice::Applied(obj))).is_ok()
    }

    pub async fn delete(&self, obj: K) -> bool {
        self.records.lock().await.remove(&object_key(&obj));
        self.sender.send(Ok(Notice::Deleted(obj))).is_ok()
    }

    /// Replace every record with `objs` and announce it as a full re-list,
    /// as the watch does after it lost track of changes
    pub async fn relist(&self, objs: Vec<K>) -> bool {
        {
            let mut records = self.records.lock().await;
            records.clear();
            for obj in &objs {
                records.insert(object_key(obj), obj.clone());
            }
        }
        let mut sent = self.sender.send(Ok(Notice::RelistStarted)).is_ok();
        for obj in objs {
            sent &= self.sender.send(Ok(Notice::Relisted(obj))).is_ok();
        }
        sent && self.sender.send(Ok(Notice::RelistDone)).is_ok()
    }

    /// Deliver a stream error, as a broken connection would
    pub fn fail(&self, message: &str) -> bool {
        debug!("Injecting source failure: {}", message);
        self.sender
            .send(Err(Error::Custom(message.to_string())))
            .is_ok()
    }
}
