/**
 * Watch + reconcile controller
 *
 * Keeps a local store of the records a source delivers and feeds every
 * changed key through a [`Reconciler`] on a bounded number of workers.
 * Failed keys are retried with a growing delay and dropped after the
 * configured number of attempts.
 */
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::Resource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{Notice, RecordSource, object_key};
use super::workqueue::WorkQueue;
use crate::config::WatcherSettings;
use crate::error::{Error, Result};

/// Applies one key's change to local state
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    async fn create_or_update(&self, key: &str, obj: &K) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Short label used in logs
    fn describe(&self) -> String;
}

/// Receives keys that exhausted their retries
pub trait ErrorReporter: Send + Sync {
    fn report(&self, watcher: &str, key: &str, err: &Error);
}

/// Reports dropped keys through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, watcher: &str, key: &str, err: &Error) {
        error!("❌ {} dropping key {} out of the queue: {}", watcher, key, err);
    }
}

pub struct Controller<K, R> {
    source: Arc<dyn RecordSource<K>>,
    reconciler: Arc<R>,
    store: RwLock<HashMap<String, K>>,
    /// One reconcile at a time per key, across workers and `apply_now`
    guards: DashMap<String, Arc<Mutex<()>>>,
    queue: Arc<WorkQueue>,
    settings: WatcherSettings,
    reporter: Arc<dyn ErrorReporter>,
    cancel: CancellationToken,
}

impl<K, R> Controller<K, R>
where
    K: Resource + Clone + Send + Sync + 'static,
    R: Reconciler<K> + 'static,
{
    #[must_use]
    pub fn new(
        source: Arc<dyn RecordSource<K>>,
        reconciler: Arc<R>,
        settings: WatcherSettings,
        reporter: Arc<dyn ErrorReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            reconciler,
            store: RwLock::new(HashMap::new()),
            guards: DashMap::new(),
            queue: Arc::new(WorkQueue::new(settings.clone())),
            settings,
            reporter,
            cancel,
        }
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// List once and reconcile every record before any change is processed.
    ///
    /// Per-record failures are logged; the watch that follows retries them.
    /// Returns how many records were listed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the source can not be listed
    pub async fn prepare(&self) -> Result<usize> {
        let items = self.source.list().await?;
        let count = items.len();
        info!("🔍 {} found {} records", self.reconciler.describe(), count);

        let mut store = self.store.write().await;
        for obj in items {
            let key = object_key(&obj);
            if let Err(e) = self.reconciler.create_or_update(&key, &obj).await {
                warn!("{} failed to prepare {}: {}", self.reconciler.describe(), key, e);
            }
            store.insert(key, obj);
        }
        Ok(count)
    }

    /// Record a change the caller observed itself and queue it for reconcile
    pub async fn apply(&self, key: &str, obj: Option<K>) {
        {
            let mut store = self.store.write().await;
            match obj {
                Some(obj) => store.insert(key.to_string(), obj),
                None => store.remove(key),
            };
        }
        self.queue.add(key).await;
    }

    /// Like [`Controller::apply`], but reconciles in the caller's task and
    /// returns the outcome instead of retrying.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the reconciler rejects the change
    pub async fn apply_now(&self, key: &str, obj: Option<K>) -> Result<()> {
        let guard = self.guard(key);
        let _held = guard.lock().await;
        {
            let mut store = self.store.write().await;
            match &obj {
                Some(obj) => store.insert(key.to_string(), obj.clone()),
                None => store.remove(key),
            };
        }
        match obj {
            Some(obj) => self.reconciler.create_or_update(key, &obj).await,
            None => self.reconciler.delete(key).await,
        }
    }

    /// Records currently in the local store
    pub async fn snapshot(&self) -> Vec<K> {
        self.store.read().await.values().cloned().collect()
    }

    /// Run workers and the watch until cancelled or the watch can't be restored.
    ///
    /// # Errors
    ///
    /// Will return `Err(Error::FatalWatch)` when the restart budget is exhausted
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let workers: Vec<_> = (0..self.settings.workers.max(1))
            .map(|_| {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.work().await })
            })
            .collect();
        info!("🔍 Starting {} watcher", self.reconciler.describe());

        let result = tokio::select! {
            () = self.cancel.cancelled() => Ok(()),
            result = self.watch() => result,
        };

        self.queue.shut_down().await;
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("{} worker ended abnormally: {}", self.reconciler.describe(), e);
            }
        }
        info!("{} watcher stopped", self.reconciler.describe());
        result
    }

    async fn work(&self) {
        while let Some(key) = self.queue.get().await {
            let result = self.invoke(&key).await;
            self.handle_err(&key, result).await;
            self.queue.done(&key).await;
        }
    }

    fn guard(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.guards.entry(key.to_string()).or_default().value())
    }

    async fn invoke(&self, key: &str) -> Result<()> {
        let guard = self.guard(key);
        let _held = guard.lock().await;
        let obj = self.store.read().await.get(key).cloned();
        match obj {
            Some(obj) => self.reconciler.create_or_update(key, &obj).await,
            None => self.reconciler.delete(key).await,
        }
    }

    async fn handle_err(&self, key: &str, result: Result<()>) {
        let Err(e) = result else {
            self.queue.forget(key).await;
            return;
        };

        let attempts = self.queue.num_requeues(key).await + 1;
        if attempts < self.settings.max_reconcile_attempts {
            warn!(
                "{} error syncing {} (attempt {}/{}): {}",
                self.reconciler.describe(),
                key,
                attempts,
                self.settings.max_reconcile_attempts,
                e
            );
            self.queue.add_rate_limited(key).await;
            return;
        }

        self.queue.forget(key).await;
        self.reporter.report(&self.reconciler.describe(), key, &e);
    }

    async fn watch(&self) -> Result<()> {
        let describe = self.reconciler.describe();
        let mut failures = 0_u32;
        let mut backoff = self.settings.initial_backoff;

        loop {
            let mut stream = self.source.subscribe();
            let mut relist: Option<HashMap<String, K>> = None;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(notice) => {
                        failures = 0;
                        backoff = self.settings.initial_backoff;
                        self.observe(notice, &mut relist).await;
                    }
                    Err(Error::FatalWatch(msg)) => return Err(Error::FatalWatch(msg)),
                    Err(e) => {
                        failures += 1;
                        self.check_budget(&describe, failures, &e)?;
                        error!(
                            "❌ {} watch failed (attempt {}/{}): {}, retrying in {:?}",
                            describe, failures, self.settings.max_watch_restarts, e, backoff
                        );
                        backoff = self.back_off(backoff).await;
                    }
                }
            }

            failures += 1;
            let ended = Error::Custom("watch stream ended".to_string());
            self.check_budget(&describe, failures, &ended)?;
            info!("🔍 {} watch stream ended, restarting in {:?}", describe, backoff);
            backoff = self.back_off(backoff).await;
        }
    }

    fn check_budget(&self, describe: &str, failures: u32, cause: &Error) -> Result<()> {
        if failures < self.settings.max_watch_restarts {
            return Ok(());
        }
        error!(
            "❌ {} exceeded maximum restart attempts ({}), stopping",
            describe, self.settings.max_watch_restarts
        );
        Err(Error::FatalWatch(format!("{describe}: {cause}")))
    }

    async fn back_off(&self, current: Duration) -> Duration {
        sleep(current).await;
        current.saturating_mul(2).min(self.settings.max_backoff)
    }

    async fn observe(&self, notice: Notice<K>, relist: &mut Option<HashMap<String, K>>) {
        match notice {
            Notice::Applied(obj) => {
                let key = object_key(&obj);
                debug!("📝 {} applied", key);
                self.apply(&key, Some(obj)).await;
            }
            Notice::Deleted(obj) => {
                let key = object_key(&obj);
                debug!("🗑️  {} deleted", key);
                self.apply(&key, None).await;
            }
            Notice::RelistStarted => *relist = Some(HashMap::new()),
            Notice::Relisted(obj) => {
                if let Some(buffer) = relist.as_mut() {
                    buffer.insert(object_key(&obj), obj);
                } else {
                    self.apply(&object_key(&obj), Some(obj)).await;
                }
            }
            Notice::RelistDone => {
                let Some(fresh) = relist.take() else {
                    return;
                };
                let keys: Vec<String> = {
                    let mut store = self.store.write().await;
                    let mut keys: Vec<String> = store.keys().cloned().collect();
                    keys.extend(fresh.keys().filter(|k| !store.contains_key(*k)).cloned());
                    *store = fresh;
                    keys
                };
                debug!("Relist complete, {} keys to reconcile", keys.len());
                for key in keys {
                    self.queue.add(&key).await;
                }
            }
        }
    }
}
