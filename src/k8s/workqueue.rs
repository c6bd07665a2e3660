/**
 * Deduplicating work queue
 *
 * A key is queued at most once at a time and handed to at most one worker at
 * a time. A key added while it is being processed is queued again when the
 * worker calls `done`.
 */
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::config::WatcherSettings;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    settings: WatcherSettings,
}

impl WorkQueue {
    #[must_use]
    pub fn new(settings: WatcherSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Next key to process, or `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as processed
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add `key` after a delay that grows with its failures
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock().await;
            let count = state.requeues.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.settings.requeue_delay(failures);
        debug!("Requeue {} in {:?} (failure {})", key, delay, failures);

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Stop tracking failures for `key`
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.requeues.remove(key);
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop handing out keys; blocked `get` calls return `None`.
    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(WatcherSettings {
            requeue_base_delay: Duration::from_millis(1),
            requeue_max_delay: Duration::from_millis(5),
            ..WatcherSettings::default()
        }))
    }

    #[tokio::test]
    async fn test_dedup_while_queued() {
        let queue = fast_queue();
        queue.add("dev/a").await;
        queue.add("dev/a").await;
        queue.add("dev/b").await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.get().await.as_deref(), Some("dev/a"));
        assert_eq!(queue.get().await.as_deref(), Some("dev/b"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_readd_while_processing_waits_for_done() {
        let queue = fast_queue();
        queue.add("dev/a").await;
        let key = queue.get().await.unwrap();

        queue.add("dev/a").await;
        assert!(queue.is_empty().await);

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await.as_deref(), Some("dev/a"));
    }

    #[tokio::test]
    async fn test_rate_limited_requeue() {
        let queue = fast_queue();
        queue.add("dev/a").await;
        let key = queue.get().await.unwrap();

        queue.add_rate_limited(&key).await;
        queue.done(&key).await;
        assert_eq!(queue.num_requeues(&key).await, 1);

        let again = tokio::time::timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap();
        assert_eq!(again.as_deref(), Some("dev/a"));

        queue.forget(&key).await;
        assert_eq!(queue.num_requeues(&key).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = fast_queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shut_down().await;

        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        queue.add("dev/late").await;
        assert!(queue.is_empty().await);
    }
}
