/**
 * Application event bus
 *
 * Producers push dev-mode transitions; one consumer loop hands each of them,
 * in push order, to every registered listener in registration order.
 */
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::appmeta::{ApplicationEvent, EventType};
use crate::config::LISTENER_DELIVERY_ATTEMPTS;
use crate::error::Result;
use crate::k8s::Credential;

/// An event plus the application it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationEventPack {
    pub event: ApplicationEvent,
    pub namespace: String,
    pub app_name: String,
    pub credential: Credential,
}

impl ApplicationEventPack {
    #[must_use]
    pub fn desc(&self) -> String {
        format!(
            "Ns '{}', App '{}' Event '{} {} {} {}'",
            self.namespace,
            self.app_name,
            self.event.event_type,
            self.event.dev_type,
            self.event.resource_name,
            self.event.identifier
        )
    }
}

pub type Listener = Arc<dyn Fn(&ApplicationEventPack) -> Result<()> + Send + Sync>;

pub struct EventBus {
    queue: Mutex<VecDeque<ApplicationEventPack>>,
    available: Notify,
    listeners: RwLock<Vec<Listener>>,
    delivery_attempts: u32,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(LISTENER_DELIVERY_ATTEMPTS)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(delivery_attempts: u32) -> Self {
        Self::with_listeners(delivery_attempts, Vec::new())
    }

    #[must_use]
    pub fn with_listeners(delivery_attempts: u32, listeners: Vec<Listener>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            listeners: RwLock::new(listeners),
            delivery_attempts: delivery_attempts.max(1),
        }
    }

    /// Append `pack`; wakes the consumer if the queue was empty.
    pub async fn push(&self, pack: ApplicationEventPack) {
        let was_empty = {
            let mut queue = self.queue.lock().await;
            let was_empty = queue.is_empty();
            queue.push_back(pack);
            was_empty
        };
        if was_empty {
            self.available.notify_one();
        }
    }

    /// Wait for and remove the oldest pack
    pub async fn pop(&self) -> ApplicationEventPack {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(pack) = self.queue.lock().await.pop_front() {
                return pack;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn register_listener(&self, listener: Listener) {
        self.listeners.write().await.push(listener);
    }

    /// Spawn the consumer loop; it runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            info!("Application Event Listener Start Up...");
            loop {
                let pack = tokio::select! {
                    () = cancel.cancelled() => break,
                    pack = bus.pop() => pack,
                };
                bus.dispatch(&pack).await;
            }
            info!("Application Event Listener stopped");
        })
    }

    async fn dispatch(&self, pack: &ApplicationEventPack) {
        let listeners = self.listeners.read().await.clone();
        for listener in &listeners {
            self.deliver(listener, pack);
        }
    }

    fn deliver(&self, listener: &Listener, pack: &ApplicationEventPack) {
        for attempt in 1..=self.delivery_attempts {
            match catch_unwind(AssertUnwindSafe(|| listener(pack))) {
                Ok(Ok(())) => return,
                Ok(Err(e)) => warn!(
                    "Error occur while consume {}, {} (attempt {}/{})",
                    pack.desc(),
                    e,
                    attempt,
                    self.delivery_attempts
                ),
                Err(_) => warn!(
                    "Panic occur while consume {} (attempt {}/{})",
                    pack.desc(),
                    attempt,
                    self.delivery_attempts
                ),
            }
        }
        error!("Giving up delivering {}", pack.desc());
    }
}

/// Logs every dev-mode transition
#[must_use]
pub fn logging_listener() -> Listener {
    Arc::new(|pack: &ApplicationEventPack| -> Result<()> {
        let action = match pack.event.event_type {
            EventType::DevStart => "Start",
            EventType::DevEnd => "End",
        };
        info!(
            "Resource({} - {} - {}), Name({}) {} DevMode",
            pack.namespace, pack.app_name, pack.event.dev_type, pack.event.resource_name, action
        );
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appmeta::DevType;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn pack(resource: &str) -> ApplicationEventPack {
        ApplicationEventPack {
            event: ApplicationEvent::start(resource, "sess-1", &DevType::Deployment),
            namespace: "dev".to_string(),
            app_name: "bookinfo".to_string(),
            credential: Credential::empty(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let bus = EventBus::default();
        for name in ["a", "b", "c"] {
            bus.push(pack(name)).await;
        }

        assert_eq!(bus.pop().await.event.resource_name, "a");
        assert_eq!(bus.pop().await.event.resource_name, "b");
        assert_eq!(bus.pop().await.event.resource_name, "c");
        assert!(bus.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let bus = Arc::new(EventBus::default());
        let consumer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        bus.push(pack("web")).await;

        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event.resource_name, "web");
    }

    #[test]
    fn test_delivery_retries_then_gives_up() {
        let bus = EventBus::new(3);
        let calls = Arc::new(AtomicU32::new(0));
        let listener: Listener = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_: &ApplicationEventPack| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Custom("listener down".to_string()))
            })
        };

        bus.deliver(&listener, &pack("web"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let bus = EventBus::new(2);
        let listener: Listener = Arc::new(|_: &ApplicationEventPack| -> Result<()> { panic!("boom") });
        bus.deliver(&listener, &pack("web"));
    }
}
