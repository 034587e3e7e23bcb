//! Broadcast-based event bus shared by the execution engine and the
//! orchestrator.
//!
//! Publishing never awaits. Every observer owns a receiver and a receive
//! loop, so a slow, failing or panicking observer cannot affect the
//! publisher or other observers. Slow observers lag rather than block.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default broadcast channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Handle returned by [`EventBus::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
    observers: Mutex<HashMap<ObserverId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E>
where
    E: Clone + fmt::Debug + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Raw receiver for every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Run `callback` for every event published after this call.
    ///
    /// Errors and panics raised by the callback are logged and swallowed.
    /// Must be called from within a Tokio runtime.
    pub fn add_observer<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(observer = %id, ?event, "Observer failed: {:#}", e),
                        Err(_) => error!(observer = %id, ?event, "Observer panicked"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(observer = %id, lagged = n, "Observer lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(observer = %id, "Event bus closed");
                        break;
                    }
                }
            }
        });

        self.observers.lock().insert(id, handle);
        id
    }

    /// Stop an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        match self.observers.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E> Drop for EventBus<E> {
    fn drop(&mut self) {
        for (_, handle) in self.observers.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new(8);
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("a");
        bus.publish("b");
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_affect_others() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.add_observer(|_: &u32| Err(anyhow::anyhow!("always fails")));
        bus.add_observer(|n: &u32| {
            if *n == 2 {
                panic!("observer blew up");
            }
            Ok(())
        });
        let sink = seen.clone();
        bus.add_observer(move |n: &u32| {
            sink.lock().push(*n);
            Ok(())
        });

        for n in 1..=3 {
            bus.publish(n);
        }
        settle().await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(bus.observer_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_observer_stops_delivery() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(0u32));
        let sink = seen.clone();
        let id = bus.add_observer(move |_: &u32| {
            *sink.lock() += 1;
            Ok(())
        });

        bus.publish(1);
        settle().await;
        assert!(bus.remove_observer(id));
        assert!(!bus.remove_observer(id));
        settle().await;
        bus.publish(2);
        settle().await;

        assert_eq!(*seen.lock(), 1);
        assert_eq!(bus.observer_count(), 0);
    }
}
