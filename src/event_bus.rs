//! Publish/subscribe hub for device events.
//!
//! A `tokio::sync::broadcast` channel gives every subscriber its own read
//! cursor into a shared ring buffer, so a slow subscriber's overflow
//! (`RecvError::Lagged`) drops only that subscriber's oldest unread events
//! and never affects other subscribers' cursors.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::event::Event;

/// How long to wait between rate-limited overflow warnings for one subscriber.
const WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Which events a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    Kind(String),
    Wildcard,
}

impl SubscriptionKind {
    fn matches(&self, kind: &str) -> bool {
        match self {
            SubscriptionKind::Kind(k) => k == kind,
            SubscriptionKind::Wildcard => true,
        }
    }
}

/// A live subscription. Dropping it unsubscribes (the fan-out task stops
/// once the broadcast receiver and the task's own handle are both gone).
pub struct Subscription {
    task: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Total events dropped for this subscriber due to queue overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Publish/subscribe hub. Cheap to clone -- all clones share the same
/// underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(subscriber_queue_size: usize) -> EventBus {
        let (tx, _rx) = broadcast::channel(subscriber_queue_size.max(1));
        EventBus { tx }
    }

    /// Publish an event to all current subscribers. A no-subscriber channel
    /// is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to one kind (or [`SubscriptionKind::Wildcard`] for all).
    /// `handler` is invoked once per matching event, on its own fan-out
    /// task; a panicking handler call is caught and logged, and the
    /// subscriber stays enrolled rather than being torn down.
    pub fn subscribe<F, Fut>(&self, kind: SubscriptionKind, mut handler: F) -> Subscription
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_for_task = dropped.clone();
        let last_warned: Arc<StdMutex<Option<Instant>>> = Arc::new(StdMutex::new(None));

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !kind.matches(&event.kind) {
                            continue;
                        }
                        // Run the handler on its own task so a panic inside
                        // it doesn't kill this subscriber's fan-out loop --
                        // tokio isolates panics at the task boundary.
                        let fut = handler(event);
                        if tokio::spawn(fut).await.is_err() {
                            warn!("event subscriber handler panicked; subscriber stays enrolled");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped_for_task.fetch_add(n, Ordering::Relaxed);
                        let mut guard = last_warned.lock().unwrap();
                        let now = Instant::now();
                        let should_warn = guard.map(|t| now.duration_since(t) >= WARN_INTERVAL).unwrap_or(true);
                        if should_warn {
                            warn!(dropped = n, "event subscriber queue overflowed, dropping oldest events");
                            *guard = Some(now);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { task, dropped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn subscriber_receives_matching_kind_only() {
        let bus = EventBus::new(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe(SubscriptionKind::Kind("PiStatus".to_owned()), move |ev| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev.kind);
            }
        });

        bus.publish(Event::new("PiStatus", json!({})));
        bus.publish(Event::new("FocuserMove", json!({})));
        bus.publish(Event::new("PiStatus", json!({})));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, "PiStatus");
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, "PiStatus");
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_every_kind_in_publish_order() {
        let bus = EventBus::new(64);
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let _sub = bus.subscribe(SubscriptionKind::Wildcard, move |ev| {
            let order_clone = order_clone.clone();
            async move {
                order_clone.lock().unwrap().push(ev.kind);
            }
        });

        for kind in ["A", "B", "A", "C"] {
            bus.publish(Event::new(kind, json!(null)));
        }
        // Give the fan-out task a chance to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = order.lock().unwrap().clone();
        assert_eq!(got, vec!["A", "B", "A", "C"]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_unsubscribe() {
        let bus = EventBus::new(64);
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe(SubscriptionKind::Wildcard, move |ev| {
            let count_clone = count_clone.clone();
            async move {
                if ev.kind == "boom" {
                    panic!("handler exploded");
                }
                count_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        bus.publish(Event::new("boom", json!(null)));
        bus.publish(Event::new("ok", json!(null)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
