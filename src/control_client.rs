//! High-level façade over the control channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scopewire_protocol::IncomingMessage;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::event::{Event, KIND_INTERNAL_DISCONNECTED, KIND_INTERNAL_RECONNECTED, KIND_PI_STATUS};
use crate::event_bus::{EventBus, Subscription, SubscriptionKind};
use crate::status::{Snapshot, StatusStore};
use crate::transport::{ControlTransport, TransportEvent};

/// Commands re-issued after a reconnect to refresh the status store.
const RECONNECT_REFRESH_COMMANDS: [&str; 3] = ["GetDeviceState", "GetTime", "PiStatus"];

/// Per-call overrides for [`ControlClient::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// If the transport is currently reconnecting, block up to
    /// `reconnect_wait_timeout` for it to come back instead of failing fast.
    pub wait_for_reconnect: bool,
}

/// Composes the control transport, correlator, event bus, and status store
/// into one session. One `ControlClient` is one device session: `connect()`
/// begins it, `disconnect()` ends it.
pub struct ControlClient {
    config: ClientConfig,
    correlator: Correlator,
    event_bus: EventBus,
    status: Arc<StatusStore>,
    connected_rx: watch::Receiver<bool>,
    pub(crate) shutdown: Arc<Notify>,
    dispatch_task: JoinHandle<()>,
    protocol_errors: Arc<AtomicU64>,
}

impl ControlClient {
    pub async fn connect(endpoint: Endpoint, config: ClientConfig) -> Result<ControlClient, ClientError> {
        let transport = ControlTransport::connect(&endpoint, &config).await?;
        let write_tx = transport.write_tx();
        let protocol_errors = transport.protocol_errors_handle();
        let correlator = Correlator::new(write_tx, config.write_queue_timeout);
        let event_bus = EventBus::new(config.subscriber_queue_size);
        let status = Arc::new(StatusStore::new());
        status.set_control_connected(true).await;

        let (connected_tx, connected_rx) = watch::channel(true);
        let shutdown = Arc::new(Notify::new());

        let dispatch_task = tokio::spawn(run_dispatch_loop(
            transport,
            correlator.clone(),
            event_bus.clone(),
            status.clone(),
            connected_tx,
            shutdown.clone(),
            config.command_timeout,
        ));

        Ok(ControlClient {
            config,
            correlator,
            event_bus,
            status,
            connected_rx,
            shutdown,
            dispatch_task,
            protocol_errors,
        })
    }

    /// Count of malformed lines seen since connecting (counted, non-fatal).
    /// Not reset across reconnects.
    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Send a command with default options (fail-fast on reconnect).
    pub async fn send(&self, method: impl Into<String>, params: Value) -> Result<Value, ClientError> {
        self.send_with(method, params, SendOptions::default()).await
    }

    /// Check the connected precondition, submit with a `command_timeout`
    /// deadline, and map a device `error` into `CommandRejected` (done
    /// inside the Correlator).
    pub async fn send_with(
        &self,
        method: impl Into<String>,
        params: Value,
        opts: SendOptions,
    ) -> Result<Value, ClientError> {
        if !*self.connected_rx.borrow() {
            if !opts.wait_for_reconnect {
                return Err(ClientError::Disconnected);
            }
            self.wait_for_reconnect().await?;
        }

        let response = self.correlator.issue(method, params, self.config.command_timeout).await?;
        Ok(response.result)
    }

    async fn wait_for_reconnect(&self) -> Result<(), ClientError> {
        let mut rx = self.connected_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(self.config.reconnect_wait_timeout, wait).await.map_err(|_| ClientError::Disconnected)
    }

    pub fn subscribe<F, Fut>(&self, kind: SubscriptionKind, handler: F) -> Subscription
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_bus.subscribe(kind, handler)
    }

    pub async fn status(&self) -> Snapshot {
        self.status.snapshot().await
    }

    /// Share this session's status store with an [`ImagingClient`] so both
    /// sessions contribute to one consolidated snapshot.
    pub fn status_store(&self) -> Arc<StatusStore> {
        self.status.clone()
    }

    pub fn is_control_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Cancel in-flight requests, tear down the transport, and wait for the
    /// dispatch task to exit: within 1s of `disconnect()`, the pending
    /// table is empty and the reader isn't running.
    pub async fn disconnect(self) {
        self.shutdown.notify_waiters();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.dispatch_task).await;
    }
}

/// Scoped acquisition: connect, run `body`, then always disconnect --
/// regardless of whether `body` returned `Ok` or `Err`.
pub async fn with_session<F, Fut, T>(endpoint: Endpoint, config: ClientConfig, body: F) -> Result<T, ClientError>
where
    F: FnOnce(&ControlClient) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let client = ControlClient::connect(endpoint, config).await?;
    let result = body(&client).await;
    client.disconnect().await;
    result
}

async fn run_dispatch_loop(
    mut transport: ControlTransport,
    correlator: Correlator,
    event_bus: EventBus,
    status: Arc<StatusStore>,
    connected_tx: watch::Sender<bool>,
    shutdown: Arc<Notify>,
    command_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => {
                transport.close().await;
                status.set_control_connected(false).await;
                correlator.cancel_all().await;
                return;
            }
            event = transport.next_event() => {
                match event {
                    None => {
                        status.set_control_connected(false).await;
                        correlator.fail_all_disconnected().await;
                        let _ = connected_tx.send(false);
                        return;
                    }
                    Some(TransportEvent::Message(IncomingMessage::Response(r))) => {
                        correlator.complete(r).await;
                    }
                    Some(TransportEvent::Message(IncomingMessage::Event(e))) => {
                        let event = Event::new(e.kind, e.payload);
                        status.apply_event(&event).await;
                        event_bus.publish(event);
                    }
                    Some(TransportEvent::Message(IncomingMessage::Notification(v))) => {
                        debug!(?v, "dropping unclassified notification");
                    }
                    Some(TransportEvent::Disconnected) => {
                        status.set_control_connected(false).await;
                        correlator.fail_all_disconnected().await;
                        let _ = connected_tx.send(false);
                        event_bus.publish(Event::new(KIND_INTERNAL_DISCONNECTED, Value::Null));
                    }
                    Some(TransportEvent::Reconnected) => {
                        status.set_control_connected(true).await;
                        let _ = connected_tx.send(true);
                        event_bus.publish(Event::new(KIND_INTERNAL_RECONNECTED, Value::Null));
                        spawn_reconnect_refresh(correlator.clone(), status.clone(), command_timeout);
                    }
                }
            }
        }
    }
}

fn spawn_reconnect_refresh(correlator: Correlator, status: Arc<StatusStore>, command_timeout: Duration) {
    tokio::spawn(async move {
        for method in RECONNECT_REFRESH_COMMANDS {
            match correlator.issue(method, Value::Object(Default::default()), command_timeout).await {
                Ok(response) => {
                    if method == "PiStatus" {
                        let event = Event::new(KIND_PI_STATUS, response.result);
                        status.apply_event(&event).await;
                    }
                }
                Err(error) => {
                    warn!(method, %error, "post-reconnect refresh command failed");
                }
            }
        }
    });
}

/// RAII fallback for callers that forget to call [`ControlClient::disconnect`]
/// explicitly. Rust has no async `Drop`, so the best this can do on drop is
/// signal shutdown synchronously; prefer [`with_session`] or an explicit
/// `disconnect().await` when you can guarantee an async exit path.
pub struct ControlSession(Option<ControlClient>);

impl ControlSession {
    pub async fn open(endpoint: Endpoint, config: ClientConfig) -> Result<ControlSession, ClientError> {
        Ok(ControlSession(Some(ControlClient::connect(endpoint, config).await?)))
    }

    pub async fn disconnect(mut self) {
        if let Some(client) = self.0.take() {
            client.disconnect().await;
        }
    }
}

impl std::ops::Deref for ControlSession {
    type Target = ControlClient;

    fn deref(&self) -> &ControlClient {
        self.0.as_ref().expect("ControlSession used after disconnect")
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if let Some(client) = &self.0 {
            client.shutdown.notify_waiters();
        }
    }
}
