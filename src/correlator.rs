//! Request/response correlator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scopewire_protocol::{Envelope, ResponseMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::ClientError;

/// A successful response (device errors are mapped to
/// [`ClientError::CommandRejected`] before a waiter ever sees them).
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u64,
    pub result: Value,
    pub received_at: Instant,
}

struct PendingEntry {
    deadline: Instant,
    completer: oneshot::Sender<Result<Response, ClientError>>,
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    write_tx: mpsc::Sender<String>,
    write_queue_timeout: Duration,
}

/// Issues request ids, tracks in-flight requests, and resolves them from
/// either a matching response, a timeout, or a bulk failure (disconnect or
/// cancellation). Cheap to clone; all clones share the same pending table.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
    reaper: Arc<JoinHandle<()>>,
}

impl Correlator {
    /// `write_tx` is the channel the transport's writer task drains.
    pub fn new(write_tx: mpsc::Sender<String>, write_queue_timeout: Duration) -> Correlator {
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            write_tx,
            write_queue_timeout,
        });

        let reaper_inner = inner.clone();
        let reaper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tick.tick().await;
                let now = Instant::now();
                let expired: Vec<PendingEntry> = {
                    let mut pending = reaper_inner.pending.lock().await;
                    let expired_ids: Vec<u64> = pending
                        .iter()
                        .filter(|(_, entry)| entry.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    expired_ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
                };
                for entry in expired {
                    let _ = entry.completer.send(Err(ClientError::Timeout));
                }
            }
        });

        Correlator { inner, reaper: Arc::new(reaper) }
    }

    /// Issue a new request and await its outcome.
    pub async fn issue(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(id, method, params);
        let line = envelope
            .encode_line()
            .map_err(|e| ClientError::ProtocolError(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, PendingEntry { deadline: Instant::now() + timeout, completer: tx });
        }

        let send_result =
            tokio::time::timeout(self.inner.write_queue_timeout, self.inner.write_tx.send(line)).await;
        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.remove_pending(id).await;
                return Err(ClientError::Disconnected);
            }
            Err(_) => {
                self.remove_pending(id).await;
                return Err(ClientError::Overloaded);
            }
        }

        rx.await.unwrap_or(Err(ClientError::Cancelled))
    }

    async fn remove_pending(&self, id: u64) {
        self.inner.pending.lock().await.remove(&id);
    }

    /// Complete a pending request from a device response. No-op if the id
    /// is unknown (already timed out, already completed, or from a prior
    /// session).
    pub async fn complete(&self, response: ResponseMessage) {
        let entry = self.inner.pending.lock().await.remove(&response.id);
        let Some(entry) = entry else { return };
        let outcome = match response.error {
            Some(err) => Err(ClientError::from_device_error(err)),
            None => Ok(Response {
                id: response.id,
                result: response.result.unwrap_or(Value::Null),
                received_at: Instant::now(),
            }),
        };
        let _ = entry.completer.send(outcome);
    }

    /// Fail every pending request with `error`, emptying the table
    /// atomically first so callers see a coherent "nothing in flight"
    /// state before any reconnect-completion signal is emitted.
    async fn drain_all(&self, error: ClientError) {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.completer.send(Err(error.clone()));
        }
    }

    /// Called when the transport reports a disconnect.
    /// Also resets the id counter to 1 for the next session. Draining
    /// happens first, in `drain_all`, before the counter moves, so no
    /// caller can ever observe a request using a post-reset id while a
    /// pre-reset one is still outstanding.
    pub async fn fail_all_disconnected(&self) {
        self.drain_all(ClientError::Disconnected).await;
        self.inner.next_id.store(1, Ordering::Relaxed);
    }

    /// Called on caller-initiated shutdown.
    pub async fn cancel_all(&self) {
        self.drain_all(ClientError::Cancelled).await;
    }

    /// Number of requests currently in flight. Exposed for tests verifying
    /// the pending table empties out.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        if Arc::strong_count(&self.reaper) == 1 {
            self.reaper.abort();
        }
    }
}
