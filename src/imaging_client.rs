//! Imaging session: binary frame streaming, counters, and the RTSP adapter
//! seam.
//!
//! Streaming is controlled over the *control* channel (`StartStreaming` /
//! `StopStreaming` commands) while frames arrive on this separate binary
//! transport -- this client holds a handle to an already-connected
//! [`ControlClient`] for that purpose rather than re-implementing command
//! dispatch. The fan-out to frame subscribers reuses the event bus's
//! `broadcast` + `Lagged` drop-oldest policy.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use scopewire_protocol::{BinaryFrame, BinaryFrameKind};
use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{ClientConfig, Endpoint};
use crate::control_client::ControlClient;
use crate::error::ClientError;
use crate::status::StatusStore;
use crate::transport::{ImagingEvent, ImagingTransport};

const WARN_INTERVAL: Duration = Duration::from_secs(30);

/// A jump in consecutive frame timestamps larger than this is treated as a
/// skipped frame region. Placeholder threshold: the device does not
/// document its nominal inter-frame interval (see DESIGN.md).
const TIMESTAMP_JUMP_THRESHOLD_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Preview,
    Stack,
    Raw,
}

impl StreamMode {
    fn wire_name(self) -> &'static str {
        match self {
            StreamMode::Preview => "Preview",
            StreamMode::Stack => "Stack",
            StreamMode::Raw => "Raw",
        }
    }
}

/// A live frame subscription; dropping it unsubscribes.
pub struct FrameSubscription {
    task: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl FrameSubscription {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A pluggable external video source (e.g. an RTSP decoder) yielding
/// `BinaryFrame { kind: Preview, .. }` items. Its wire protocol is out of
/// scope for this crate; this is only the open/close seam the imaging
/// client needs to adopt one.
pub trait FrameSource: Send + Sync {
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<broadcast::Receiver<BinaryFrame>, ClientError>> + Send + '_>>;
    fn close(&self);
}

/// Second session, to the imaging port: start/stop streaming, the binary
/// frame reader, and the stacked/dropped/skipped counters.
pub struct ImagingClient {
    commands: Arc<ControlClient>,
    frame_tx: broadcast::Sender<BinaryFrame>,
    streaming: Arc<AtomicBool>,
    status: Arc<StatusStore>,
    protocol_errors: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    dispatch_task: JoinHandle<()>,
}

impl ImagingClient {
    /// `commands` is an already-connected control session used only to send
    /// `StartStreaming`/`StopStreaming`/`FetchImage`; `status` should be the
    /// same [`StatusStore`] the control session uses so observers see one
    /// consolidated snapshot.
    pub async fn connect(
        endpoint: &Endpoint,
        config: &ClientConfig,
        status: Arc<StatusStore>,
        commands: Arc<ControlClient>,
    ) -> Result<ImagingClient, ClientError> {
        let transport = ImagingTransport::connect(endpoint, config).await?;
        status.set_imaging_connected(true).await;

        let protocol_errors = transport.protocol_errors_handle();
        let (frame_tx, _rx) = broadcast::channel(config.subscriber_queue_size.max(1));
        let streaming = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let dispatch_task = tokio::spawn(run_imaging_dispatch(
            transport,
            frame_tx.clone(),
            streaming.clone(),
            status.clone(),
            shutdown.clone(),
        ));

        Ok(ImagingClient { commands, frame_tx, streaming, status, protocol_errors, shutdown, dispatch_task })
    }

    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Ask the device to begin producing frames. Resets the stacking
    /// counters for the new streaming session.
    pub async fn start_streaming(&self, mode: StreamMode) -> Result<(), ClientError> {
        self.commands.send("StartStreaming", json!({ "mode": mode.wire_name() })).await?;
        self.status.reset_stack_counters().await;
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop_streaming(&self) -> Result<(), ClientError> {
        self.commands.send("StopStreaming", json!({})).await?;
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub async fn fetch_image(&self, request: serde_json::Value) -> Result<serde_json::Value, ClientError> {
        self.commands.send("FetchImage", request).await
    }

    /// Subscribe to the binary frame stream. `handler` runs on its own task
    /// per frame, same isolation policy as the event bus.
    pub fn subscribe_frames<F, Fut>(&self, mut handler: F) -> FrameSubscription
    where
        F: FnMut(BinaryFrame) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.frame_tx.subscribe();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_for_task = dropped.clone();
        let last_warned: Arc<StdMutex<Option<Instant>>> = Arc::new(StdMutex::new(None));

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let fut = handler(frame);
                        if tokio::spawn(fut).await.is_err() {
                            warn!("frame subscriber handler panicked; subscriber stays enrolled");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped_for_task.fetch_add(n, Ordering::Relaxed);
                        let mut guard = last_warned.lock().unwrap();
                        let now = Instant::now();
                        let should_warn = guard.map(|t| now.duration_since(t) >= WARN_INTERVAL).unwrap_or(true);
                        if should_warn {
                            warn!(dropped = n, "frame subscriber queue overflowed, dropping oldest frames");
                            *guard = Some(now);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        FrameSubscription { task, dropped }
    }

    pub async fn disconnect(self) {
        self.shutdown.notify_waiters();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.dispatch_task).await;
    }
}

async fn run_imaging_dispatch(
    mut transport: ImagingTransport,
    frame_tx: broadcast::Sender<BinaryFrame>,
    streaming: Arc<AtomicBool>,
    status: Arc<StatusStore>,
    shutdown: Arc<Notify>,
) {
    let last_timestamp: StdMutex<Option<u64>> = StdMutex::new(None);

    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => {
                transport.close().await;
                status.set_imaging_connected(false).await;
                return;
            }
            event = transport.next_event() => {
                match event {
                    None => {
                        status.set_imaging_connected(false).await;
                        return;
                    }
                    Some(ImagingEvent::Frame(frame)) => {
                        classify_and_count(&frame, &status, &last_timestamp).await;
                        let _ = frame_tx.send(frame);
                    }
                    Some(ImagingEvent::Disconnected) => {
                        // The transport drops any in-flight partial frame
                        // silently; this is that one frame's counter entry.
                        status.record_dropped().await;
                        status.set_imaging_connected(false).await;
                        streaming.store(false, Ordering::SeqCst);
                    }
                    Some(ImagingEvent::Reconnected) => {
                        status.set_imaging_connected(true).await;
                        // Streaming does NOT auto-resume; caller must call
                        // `start_streaming` again.
                    }
                }
            }
        }
    }
}

async fn classify_and_count(frame: &BinaryFrame, status: &StatusStore, last_timestamp: &StdMutex<Option<u64>>) {
    if frame.kind == BinaryFrameKind::Stacked {
        status.record_stacked().await;
    }

    let mut guard = last_timestamp.lock().unwrap();
    if let Some(prev) = *guard {
        if frame.timestamp > prev && frame.timestamp - prev > TIMESTAMP_JUMP_THRESHOLD_MS {
            drop(guard);
            status.record_skipped().await;
            guard = last_timestamp.lock().unwrap();
        }
    }
    *guard = Some(frame.timestamp);
}
