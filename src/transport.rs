//! Reconnecting framed transports for the control (text) and imaging
//! (binary) TCP channels.
//!
//! A background task owns the socket exclusively and posts everything it
//! observes through a channel, with no back-reference to any caller --
//! callers only ever see [`TransportEvent`]/[`ImagingEvent`] plus a sender
//! for outgoing writes.

use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use scopewire_protocol::{
    BinaryFrame, BinaryFrameKind, BinaryHeader, BinaryHeaderError, IncomingMessage, BINARY_HEADER_LEN,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backoff;
use crate::config::{ClientConfig, Endpoint};
use crate::error::ClientError;

const EVENT_CHANNEL_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Control (text) transport
// ---------------------------------------------------------------------------

/// Something observed on the control channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(IncomingMessage),
    Disconnected,
    Reconnected,
}

enum SessionEnd {
    Closed,
    Disconnected,
}

/// Owns the control-channel socket and runs its reconnect loop on a
/// background task.
pub struct ControlTransport {
    events: mpsc::Receiver<TransportEvent>,
    write_tx: mpsc::Sender<String>,
    protocol_errors: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ControlTransport {
    /// Connect, failing fast with [`ClientError::ConnectFailed`] if the
    /// initial TCP connect doesn't complete within `config.connect_timeout`.
    /// Once connected, reconnects are handled transparently by the
    /// background task.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<ControlTransport, ClientError> {
        let addr = endpoint.control_addr();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectFailed(format!("connect to {addr} timed out")))?
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (write_tx, write_rx) = mpsc::channel::<String>(config.write_queue_size.max(1));
        let protocol_errors = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_control_loop(
            addr,
            stream,
            event_tx,
            write_rx,
            config.clone(),
            protocol_errors.clone(),
            shutdown.clone(),
            closed.clone(),
        ));

        Ok(ControlTransport { events: event_rx, write_tx, protocol_errors, shutdown, closed, task })
    }

    /// A cloneable handle callers use to enqueue outgoing lines. Bounded by
    /// `write_queue_size`; a full queue is the caller's (Correlator's)
    /// problem to time out on, not this transport's.
    pub fn write_tx(&self) -> mpsc::Sender<String> {
        self.write_tx.clone()
    }

    /// Await the next transport-level event. Returns `None` once the
    /// background task has exited for good (closed, or reconnect attempts
    /// exhausted).
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// A cloneable counter handle, obtainable before the transport is moved
    /// into a dispatch task that only ever calls `next_event`.
    pub fn protocol_errors_handle(&self) -> Arc<AtomicU64> {
        self.protocol_errors.clone()
    }

    /// Tear down promptly, even mid-reconnect-backoff -- preempts an
    /// in-progress backoff sleep rather than waiting it out.
    pub async fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.task).await;
    }
}

async fn run_control_loop(
    addr: String,
    mut stream: TcpStream,
    event_tx: mpsc::Sender<TransportEvent>,
    mut write_rx: mpsc::Receiver<String>,
    config: ClientConfig,
    protocol_errors: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let end = run_control_session(
            &mut reader,
            &mut writer,
            &event_tx,
            &mut write_rx,
            &config,
            &protocol_errors,
            &shutdown,
        )
        .await;

        match end {
            SessionEnd::Closed => return,
            SessionEnd::Disconnected => {
                if event_tx.send(TransportEvent::Disconnected).await.is_err() {
                    return;
                }
            }
        }

        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(max) = config.reconnect.max_attempts {
                if attempt >= max {
                    return;
                }
            }

            let delay = backoff::next_delay(&config.reconnect, attempt);
            attempt += 1;

            tokio::select! {
                biased;
                () = shutdown.notified() => return,
                () = tokio::time::sleep(delay) => {}
            }

            match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(new_stream)) => {
                    stream = new_stream;
                    attempt = 0;
                    // Anything still queued here was written by a caller
                    // that had not yet observed `Disconnected`, or queued
                    // during the backoff wait itself -- it targeted a
                    // socket that no longer exists. Drop it before the new
                    // session's writer starts pulling from this receiver,
                    // or it would get silently delivered on the new
                    // connection.
                    drain_write_queue(&mut write_rx);
                    if event_tx.send(TransportEvent::Reconnected).await.is_err() {
                        return;
                    }
                    break;
                }
                _ => continue,
            }
        }
    }
}

/// Discard everything currently buffered in the outgoing-write queue without
/// blocking. Called once per reconnect, before the new session's writer
/// starts draining the same receiver.
fn drain_write_queue(write_rx: &mut mpsc::Receiver<String>) {
    loop {
        match write_rx.try_recv() {
            Ok(_) => continue,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
        }
    }
}

async fn run_control_session(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    event_tx: &mpsc::Sender<TransportEvent>,
    write_rx: &mut mpsc::Receiver<String>,
    config: &ClientConfig,
    protocol_errors: &Arc<AtomicU64>,
    shutdown: &Notify,
) -> SessionEnd {
    let mut write_closed = false;

    loop {
        let mut line_buf = String::new();

        tokio::select! {
            biased;
            () = shutdown.notified() => return SessionEnd::Closed,
            read_result = tokio::time::timeout(config.read_idle_timeout, reader.read_line(&mut line_buf)) => {
                match read_result {
                    Ok(Ok(0)) => return SessionEnd::Disconnected,
                    Ok(Ok(_)) => {
                        let trimmed = line_buf.trim_end_matches(['\n', '\r']);
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(trimmed) {
                            Ok(value) => {
                                let msg = IncomingMessage::classify(value);
                                if event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                    return SessionEnd::Closed;
                                }
                            }
                            Err(e) => {
                                protocol_errors.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "malformed JSON line on control channel, dropping");
                            }
                        }
                    }
                    Ok(Err(_)) | Err(_) => return SessionEnd::Disconnected,
                }
            }
            outgoing = async {
                if write_closed { pending::<Option<String>>().await } else { write_rx.recv().await }
            } => {
                match outgoing {
                    Some(line) => {
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                        if writer.flush().await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    None => write_closed = true,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Imaging (binary) transport
// ---------------------------------------------------------------------------

/// Something observed on the imaging channel.
#[derive(Debug, Clone)]
pub enum ImagingEvent {
    Frame(BinaryFrame),
    Disconnected,
    Reconnected,
}

/// Read-only binary transport: the imaging channel never carries
/// caller-originated writes in this design (streaming is controlled over
/// the control channel; see the imaging client's module doc).
pub struct ImagingTransport {
    events: mpsc::Receiver<ImagingEvent>,
    protocol_errors: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ImagingTransport {
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<ImagingTransport, ClientError> {
        let addr = endpoint.imaging_addr();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectFailed(format!("connect to {addr} timed out")))?
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let protocol_errors = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_imaging_loop(
            addr,
            stream,
            event_tx,
            config.clone(),
            protocol_errors.clone(),
            shutdown.clone(),
            closed.clone(),
        ));

        Ok(ImagingTransport { events: event_rx, protocol_errors, shutdown, closed, task })
    }

    pub async fn next_event(&mut self) -> Option<ImagingEvent> {
        self.events.recv().await
    }

    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// A cloneable counter handle, obtainable before the transport is moved
    /// into a dispatch task that only ever calls `next_event`.
    pub fn protocol_errors_handle(&self) -> Arc<AtomicU64> {
        self.protocol_errors.clone()
    }

    pub async fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.task).await;
    }
}

async fn run_imaging_loop(
    addr: String,
    mut stream: TcpStream,
    event_tx: mpsc::Sender<ImagingEvent>,
    config: ClientConfig,
    protocol_errors: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let disconnected = run_imaging_session(&mut stream, &event_tx, &config, &protocol_errors, &shutdown).await;
        if matches!(disconnected, SessionEnd::Closed) {
            return;
        }
        if event_tx.send(ImagingEvent::Disconnected).await.is_err() {
            return;
        }

        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(max) = config.reconnect.max_attempts {
                if attempt >= max {
                    return;
                }
            }

            let delay = backoff::next_delay(&config.reconnect, attempt);
            attempt += 1;

            tokio::select! {
                biased;
                () = shutdown.notified() => return,
                () = tokio::time::sleep(delay) => {}
            }

            match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(new_stream)) => {
                    stream = new_stream;
                    attempt = 0;
                    if event_tx.send(ImagingEvent::Reconnected).await.is_err() {
                        return;
                    }
                    break;
                }
                _ => continue,
            }
        }
    }
}

async fn run_imaging_session(
    stream: &mut TcpStream,
    event_tx: &mpsc::Sender<ImagingEvent>,
    config: &ClientConfig,
    protocol_errors: &Arc<AtomicU64>,
    shutdown: &Notify,
) -> SessionEnd {
    loop {
        let mut header_buf = [0u8; BINARY_HEADER_LEN];

        tokio::select! {
            biased;
            () = shutdown.notified() => return SessionEnd::Closed,
            read_result = tokio::time::timeout(config.read_idle_timeout, stream.read_exact(&mut header_buf)) => {
                match read_result {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => return SessionEnd::Disconnected,
                }
            }
        }

        let header = match BinaryHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "malformed binary header, disconnecting to resync");
                return SessionEnd::Disconnected;
            }
        };

        // Reject before allocating: never materialize a payload buffer
        // larger than the configured cap.
        if header.length > config.max_frame {
            protocol_errors.fetch_add(
                1,
                Ordering::Relaxed,
            );
            let err = BinaryHeaderError::LengthExceedsMax { length: header.length, max_frame: config.max_frame };
            warn!(error = %err, "oversized binary frame rejected without allocating payload");
            return SessionEnd::Disconnected;
        }

        let kind = match BinaryFrameKind::try_from(header.kind) {
            Ok(k) => k,
            Err(raw) => {
                protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(kind = raw, "unknown binary frame kind, disconnecting to resync");
                return SessionEnd::Disconnected;
            }
        };

        let mut payload = vec![0u8; header.payload_len()];
        tokio::select! {
            biased;
            () = shutdown.notified() => return SessionEnd::Closed,
            read_result = tokio::time::timeout(config.read_idle_timeout, stream.read_exact(&mut payload)) => {
                match read_result {
                    Ok(Ok(_)) => {}
                    // Partial payload on disconnect: drop it silently.
                    Ok(Err(_)) | Err(_) => return SessionEnd::Disconnected,
                }
            }
        }

        let frame =
            BinaryFrame { id: header.id, kind, timestamp: header.timestamp, width: None, height: None, payload };
        if event_tx.send(ImagingEvent::Frame(frame)).await.is_err() {
            return SessionEnd::Closed;
        }
    }
}
