// scopewire-test-support: a hand-driven mock device for integration tests.
//
// A raw `tokio::net::TcpListener` bound to port 0, with the test task
// driving the line-JSON control protocol and the binary imaging protocol
// by hand rather than through a scripted fixture framework.

use std::net::SocketAddr;

use scopewire_protocol::BinaryHeader;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Install a `tracing` subscriber for the duration of the test process,
/// controlled by `RUST_LOG`. Safe to call from every test -- only the
/// first call actually installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}

/// A mock device listener. Bind once, then `accept()` a connection per test
/// scenario and drive it by hand with [`ScriptedConn`]'s helpers.
pub struct MockDeviceServer {
    listener: TcpListener,
}

impl MockDeviceServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(MockDeviceServer { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local_addr always succeeds after bind")
    }

    /// Accept the next incoming connection (control or imaging -- the
    /// listener doesn't care, framing is up to the caller).
    pub async fn accept(&self) -> std::io::Result<ScriptedConn> {
        let (stream, _peer) = self.listener.accept().await?;
        Ok(ScriptedConn::new(stream))
    }
}

/// A single accepted connection, with helpers for both wire formats.
pub struct ScriptedConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ScriptedConn {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        ScriptedConn { reader: BufReader::new(read_half), writer: write_half }
    }

    /// Read one LF-terminated line. Returns `Ok(None)` on clean EOF.
    /// Returns the raw text (CR not stripped -- callers wanting parsed JSON
    /// should use [`read_json_line`](Self::read_json_line)).
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Read one line and parse it as JSON. Returns `Ok(None)` on EOF;
    /// malformed JSON is surfaced as an `Err`, mirroring what the client's
    /// own codec would report.
    pub async fn read_json_line(&mut self) -> std::io::Result<Option<Value>> {
        let Some(line) = self.read_line().await? else {
            return Ok(None);
        };
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let value = serde_json::from_str(trimmed)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(value))
    }

    /// Write a raw line, LF-terminated. Useful for sending deliberately
    /// malformed text to exercise `ProtocolError` handling.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Write a JSON value as a single line.
    pub async fn write_json(&mut self, value: &Value) -> std::io::Result<()> {
        self.write_line(&value.to_string()).await
    }

    /// Write a binary frame: header followed by payload.
    pub async fn write_binary_frame(
        &mut self,
        header: BinaryHeader,
        payload: &[u8],
    ) -> std::io::Result<()> {
        self.writer.write_all(&header.encode()).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await
    }

    /// Write raw bytes verbatim (e.g. a truncated header to test `Malformed`
    /// handling on partial frames).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Close the connection (drop both halves).
    pub fn close(self) {
        drop(self);
    }
}
