//! Client configuration.
//!
//! The core only ever accepts this typed struct -- reading the environment
//! is an opt-in convenience ([`ClientConfig::from_env`]), layering
//! environment variables on top of defaults rather than a TOML file, since
//! that's what this library's operators are expected to set.

use std::time::Duration;

/// Where the device lives: host plus its two TCP ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub control_port: u16,
    pub imaging_port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, control_port: u16, imaging_port: u16) -> Self {
        Endpoint { host: host.into(), control_port, imaging_port }
    }

    pub(crate) fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    pub(crate) fn imaging_addr(&self) -> String {
        format!("{}:{}", self.host, self.imaging_port)
    }
}

/// Backoff tuning for the reconnecting transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base: Duration,
    pub cap: Duration,
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig { base: Duration::from_millis(500), cap: Duration::from_secs(10), max_attempts: None }
    }
}

/// Top-level client configuration. Construct via [`ClientConfig::default`]
/// and override only what you need.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub read_idle_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub write_queue_size: usize,
    pub subscriber_queue_size: usize,
    pub write_queue_timeout: Duration,
    pub reconnect_wait_timeout: Duration,
    pub max_frame: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            write_queue_size: 256,
            subscriber_queue_size: 64,
            write_queue_timeout: Duration::from_secs(5),
            reconnect_wait_timeout: Duration::from_secs(30),
            max_frame: scopewire_protocol::DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    /// Layer known environment variables on top of the defaults. Unset or
    /// unparsable variables fall back to the default silently (parsing is
    /// the caller's CLI's job to validate up front; this is a convenience
    /// loader, not a strict config parser).
    pub fn from_env() -> ClientConfig {
        let mut cfg = ClientConfig::default();
        if let Some(v) = env_duration_secs("CONNECT_TIMEOUT") {
            cfg.connect_timeout = v;
        }
        if let Some(v) = env_duration_secs("READ_IDLE_TIMEOUT") {
            cfg.read_idle_timeout = v;
        }
        if let Some(v) = env_duration_secs("COMMAND_TIMEOUT") {
            cfg.command_timeout = v;
        }
        if let Some(v) = env_duration_secs("RECONNECT_BASE") {
            cfg.reconnect.base = v;
        }
        if let Some(v) = env_duration_secs("RECONNECT_CAP") {
            cfg.reconnect.cap = v;
        }
        if let Ok(v) = std::env::var("RECONNECT_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.reconnect.max_attempts = Some(n);
            }
        }
        if let Some(v) = env_usize("WRITE_QUEUE_SIZE") {
            cfg.write_queue_size = v;
        }
        if let Some(v) = env_usize("SUBSCRIBER_QUEUE_SIZE") {
            cfg.subscriber_queue_size = v;
        }
        cfg
    }
}

fn env_duration_secs(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.command_timeout, Duration::from_secs(10));
        assert_eq!(cfg.reconnect.base, Duration::from_millis(500));
        assert_eq!(cfg.reconnect.cap, Duration::from_secs(10));
        assert_eq!(cfg.reconnect.max_attempts, None);
        assert_eq!(cfg.write_queue_size, 256);
        assert_eq!(cfg.subscriber_queue_size, 64);
    }

    #[test]
    fn endpoint_formats_addrs() {
        let ep = Endpoint::new("127.0.0.1", 4700, 4800);
        assert_eq!(ep.control_addr(), "127.0.0.1:4700");
        assert_eq!(ep.imaging_addr(), "127.0.0.1:4800");
    }
}
