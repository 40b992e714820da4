//! Runtime configuration consumed by [`Server`](crate::ui::Server).
//!
//! The binary builds this from command-line flags; tests construct it directly.

use std::{path::PathBuf, time::Duration};

use hiroba_shared::time::UtcOffset;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Where messages are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Sqlite(PathBuf),
}

/// Per-connection limits shared by every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Deadline for a single write to a peer
    pub send_timeout: Duration,
    /// Deadline for a single read; `None` lets a silent peer stay connected
    pub idle_timeout: Option<Duration>,
    /// Longest inbound or outbound line, in bytes
    pub max_line_length: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            idle_timeout: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Chat listener port; `0` picks an ephemeral port
    pub port: u16,
    /// Port of the HTTP status API, disabled when `None`
    pub http_port: Option<u16>,
    pub store: StoreConfig,
    /// Display offset for identities that sent none in their handshake
    pub default_utc_offset: UtcOffset,
    pub session: SessionSettings,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            http_port: None,
            store: StoreConfig::Sqlite(PathBuf::from("messages.db")),
            default_utc_offset: UtcOffset::default(),
            session: SessionSettings::default(),
        }
    }
}
