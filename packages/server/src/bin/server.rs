//! Line-oriented TCP chat server.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-server
//! cargo run --bin hiroba-server -- --host 0.0.0.0 --port 9090 --database chat.db
//! cargo run --bin hiroba-server -- --in-memory --http-port 8080
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use hiroba_server::{
    config::{ServerConfig, SessionSettings, StoreConfig},
    domain::MessageStore,
    infrastructure::store::{InMemoryMessageStore, SqliteMessageStore},
    ui::{Server, state::AppState},
};
use hiroba_shared::{
    logger::setup_logger,
    time::{Clock, OffsetFormatter, SystemClock, UtcOffset},
};

#[derive(Parser, Debug)]
#[command(name = "hiroba-server")]
#[command(about = "Line-oriented TCP chat server with history and private messages", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value = "9090")]
    port: u16,

    /// SQLite database file for message history
    #[arg(short = 'd', long, default_value = "messages.db")]
    database: PathBuf,

    /// Keep messages in memory instead of SQLite
    #[arg(long)]
    in_memory: bool,

    /// Deadline for a single write to a client, in milliseconds
    #[arg(long, default_value = "2000")]
    send_timeout_ms: u64,

    /// Disconnect clients that send nothing for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    idle_timeout_secs: u64,

    /// Display offset for clients that do not send one, in seconds east of UTC
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    utc_offset_secs: i32,

    /// Serve the HTTP status API on this port
    #[arg(long)]
    http_port: Option<u16>,

    /// Longest accepted line, in bytes
    #[arg(long, default_value = "4096")]
    max_line_length: usize,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let default_utc_offset = UtcOffset::from_seconds(self.utc_offset_secs)
            .ok_or_else(|| format!("UTC offset out of range: {}", self.utc_offset_secs))?;
        let store = if self.in_memory {
            StoreConfig::InMemory
        } else {
            StoreConfig::Sqlite(self.database)
        };
        let idle_timeout =
            (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs));

        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            http_port: self.http_port,
            store,
            default_utc_offset,
            session: SessionSettings {
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                idle_timeout,
                max_line_length: self.max_line_length,
            },
        })
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "debug");

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize dependencies in order:
    // 1. Clock / Formatter
    // 2. MessageStore
    // 3. AppState (registry + usecases)
    // 4. Server
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let formatter = Arc::new(OffsetFormatter::new(config.default_utc_offset));

    let store: Arc<dyn MessageStore> = match &config.store {
        StoreConfig::InMemory => {
            tracing::info!("Using in-memory message store");
            Arc::new(InMemoryMessageStore::new(clock.clone()))
        }
        StoreConfig::Sqlite(path) => match SqliteMessageStore::open(path, clock.clone()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!("Failed to open database {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
    };

    let state = Arc::new(AppState::new(store, clock, formatter, config.session));
    if let Err(e) = Server::new(state, config).run().await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
