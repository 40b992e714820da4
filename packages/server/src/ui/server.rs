//! Server execution logic.

use std::{net::SocketAddr, sync::Arc};

use axum::{Router, routing::get};
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

use super::{
    handler::{handle_connection, health_check, online_users},
    signal::shutdown_signal,
    state::AppState,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line-oriented TCP chat server
///
/// # Example
///
/// ```ignore
/// let state = Arc::new(AppState::new(store, clock, formatter, config.session));
/// Server::new(state, config).run().await?;
/// ```
pub struct Server {
    state: Arc<AppState>,
    config: ServerConfig,
}

impl Server {
    pub fn new(state: Arc<AppState>, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Bind the listeners and start accepting connections in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the chat or HTTP listener cannot be bound.
    pub async fn bind(self) -> Result<RunningServer, ServerError> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Chat server listening on {}", local_addr);

        let http_addr = match self.config.http_port {
            Some(port) => {
                let addr = format!("{}:{}", self.config.host, port);
                let http_listener = TcpListener::bind(&addr)
                    .await
                    .map_err(|source| ServerError::Bind { addr, source })?;
                let http_addr = http_listener.local_addr()?;
                tracing::info!("HTTP status API listening on {}", http_addr);
                tasks.push(tokio::spawn(serve_http(
                    http_listener,
                    self.state.clone(),
                    shutdown.clone(),
                )));
                Some(http_addr)
            }
            None => None,
        };

        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.state,
            shutdown.clone(),
        )));

        Ok(RunningServer {
            local_addr,
            http_addr,
            shutdown,
            tasks,
        })
    }

    /// Run until Ctrl+C or SIGTERM, then close every session.
    pub async fn run(self) -> Result<(), ServerError> {
        let running = self.bind().await?;
        tracing::info!("Press Ctrl+C to shutdown gracefully");

        shutdown_signal().await;
        running.shutdown().await;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Handle to a server started with [`Server::bind`]
pub struct RunningServer {
    local_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningServer {
    /// Address of the chat listener (useful when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Stop accepting, cancel every session and wait for them to close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Server task failed: {}", e);
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
                    }
                    sessions.spawn(handle_connection(
                        stream,
                        peer,
                        state.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    tracing::info!("Waiting for {} sessions to close", sessions.len());
    while sessions.join_next().await.is_some() {}
}

async fn serve_http(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/online", get(online_users))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }
}
