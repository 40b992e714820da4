//! Per-connection session lifecycle.
//!
//! ```text
//! Handshaking ─► ReplayingHistory ─► Active ─► Closing ─► Closed
//!      └──────────── invalid identity / EOF ───────────────►┘
//! ```
//!
//! ## テスト実装の作業記録
//!
//! ### 何をテストしているか
//! - handle_connection() によるハンドシェイクから切断までの一連の流れ
//!
//! ### なぜこのテストが必要か
//! - 履歴（HISTORY_END まで）がライブ配信より前に届くことを保証する
//! - 切断時に 1 回だけ退出通知とオンライン一覧が配信されることを保証する
//!
//! ### どのような状況を想定しているか
//! - 正常系：参加、メッセージ送信、退出
//! - 異常系：不正な identity でのハンドシェイク、サーバーのシャットダウン
//! - エッジケース：ストアからの履歴取得失敗、履歴再送中に届いたメッセージ、
//!   送信失敗による強制切断とセッション自身の終了処理の競合

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{DomainError, LineSink, SessionIdFactory, TransportError},
    infrastructure::{
        registry::{Activation, SessionHandle},
        transport::{FramedLineSink, LineReader},
    },
    protocol::{
        Command, HISTORY_END, Handshake, USAGE_PRIVATE_MESSAGE, format_chat_line,
        format_system_line, joined_notice, left_notice, parse_command, parse_handshake,
    },
    ui::state::AppState,
    usecase::broadcast::deliver,
};

/// Why a handshake did not produce a session
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before handshake")]
    Eof,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] DomainError),
}

/// Why an established session is closing
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Transport(TransportError),
    Evicted,
    Shutdown,
}

/// Drive one connection from handshake to close.
///
/// The connection is always closed when this returns, whichever state the
/// session reached.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = state.settings;
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = LineReader::new(reader, settings.max_line_length, settings.idle_timeout);
    let sink: Arc<dyn LineSink> =
        Arc::new(FramedLineSink::new(writer, settings.max_line_length));

    let handshake = tokio::select! {
        _ = shutdown.cancelled() => {
            release(sink.as_ref(), &state).await;
            return;
        }
        result = read_handshake(&mut reader) => result,
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::warn!(%peer, "Handshake rejected: {}", e);
            release(sink.as_ref(), &state).await;
            return;
        }
    };

    let handle = SessionHandle::new(
        SessionIdFactory::generate(),
        handshake.identity,
        handshake.metadata,
        sink,
        shutdown.child_token(),
    );
    state.registry.register(handle.clone()).await;
    tracing::info!(
        %peer,
        session = %handle.id,
        identity = %handle.identity,
        "Client connected"
    );

    let reason = match join(&state, &handle).await {
        Ok(()) => run_active(&state, &handle, &mut reader, &shutdown).await,
        Err(reason) => reason,
    };
    close_session(&state, &handle, reason).await;
}

async fn read_handshake<R>(reader: &mut LineReader<R>) -> Result<Handshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let line = reader.next_line().await?.ok_or(HandshakeError::Eof)?;
    Ok(parse_handshake(line.trim())?)
}

/// ReplayingHistory: send the history block, flush lines queued meanwhile, then go live
/// and announce the join.
async fn join(state: &AppState, handle: &SessionHandle) -> Result<(), CloseReason> {
    let (mut block, replayed_through) = match state.store.fetch_public_history().await {
        Ok(history) => {
            let through = history.iter().map(|message| message.timestamp).max();
            let lines: Vec<String> = history
                .iter()
                .map(|message| {
                    let time = state
                        .formatter
                        .format(message.timestamp, handle.metadata.utc_offset);
                    format_chat_line(&time, &message.sender, &message.body)
                })
                .collect();
            (lines, through)
        }
        Err(e) => {
            tracing::error!("Error loading history for '{}': {}", handle.identity, e);
            (Vec::new(), None)
        }
    };
    // Messages covered by the block must not be delivered again as live traffic
    state.registry.mark_replayed(handle.id, replayed_through).await;

    let replayed = block.len();
    block.push(HISTORY_END.to_string());
    tokio::select! {
        _ = handle.eviction.cancelled() => return Err(CloseReason::Shutdown),
        result = handle.sink.send_block(&block) => result.map_err(CloseReason::Transport)?,
    }
    tracing::debug!("Replayed {} history lines to '{}'", replayed, handle.identity);

    loop {
        match state.registry.activate(handle.id).await {
            Activation::Live => break,
            Activation::Unregistered => return Err(CloseReason::Evicted),
            Activation::Drain(lines) => {
                tracing::debug!(
                    "Flushing {} lines queued during replay to '{}'",
                    lines.len(),
                    handle.identity
                );
                flush_queued(state, handle, &lines).await?;
            }
        }
    }

    let time = state
        .formatter
        .format(state.clock.now(), handle.metadata.utc_offset);
    state
        .broadcast
        .broadcast(&format_system_line(&time, &joined_notice(&handle.identity)), None)
        .await;
    state.presence.announce().await;
    Ok(())
}

async fn flush_queued(
    state: &AppState,
    handle: &SessionHandle,
    lines: &[String],
) -> Result<(), CloseReason> {
    let send_timeout = state.broadcast.send_timeout();
    tokio::select! {
        _ = handle.eviction.cancelled() => Err(CloseReason::Shutdown),
        result = tokio::time::timeout(send_timeout, handle.sink.send_block(lines)) => match result {
            Ok(sent) => sent.map_err(CloseReason::Transport),
            Err(_) => Err(CloseReason::Transport(TransportError::Timeout(send_timeout))),
        },
    }
}

/// Active: read lines until the peer leaves, a read fails, or the session is cancelled.
async fn run_active<R>(
    state: &AppState,
    handle: &SessionHandle,
    reader: &mut LineReader<R>,
    shutdown: &CancellationToken,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = handle.eviction.cancelled() => {
                return if shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Evicted
                };
            }
            next = reader.next_line() => next,
        };

        match next {
            Ok(Some(line)) => dispatch(state, handle, &line).await,
            Ok(None) => return CloseReason::PeerClosed,
            Err(e) => return CloseReason::Transport(e),
        }
    }
}

async fn dispatch(state: &AppState, handle: &SessionHandle, line: &str) {
    match parse_command(line) {
        Command::Empty => {}
        Command::PrivateUsage => {
            if let Err(e) = deliver(
                handle.sink.as_ref(),
                USAGE_PRIVATE_MESSAGE,
                state.broadcast.send_timeout(),
            )
            .await
            {
                tracing::warn!("Failed to send usage to '{}': {}", handle.identity, e);
            }
        }
        Command::Private { target, body } => {
            let result = state.private_router.route(handle, target, body).await;
            tracing::debug!("Private message from '{}': {:?}", handle.identity, result);
        }
        Command::Public(body) => {
            if let Err(e) = state.send_message.execute(handle, body).await {
                tracing::debug!("Message from '{}' dropped: {}", handle.identity, e);
            }
        }
    }
}

/// Closing: deregister, announce the departure if nobody else did, release the connection.
async fn close_session(state: &AppState, handle: &SessionHandle, reason: CloseReason) {
    match &reason {
        CloseReason::PeerClosed => {
            tracing::info!("Client '{}' ({}) disconnected", handle.identity, handle.id)
        }
        CloseReason::Transport(e) => tracing::info!(
            "Client '{}' ({}) disconnected: {}",
            handle.identity,
            handle.id,
            e
        ),
        CloseReason::Evicted => tracing::debug!(
            "Session {} was evicted, closing connection",
            handle.id
        ),
        CloseReason::Shutdown => tracing::debug!(
            "Closing session {} for shutdown",
            handle.id
        ),
    }

    // `None` means the broadcast engine already evicted and announced this session
    if let Some(removed) = state.registry.deregister(handle.id).await {
        if removed.was_live {
            let time = state
                .formatter
                .format(state.clock.now(), handle.metadata.utc_offset);
            state
                .broadcast
                .broadcast(&format_system_line(&time, &left_notice(&handle.identity)), None)
                .await;
        }
        state.presence.announce().await;
    }

    release(handle.sink.as_ref(), state).await;
}

async fn release(sink: &dyn LineSink, state: &AppState) {
    match tokio::time::timeout(state.broadcast.send_timeout(), sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Error closing connection: {}", e),
        Err(_) => tracing::debug!("Timed out closing connection"),
    }
}
