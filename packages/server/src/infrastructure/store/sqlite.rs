//! SQLite MessageStore 実装
//!
//! 1 本の [`rusqlite::Connection`] を Mutex の下に持ち、全ての呼び出しを
//! blocking スレッドプールで実行する。

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hiroba_shared::time::Clock;
use rusqlite::{Connection, OptionalExtension, params};

use crate::domain::{
    ChatMessage, Identity, MessageBody, MessageStore, StoreError,
};

use super::TimestampSequencer;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chat_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    username  TEXT NOT NULL,
    message   TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS private_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    sender    TEXT NOT NULL,
    receiver  TEXT NOT NULL,
    message   TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_timestamp ON chat_messages (timestamp);
";

struct Inner {
    conn: Connection,
    sequencer: TimestampSequencer,
}

/// 1 つの SQLite ファイルに保存する永続 MessageStore
pub struct SqliteMessageStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl SqliteMessageStore {
    /// `path` のデータベースを開き（なければ作成し）、スキーマを用意する
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        tracing::info!(path = %path.display(), "opening message database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, clock)
    }

    /// インメモリのデータベースを開く（主にテスト用）
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, clock)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;

        let last: Option<String> = conn
            .query_row(
                "SELECT MAX(ts) FROM (
                     SELECT timestamp AS ts FROM chat_messages
                     UNION ALL
                     SELECT timestamp AS ts FROM private_messages
                 )",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let last = last.as_deref().map(parse_timestamp).transpose()?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                sequencer: TimestampSequencer::starting_at(last),
            })),
            clock,
        })
    }

    /// blocking スレッドプールで `f` を実行する
    async fn with_inner<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner, DateTime<Utc>) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        let clock = self.clock.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard, clock.now())
        })
        .await?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append_public(
        &self,
        sender: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        let sender = sender.as_str().to_string();
        let body = body.as_str().to_string();
        self.with_inner(move |inner, now| {
            let timestamp = inner.sequencer.next(now);
            inner.conn.execute(
                "INSERT INTO chat_messages (username, message, timestamp) VALUES (?1, ?2, ?3)",
                params![sender, body, format_timestamp(timestamp)],
            )?;
            Ok(timestamp)
        })
        .await
    }

    async fn append_private(
        &self,
        sender: &Identity,
        receiver: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        let sender = sender.as_str().to_string();
        let receiver = receiver.as_str().to_string();
        let body = body.as_str().to_string();
        self.with_inner(move |inner, now| {
            let timestamp = inner.sequencer.next(now);
            inner.conn.execute(
                "INSERT INTO private_messages (sender, receiver, message, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![sender, receiver, body, format_timestamp(timestamp)],
            )?;
            Ok(timestamp)
        })
        .await
    }

    async fn fetch_public_history(&self) -> Result<Vec<ChatMessage>, StoreError> {
        self.with_inner(|inner, _| {
            let mut stmt = inner.conn.prepare(
                "SELECT username, message, timestamp FROM chat_messages
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (sender, body, timestamp) = row?;
                messages.push(ChatMessage {
                    sender,
                    body,
                    timestamp: parse_timestamp(&timestamp)?,
                });
            }
            Ok(messages)
        })
        .await
    }
}

/// 固定長の RFC 3339（UTC）。文字列順が時刻順と一致する
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
