//! Test doubles shared by unit tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    ChatMessage, Identity, LineSink, MessageBody, MessageStore, StoreError, TransportError,
};

/// Records every line it receives.
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl LineSink for RecordingSink {
    async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn send_block(&self, lines: &[String]) -> Result<(), TransportError> {
        self.lines.lock().unwrap().extend(lines.iter().cloned());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Behaves like a connection whose peer has reset.
pub struct BrokenSink;

#[async_trait]
impl LineSink for BrokenSink {
    async fn send_line(&self, _line: &str) -> Result<(), TransportError> {
        Err(TransportError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    async fn send_block(&self, _lines: &[String]) -> Result<(), TransportError> {
        Err(TransportError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Never completes a write, like a peer that stopped reading.
pub struct StalledSink;

#[async_trait]
impl LineSink for StalledSink {
    async fn send_line(&self, _line: &str) -> Result<(), TransportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn send_block(&self, _lines: &[String]) -> Result<(), TransportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Reads history from `inner` and then waits `delay` before returning it,
/// so that other sessions can persist messages after the snapshot was taken.
pub struct SlowHistoryStore {
    pub inner: Arc<dyn MessageStore>,
    pub delay: Duration,
}

#[async_trait]
impl MessageStore for SlowHistoryStore {
    async fn append_public(
        &self,
        sender: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.inner.append_public(sender, body).await
    }

    async fn append_private(
        &self,
        sender: &Identity,
        receiver: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.inner.append_private(sender, receiver, body).await
    }

    async fn fetch_public_history(&self) -> Result<Vec<ChatMessage>, StoreError> {
        let history = self.inner.fetch_public_history().await?;
        tokio::time::sleep(self.delay).await;
        Ok(history)
    }
}
