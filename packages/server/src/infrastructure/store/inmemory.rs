//! InMemory MessageStore 実装
//!
//! 2 つのログを 1 つの Mutex の下の `Vec` に保持する。再起動すると消える。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hiroba_shared::time::{Clock, SystemClock};
use tokio::sync::Mutex;

use crate::domain::{
    ChatMessage, Identity, MessageBody, MessageStore, PrivateMessage, StoreError,
};

use super::TimestampSequencer;

#[derive(Default)]
struct Logs {
    public: Vec<ChatMessage>,
    private: Vec<PrivateMessage>,
    sequencer: TimestampSequencer,
}

/// インメモリ MessageStore 実装
pub struct InMemoryMessageStore {
    logs: Mutex<Logs>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: Mutex::new(Logs::default()),
            clock,
        }
    }

    /// 永続化された個人宛メッセージの件数
    pub async fn private_count(&self) -> usize {
        self.logs.lock().await.private.len()
    }

    /// 永続化された公開メッセージの件数
    pub async fn public_count(&self) -> usize {
        self.logs.lock().await.public.len()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append_public(
        &self,
        sender: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut logs = self.logs.lock().await;
        let timestamp = logs.sequencer.next(self.clock.now());
        logs.public.push(ChatMessage {
            sender: sender.as_str().to_string(),
            body: body.as_str().to_string(),
            timestamp,
        });
        Ok(timestamp)
    }

    async fn append_private(
        &self,
        sender: &Identity,
        receiver: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut logs = self.logs.lock().await;
        let timestamp = logs.sequencer.next(self.clock.now());
        logs.private.push(PrivateMessage {
            sender: sender.as_str().to_string(),
            receiver: receiver.as_str().to_string(),
            body: body.as_str().to_string(),
            timestamp,
        });
        Ok(timestamp)
    }

    async fn fetch_public_history(&self) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.logs.lock().await.public.clone())
    }
}
