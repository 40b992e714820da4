//! UseCase: 公開メッセージ送信処理
//!
//! ## テスト実装の作業記録
//!
//! ### 何をテストしているか
//! - SendMessageUseCase::execute() メソッド
//! - メッセージの永続化と、永続化時刻付きでのブロードキャスト
//!
//! ### なぜこのテストが必要か
//! - 送信者自身にもエコーされ、サーバーの時刻が表示に使われることを保証する
//! - 永続化に失敗したメッセージは配信されず、送信者にだけエラーが返ることを保証する
//!
//! ### どのような状況を想定しているか
//! - 正常系：永続化とブロードキャスト
//! - 異常系：ストアへの書き込み失敗、本文の文字数超過

use std::sync::Arc;

use hiroba_shared::time::TimestampFormatter;

use crate::{
    domain::{MessageBody, MessageStore},
    infrastructure::registry::SessionHandle,
    protocol::{ERROR_SAVE_PUBLIC, format_chat_line, invalid_body},
};

use super::{
    broadcast::{BroadcastEngine, BroadcastReport, deliver},
    error::SendMessageError,
};

/// 公開メッセージ送信のユースケース
pub struct SendMessageUseCase {
    /// MessageStore（永続化の抽象化）
    store: Arc<dyn MessageStore>,
    broadcast: Arc<BroadcastEngine>,
    formatter: Arc<dyn TimestampFormatter>,
}

impl SendMessageUseCase {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broadcast: Arc<BroadcastEngine>,
        formatter: Arc<dyn TimestampFormatter>,
    ) -> Self {
        Self {
            store,
            broadcast,
            formatter,
        }
    }

    /// `sender` の公開メッセージとして `body` を永続化し、送信者を含む全員に配信する
    ///
    /// 失敗した場合はメッセージを破棄し、送信者にだけエラー行を返す。
    pub async fn execute(
        &self,
        sender: &SessionHandle,
        body: &str,
    ) -> Result<BroadcastReport, SendMessageError> {
        let body = match MessageBody::new(body) {
            Ok(body) => body,
            Err(e) => {
                self.reply(sender, &invalid_body(&e)).await;
                return Err(e.into());
            }
        };

        let timestamp = match self.store.append_public(&sender.identity, &body).await {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::error!(
                    "Error saving public message from '{}': {}",
                    sender.identity,
                    e
                );
                self.reply(sender, ERROR_SAVE_PUBLIC).await;
                return Err(e.into());
            }
        };

        let time = self.formatter.format(timestamp, sender.metadata.utc_offset);
        let line = format_chat_line(&time, sender.identity.as_str(), body.as_str());
        tracing::debug!("Public message from '{}': {}", sender.identity, body.as_str());

        Ok(self.broadcast.broadcast_message(&line, timestamp).await)
    }

    async fn reply(&self, sender: &SessionHandle, text: &str) {
        if let Err(e) = deliver(sender.sink.as_ref(), text, self.broadcast.send_timeout()).await {
            tracing::warn!("Failed to send error reply to '{}': {}", sender.identity, e);
        }
    }
}
