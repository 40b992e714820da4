//! Message store trait 定義
//!
//! セッションとユースケースはこのインターフェースにのみ依存する。
//! 具体的な実装（インメモリ、SQLite）は infrastructure 層にある。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ChatMessage, Identity, MessageBody, StoreError};

/// 公開・個人宛メッセージの追記専用ログ
///
/// 時刻は書き込み時にストアが割り当て、書き込み順に狭義単調増加する。
/// 各 append は単独でアトミックで、複数の呼び出しにまたがるトランザクションはない。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 公開メッセージを永続化し、割り当てた時刻を返す
    async fn append_public(
        &self,
        sender: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// 個人宛メッセージを永続化し、割り当てた時刻を返す
    async fn append_private(
        &self,
        sender: &Identity,
        receiver: &Identity,
        body: &MessageBody,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// 全ての公開メッセージ（古い順）
    async fn fetch_public_history(&self) -> Result<Vec<ChatMessage>, StoreError>;
}
