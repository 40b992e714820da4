//! UseCase: 個人宛メッセージ（/pm）のルーティング
//!
//! ## テスト実装の作業記録
//!
//! ### 何をテストしているか
//! - PrivateMessageRouter::route() メソッド
//! - 宛先の解決、永続化、送信者と宛先の 2 者だけへの配信
//!
//! ### なぜこのテストが必要か
//! - 個人宛メッセージが第三者に漏れないことを保証する
//! - 自分宛・宛先不在・永続化失敗の各ケースで永続化や配信が起きないことを保証する
//!
//! ### どのような状況を想定しているか
//! - 正常系：宛先への配信と送信者へのエコー
//! - 異常系：自分宛、宛先不在、ストアへの書き込み失敗、宛先への送信失敗
//! - エッジケース：同名セッションが複数ある場合（最初に接続したセッションが宛先）
//! - エッジケース：宛先が履歴再送中の場合（保留され、再送後に届く）

use std::sync::Arc;

use hiroba_shared::time::TimestampFormatter;

use crate::{
    domain::{Identity, MessageBody, MessageStore},
    infrastructure::registry::{Delivery, PresenceRegistry, SessionHandle},
    protocol::{
        ERROR_SAVE_PRIVATE, ERROR_SELF_TARGET, format_private_line, invalid_body, target_not_found,
    },
};

use super::broadcast::{BroadcastEngine, deliver};

/// 個人宛メッセージ 1 件のルーティング結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// 永続化し、宛先と送信者に送った
    Delivered,
    /// 自分宛だった（永続化しない）
    SelfTarget,
    /// 宛先の identity で接続中のセッションがない（永続化しない）
    TargetNotFound,
    /// 本文が空または長すぎる（永続化しない）
    InvalidBody,
    /// 永続化に失敗し、メッセージを破棄した
    StoreFailure,
}

/// 宛先の identity を接続に解決し、1 対 1 で配信する
pub struct PrivateMessageRouter {
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn MessageStore>,
    broadcast: Arc<BroadcastEngine>,
    formatter: Arc<dyn TimestampFormatter>,
}

impl PrivateMessageRouter {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        store: Arc<dyn MessageStore>,
        broadcast: Arc<BroadcastEngine>,
        formatter: Arc<dyn TimestampFormatter>,
    ) -> Self {
        Self {
            registry,
            store,
            broadcast,
            formatter,
        }
    }

    /// `sender` から `target` として登録されたセッションへ `body` を送る
    ///
    /// 永続化した後は、宛先への書き込みに失敗してもログに残すだけ。
    /// 宛先が履歴再送中なら保留キューに積み、再送の後に届ける。
    pub async fn route(&self, sender: &SessionHandle, target: &str, body: &str) -> RouteResult {
        if target == sender.identity.as_str() {
            self.reply(sender, ERROR_SELF_TARGET).await;
            return RouteResult::SelfTarget;
        }

        let target_session = match Identity::new(target) {
            Ok(identity) => self.registry.find_by_identity(&identity).await,
            Err(_) => None,
        };
        let Some(target_session) = target_session else {
            self.reply(sender, &target_not_found(target)).await;
            return RouteResult::TargetNotFound;
        };

        let body = match MessageBody::new(body) {
            Ok(body) => body,
            Err(e) => {
                self.reply(sender, &invalid_body(&e)).await;
                return RouteResult::InvalidBody;
            }
        };

        let timestamp = match self
            .store
            .append_private(&sender.identity, &target_session.identity, &body)
            .await
        {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::error!(
                    "Error saving private message '{}' -> '{}': {}",
                    sender.identity,
                    target_session.identity,
                    e
                );
                self.reply(sender, ERROR_SAVE_PRIVATE).await;
                return RouteResult::StoreFailure;
            }
        };

        let time = self.formatter.format(timestamp, sender.metadata.utc_offset);
        let line = format_private_line(
            &time,
            sender.identity.as_str(),
            target_session.identity.as_str(),
            body.as_str(),
        );

        match self.registry.deliver_or_queue(target_session.id, &line).await {
            Delivery::Direct(target) => {
                if let Err(e) =
                    deliver(target.sink.as_ref(), &line, self.broadcast.send_timeout()).await
                {
                    tracing::error!(
                        "Error sending private message to '{}': {}",
                        target.identity,
                        e
                    );
                }
            }
            Delivery::Queued => {
                tracing::debug!(
                    "Private message to '{}' queued until history replay ends",
                    target_session.identity
                );
            }
            Delivery::Unregistered => {
                tracing::warn!(
                    "'{}' left before the private message could be delivered",
                    target_session.identity
                );
            }
        }
        self.reply(sender, &line).await;

        tracing::debug!(
            "Private message from '{}' to '{}': {}",
            sender.identity,
            target_session.identity,
            body.as_str()
        );
        RouteResult::Delivered
    }

    async fn reply(&self, sender: &SessionHandle, text: &str) {
        if let Err(e) = deliver(sender.sink.as_ref(), text, self.broadcast.send_timeout()).await {
            tracing::warn!("Failed to send reply to '{}': {}", sender.identity, e);
        }
    }
}
