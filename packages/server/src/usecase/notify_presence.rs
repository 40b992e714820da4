//! UseCase: オンライン一覧の通知
//!
//! レジストリの snapshot から `ONLINE_USERS|<count>|...` を組み立てて全員に配信する。
//! snapshot を取ってロックを解放してから書き込む。

use std::sync::Arc;

use crate::{infrastructure::registry::PresenceRegistry, protocol::format_online_users};

use super::broadcast::{BroadcastEngine, BroadcastReport};

/// 現在の登録状況を表すオンライン一覧の行
pub(crate) async fn presence_line(registry: &PresenceRegistry) -> String {
    let snapshot = registry.snapshot().await;
    format_online_users(&snapshot)
}

/// 参加・退出のたびにオンライン一覧を配信する
pub struct PresenceNotifier {
    registry: Arc<PresenceRegistry>,
    broadcast: Arc<BroadcastEngine>,
}

impl PresenceNotifier {
    pub fn new(registry: Arc<PresenceRegistry>, broadcast: Arc<BroadcastEngine>) -> Self {
        Self {
            registry,
            broadcast,
        }
    }

    /// 現在のオンライン一覧を全員に配信
    pub async fn announce(&self) -> BroadcastReport {
        let line = presence_line(&self.registry).await;
        tracing::debug!("Broadcasting online users list: {}", line);
        self.broadcast.broadcast(&line, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Identity, LineSink, SessionIdFactory, SessionMetadata},
        infrastructure::registry::SessionHandle,
        test_support::RecordingSink,
    };
    use hiroba_shared::time::{OffsetFormatter, SystemClock};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn create_notifier() -> (Arc<PresenceRegistry>, PresenceNotifier) {
        let registry = Arc::new(PresenceRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(
            registry.clone(),
            Arc::new(SystemClock),
            Arc::new(OffsetFormatter::utc()),
            Duration::from_millis(50),
        ));
        (registry.clone(), PresenceNotifier::new(registry, engine))
    }

    async fn join(registry: &PresenceRegistry, name: &str, sink: Arc<dyn LineSink>) -> SessionHandle {
        let handle = SessionHandle::new(
            SessionIdFactory::generate(),
            Identity::new(name).unwrap(),
            SessionMetadata::default(),
            sink,
            CancellationToken::new(),
        );
        registry.register(handle.clone()).await;
        registry.activate(handle.id).await;
        handle
    }

    #[tokio::test]
    async fn test_announce_reports_current_members() {
        // テスト項目: 通知される件数と一覧が現在の登録状況と一致する
        // given (前提条件):
        let (registry, notifier) = create_notifier();
        let alice_sink = Arc::new(RecordingSink::new());
        join(&registry, "alice", alice_sink.clone()).await;
        join(&registry, "bob", Arc::new(RecordingSink::new())).await;

        // when (操作):
        let report = notifier.announce().await;

        // then (期待する結果):
        assert_eq!(report.delivered, 2);
        assert_eq!(alice_sink.lines(), vec!["ONLINE_USERS|2|alice|bob"]);
    }

    #[tokio::test]
    async fn test_announce_after_leave_drops_member() {
        // テスト項目: 退出後の通知には退出したユーザーが含まれない
        // given (前提条件):
        let (registry, notifier) = create_notifier();
        let alice_sink = Arc::new(RecordingSink::new());
        join(&registry, "alice", alice_sink.clone()).await;
        let bob = join(&registry, "bob", Arc::new(RecordingSink::new())).await;

        // when (操作):
        registry.deregister(bob.id).await;
        notifier.announce().await;

        // then (期待する結果):
        assert_eq!(alice_sink.lines(), vec!["ONLINE_USERS|1|alice"]);
    }
}
