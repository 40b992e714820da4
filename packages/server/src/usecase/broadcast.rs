//! UseCase: ブロードキャスト（fan-out）処理
//!
//! ## テスト実装の作業記録
//!
//! ### 何をテストしているか
//! - BroadcastEngine::broadcast() メソッド
//! - 送信失敗したセッションの検出・削除と、切断通知の再ブロードキャスト
//!
//! ### なぜこのテストが必要か
//! - 1 つの接続の失敗が他の接続への配信を妨げないことを保証する
//! - 切断されたセッションが 1 回だけ削除・通知されることを保証する
//!
//! ### どのような状況を想定しているか
//! - 正常系：全員への配信、送信者の除外
//! - 異常系：切断済みの接続、応答しない接続（送信タイムアウト）
//! - エッジケース：履歴再送中（未 activate）のセッションへの保留

use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hiroba_shared::time::{Clock, TimestampFormatter};

use crate::{
    domain::{Identity, LineSink, SessionId, TransportError},
    infrastructure::registry::{PresenceRegistry, SessionHandle},
    protocol::{evicted_notice, format_system_line},
};

use super::notify_presence::presence_line;

/// 1 回のブロードキャストの結果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// 要求された行を受け取ったライブセッションの数
    pub delivered: usize,
    /// 送信失敗で切断したセッション（後続の通知で切断したものも含む）
    pub evicted: Vec<Identity>,
}

enum Outgoing {
    Line {
        line: String,
        exclude: Option<SessionId>,
        persisted_at: Option<DateTime<Utc>>,
    },
    Presence,
}

/// 全セッションに行を配信し、送信に失敗したセッションを切断する
pub struct BroadcastEngine {
    registry: Arc<PresenceRegistry>,
    clock: Arc<dyn Clock>,
    formatter: Arc<dyn TimestampFormatter>,
    send_timeout: Duration,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        clock: Arc<dyn Clock>,
        formatter: Arc<dyn TimestampFormatter>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            formatter,
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// 永続化されない行（通知・オンライン一覧）を `exclude` 以外の全員に配信する
    pub async fn broadcast(&self, line: &str, exclude: Option<SessionId>) -> BroadcastReport {
        self.run(Outgoing::Line {
            line: line.to_string(),
            exclude,
            persisted_at: None,
        })
        .await
    }

    /// `persisted_at` に永続化された公開メッセージを送信者を含む全員に配信する
    ///
    /// 履歴再送でこのメッセージを既に受け取ったセッションには送らない。
    pub async fn broadcast_message(
        &self,
        line: &str,
        persisted_at: DateTime<Utc>,
    ) -> BroadcastReport {
        self.run(Outgoing::Line {
            line: line.to_string(),
            exclude: None,
            persisted_at: Some(persisted_at),
        })
        .await
    }

    /// 全ての対象への送信を先に試み、失敗はその後でまとめて処理する
    ///
    /// 失敗したセッションは 1 回だけ削除され、eviction トークンがキャンセルされ、
    /// 「予期せず退出」の通知と新しいオンライン一覧が配信される。その配信で
    /// さらに切断が起きることもあり、新しい切断がなくなるまで繰り返す。
    async fn run(&self, first: Outgoing) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut queue = VecDeque::from([first]);
        let mut first_pass = true;

        while let Some(outgoing) = queue.pop_front() {
            let (line, exclude, persisted_at) = match outgoing {
                Outgoing::Line {
                    line,
                    exclude,
                    persisted_at,
                } => (line, exclude, persisted_at),
                Outgoing::Presence => (presence_line(&self.registry).await, None, None),
            };

            let targets = self
                .registry
                .broadcast_targets(&line, exclude, persisted_at)
                .await;
            let (delivered, failed) = self.fan_out(&targets, &line).await;
            if first_pass {
                report.delivered = delivered;
                first_pass = false;
            }

            for target in failed {
                let Some(removed) = self.registry.deregister(target.id).await else {
                    continue;
                };
                let handle = removed.handle;
                handle.eviction.cancel();
                tracing::info!(
                    "Client '{}' ({}) disconnected unexpectedly, evicted",
                    handle.identity,
                    handle.id
                );

                let time = self
                    .formatter
                    .format(self.clock.now(), handle.metadata.utc_offset);
                queue.push_back(Outgoing::Line {
                    line: format_system_line(&time, &evicted_notice(&handle.identity)),
                    exclude: None,
                    persisted_at: None,
                });
                queue.push_back(Outgoing::Presence);
                report.evicted.push(handle.identity);
            }
        }

        report
    }

    /// 全ての対象に並行して送信し、成功数と失敗した対象を返す
    async fn fan_out(&self, targets: &[SessionHandle], line: &str) -> (usize, Vec<SessionHandle>) {
        let results = join_all(
            targets
                .iter()
                .map(|target| deliver(target.sink.as_ref(), line, self.send_timeout)),
        )
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Error sending message to client '{}' ({}): {}",
                        target.identity,
                        target.id,
                        e
                    );
                    failed.push(target.clone());
                }
            }
        }

        (delivered, failed)
    }
}

/// 期限付きで 1 行送信する
pub async fn deliver(
    sink: &dyn LineSink,
    line: &str,
    send_timeout: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(send_timeout, sink.send_line(line)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(send_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{SessionIdFactory, SessionMetadata},
        infrastructure::registry::Activation,
        test_support::{BrokenSink, RecordingSink, StalledSink},
    };
    use hiroba_shared::time::{FixedClock, OffsetFormatter};
    use tokio_util::sync::CancellationToken;

    // 2023-11-14 22:13:20 UTC
    const NOW_MILLIS: i64 = 1_700_000_000_000;
    const NOW_DISPLAY: &str = "14-11-23 22:13";

    struct Fixture {
        registry: Arc<PresenceRegistry>,
        engine: BroadcastEngine,
    }

    fn create_fixture() -> Fixture {
        let registry = Arc::new(PresenceRegistry::new());
        let engine = BroadcastEngine::new(
            registry.clone(),
            Arc::new(FixedClock::from_millis(NOW_MILLIS).unwrap()),
            Arc::new(OffsetFormatter::utc()),
            Duration::from_millis(50),
        );
        Fixture { registry, engine }
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
    async fn test_broadcast_delivers_to_all_live_sessions() {
        // テスト項目: 全てのライブセッションに配信される（送信者にもエコーされる）
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        let bob_sink = Arc::new(RecordingSink::new());
        join(&fixture.registry, "alice", alice_sink.clone()).await;
        join(&fixture.registry, "bob", bob_sink.clone()).await;

        // when (操作):
        let report = fixture.engine.broadcast("hello", None).await;

        // then (期待する結果):
        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());
        assert_eq!(alice_sink.lines(), vec!["hello"]);
        assert_eq!(bob_sink.lines(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_session() {
        // テスト項目: exclude に指定したセッションには配信されない
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        let bob_sink = Arc::new(RecordingSink::new());
        let alice = join(&fixture.registry, "alice", alice_sink.clone()).await;
        join(&fixture.registry, "bob", bob_sink.clone()).await;

        // when (操作):
        let report = fixture.engine.broadcast("hello", Some(alice.id)).await;

        // then (期待する結果):
        assert_eq!(report.delivered, 1);
        assert!(alice_sink.lines().is_empty());
        assert_eq!(bob_sink.lines(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_broadcast_queues_for_sessions_still_replaying_history() {
        // テスト項目: 履歴再送中（未 activate）のセッションには直接書かれず、保留される
        // given (前提条件):
        let fixture = create_fixture();
        let replaying_sink = Arc::new(RecordingSink::new());
        let handle = SessionHandle::new(
            SessionIdFactory::generate(),
            Identity::new("newcomer").unwrap(),
            SessionMetadata::default(),
            replaying_sink.clone(),
            CancellationToken::new(),
        );
        let id = handle.id;
        fixture.registry.register(handle).await;

        // when (操作):
        let report = fixture.engine.broadcast("live traffic", None).await;

        // then (期待する結果):
        assert_eq!(report.delivered, 0);
        assert!(replaying_sink.lines().is_empty());
        assert_eq!(
            fixture.registry.activate(id).await,
            Activation::Drain(vec!["live traffic".to_string()])
        );
    }

    #[tokio::test]
    async fn test_broadcast_message_skips_sessions_that_replayed_it() {
        // テスト項目: 履歴再送で既に受け取ったメッセージは再度配信されない
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        let bob_sink = Arc::new(RecordingSink::new());
        join(&fixture.registry, "alice", alice_sink.clone()).await;
        let bob = join(&fixture.registry, "bob", bob_sink.clone()).await;
        let persisted_at = Utc::now();
        fixture.registry.mark_replayed(bob.id, Some(persisted_at)).await;

        // when (操作):
        let report = fixture.engine.broadcast_message("hi", persisted_at).await;

        // then (期待する結果):
        assert_eq!(report.delivered, 1);
        assert_eq!(alice_sink.lines(), vec!["hi"]);
        assert!(bob_sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_evicts_broken_session_once() {
        // テスト項目: 切断済みの 1 セッションだけが削除され、通知が 1 回だけ送られる
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        let carol_sink = Arc::new(RecordingSink::new());
        join(&fixture.registry, "alice", alice_sink.clone()).await;
        let bob = join(&fixture.registry, "bob", Arc::new(BrokenSink)).await;
        join(&fixture.registry, "carol", carol_sink.clone()).await;

        // when (操作):
        let report = fixture.engine.broadcast("hello", None).await;

        // then (期待する結果):
        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![Identity::new("bob").unwrap()]);
        assert!(bob.eviction.is_cancelled());
        assert_eq!(fixture.registry.snapshot().await.len(), 2);

        let expected = vec![
            "hello".to_string(),
            format!("[{}] System: ==> bob (unexpectedly) left the chat", NOW_DISPLAY),
            "ONLINE_USERS|2|alice|carol".to_string(),
        ];
        assert_eq!(alice_sink.lines(), expected);
        assert_eq!(carol_sink.lines(), expected);
    }

    #[tokio::test]
    async fn test_broadcast_evicts_stalled_session_after_timeout() {
        // テスト項目: 応答しない接続は送信タイムアウト後に削除され、他への配信は完了する
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        join(&fixture.registry, "alice", alice_sink.clone()).await;
        join(&fixture.registry, "slowpoke", Arc::new(StalledSink)).await;

        // when (操作):
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            fixture.engine.broadcast("hello", None),
        )
        .await
        .expect("broadcast must not hang on a stalled peer");

        // then (期待する結果):
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![Identity::new("slowpoke").unwrap()]);
        assert_eq!(alice_sink.lines()[0], "hello");
        assert_eq!(alice_sink.lines().last().unwrap(), "ONLINE_USERS|1|alice");
    }

    #[tokio::test]
    async fn test_broadcast_evicts_each_broken_session_exactly_once() {
        // テスト項目: 複数の切断済みセッションがそれぞれ 1 回だけ通知される
        // given (前提条件):
        let fixture = create_fixture();
        let alice_sink = Arc::new(RecordingSink::new());
        join(&fixture.registry, "alice", alice_sink.clone()).await;
        join(&fixture.registry, "bob", Arc::new(BrokenSink)).await;
        join(&fixture.registry, "dave", Arc::new(BrokenSink)).await;

        // when (操作):
        let report = fixture.engine.broadcast("hello", None).await;

        // then (期待する結果):
        assert_eq!(report.evicted.len(), 2);
        let lines = alice_sink.lines();
        let count = |needle: &str| lines.iter().filter(|l| l.contains(needle)).count();
        assert_eq!(count("==> bob (unexpectedly) left the chat"), 1);
        assert_eq!(count("==> dave (unexpectedly) left the chat"), 1);
        assert_eq!(lines.last().unwrap(), "ONLINE_USERS|1|alice");
        assert_eq!(fixture.registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_reports_timeout() {
        // テスト項目: deliver は期限内に書き込めなければ Timeout を返す
        // given (前提条件):
        let sink = StalledSink;

        // when (操作):
        let result = deliver(&sink, "hello", Duration::from_millis(10)).await;

        // then (期待する結果):
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }
}
