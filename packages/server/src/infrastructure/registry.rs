//! プレゼンスレジストリ：オンライン中のセッションを管理する唯一の状態
//!
//! 全ての操作が同じ Mutex を取るため、並行するセッションタスクからの参加・退出・
//! 強制切断・検索は直列化される。呼び出し側には [`SessionHandle`] の複製を返し、
//! ロックを保持したまま I/O を行うことはない。
//!
//! 履歴再送中のセッションは登録済みだがライブではない。その間に届いたライブ行は
//! エントリごとの保留キューに積まれ、[`PresenceRegistry::activate`] で取り出される。
//!
//! ## テスト実装の作業記録
//!
//! ### 何をテストしているか
//! - 登録・削除・snapshot・配信対象の選定・保留キュー
//!
//! ### なぜこのテストが必要か
//! - 履歴再送中に届いたメッセージが失われず、重複もしないことを保証する
//! - 強制切断と通常切断が競合しても削除が 1 回だけ成立することを保証する
//!
//! ### どのような状況を想定しているか
//! - 正常系：登録、activate、配信対象の選定
//! - エッジケース：履歴に含まれるメッセージの保留、同名セッション、並行登録

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{Identity, LineSink, SessionId, SessionMetadata};

/// 接続 1 本分のハンドル
///
/// 接続の送信側（sink）を参照するが所有はしない。接続を閉じるのは
/// このハンドルを作ったセッションライフサイクルの責務。
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub identity: Identity,
    pub metadata: SessionMetadata,
    pub sink: Arc<dyn LineSink>,
    /// 強制切断またはサーバー停止時にキャンセルされる
    pub eviction: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        identity: Identity,
        metadata: SessionMetadata,
        sink: Arc<dyn LineSink>,
        eviction: CancellationToken,
    ) -> Self {
        Self {
            id,
            identity,
            metadata,
            sink,
            eviction,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// レジストリから削除されたセッション
#[derive(Debug, Clone)]
pub struct Deregistered {
    pub handle: SessionHandle,
    /// 履歴再送を終えて参加通知済みだったか
    pub was_live: bool,
}

/// [`PresenceRegistry::activate`] の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// 保留中の行があった。書き込んだ後に再度 activate する
    Drain(Vec<String>),
    /// ライブになった。以降の行は直接届く
    Live,
    /// 既に登録されていない
    Unregistered,
}

/// [`PresenceRegistry::deliver_or_queue`] の結果
#[derive(Debug, Clone)]
pub enum Delivery {
    /// ライブなので呼び出し側が直接書き込む
    Direct(SessionHandle),
    /// 履歴再送中なので保留キューに積んだ
    Queued,
    Unregistered,
}

struct PendingLine {
    line: String,
    persisted_at: Option<DateTime<Utc>>,
}

struct RegistryEntry {
    handle: SessionHandle,
    live: bool,
    /// 再送した履歴の最新時刻。これ以前に永続化されたメッセージは履歴で届いている
    replayed_through: Option<DateTime<Utc>>,
    pending: Vec<PendingLine>,
}

impl RegistryEntry {
    fn already_replayed(&self, persisted_at: Option<DateTime<Utc>>) -> bool {
        matches!(
            (persisted_at, self.replayed_through),
            (Some(at), Some(through)) if at <= through
        )
    }
}

/// 接続から表示名への並行安全なマッピング
#[derive(Default)]
pub struct PresenceRegistry {
    sessions: Mutex<BTreeMap<SessionId, RegistryEntry>>,
}

impl PresenceRegistry {
    /// 新しい PresenceRegistry を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// ハンドシェイクを終えたセッションを登録する
    ///
    /// 登録直後から [`snapshot`](Self::snapshot) に含まれるが、
    /// [`activate`](Self::activate) されるまでライブ行は保留キューに積まれる。
    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        tracing::debug!(
            "Session {} registered as '{}'",
            handle.id,
            handle.identity
        );
        sessions.insert(
            handle.id,
            RegistryEntry {
                handle,
                live: false,
                replayed_through: None,
                pending: Vec::new(),
            },
        );
    }

    /// 再送する履歴の最新時刻を記録する
    ///
    /// それ以前に永続化されたメッセージは保留キューから取り除かれ、以降も積まれない。
    pub async fn mark_replayed(&self, id: SessionId, through: Option<DateTime<Utc>>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.replayed_through = through;
            let pending = std::mem::take(&mut entry.pending);
            entry.pending = pending
                .into_iter()
                .filter(|pending| !entry.already_replayed(pending.persisted_at))
                .collect();
        }
    }

    /// 保留キューが空ならセッションをライブにする。空でなければ中身を取り出して返す
    ///
    /// 呼び出し側は `Drain` の行を書き込んでから再度呼び出す。キューが空になった
    /// 時点でライブになるため、保留していた行は以降の直接配信より必ず先に届く。
    pub async fn activate(&self, id: SessionId) -> Activation {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(&id) else {
            return Activation::Unregistered;
        };
        if entry.pending.is_empty() {
            entry.live = true;
            return Activation::Live;
        }
        Activation::Drain(
            std::mem::take(&mut entry.pending)
                .into_iter()
                .map(|pending| pending.line)
                .collect(),
        )
    }

    /// セッションを削除する。未登録の id は何もせず `None` を返す（冪等）
    ///
    /// 強制切断の経路とセッション自身の終了処理の両方から安全に呼べる。
    pub async fn deregister(&self, id: SessionId) -> Option<Deregistered> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).map(|entry| Deregistered {
            handle: entry.handle,
            was_live: entry.live,
        })
    }

    /// 登録済みの全セッションの identity（接続順）
    pub async fn snapshot(&self) -> Vec<Identity> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .map(|entry| entry.handle.identity.clone())
            .collect()
    }

    /// `line` のブロードキャスト対象を選ぶ
    ///
    /// ライブなセッションのハンドルを返し、履歴再送中のセッションには `line` を
    /// 保留キューに積む。`persisted_at` がそのセッションの再送済み履歴に含まれる
    /// 場合はどちらにもしない。
    pub async fn broadcast_targets(
        &self,
        line: &str,
        exclude: Option<SessionId>,
        persisted_at: Option<DateTime<Utc>>,
    ) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let mut targets = Vec::new();
        for entry in sessions.values_mut() {
            if Some(entry.handle.id) == exclude || entry.already_replayed(persisted_at) {
                continue;
            }
            if entry.live {
                targets.push(entry.handle.clone());
            } else {
                entry.pending.push(PendingLine {
                    line: line.to_string(),
                    persisted_at,
                });
            }
        }
        targets
    }

    /// `identity` で登録された最初のセッション（接続順、履歴再送中を含む）
    pub async fn find_by_identity(&self, identity: &Identity) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .find(|entry| &entry.handle.identity == identity)
            .map(|entry| entry.handle.clone())
    }

    /// 1 セッション宛ての行を、ライブなら直接、履歴再送中なら保留キューで届ける
    pub async fn deliver_or_queue(&self, id: SessionId, line: &str) -> Delivery {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(entry) if entry.live => Delivery::Direct(entry.handle.clone()),
            Some(entry) => {
                entry.pending.push(PendingLine {
                    line: line.to_string(),
                    persisted_at: None,
                });
                Delivery::Queued
            }
            None => Delivery::Unregistered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::SessionIdFactory, test_support::RecordingSink};
    use chrono::TimeDelta;

    fn handle(name: &str) -> SessionHandle {
        SessionHandle::new(
            SessionIdFactory::generate(),
            Identity::new(name).unwrap(),
            SessionMetadata::default(),
            Arc::new(RecordingSink::new()),
            CancellationToken::new(),
        )
    }

    async fn register_live(registry: &PresenceRegistry, handle: SessionHandle) {
        let id = handle.id;
        registry.register(handle).await;
        assert_eq!(registry.activate(id).await, Activation::Live);
    }

    #[tokio::test]
    async fn test_snapshot_is_in_connection_order() {
        // テスト項目: snapshot は接続順に identity を返す
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let charlie = handle("charlie");
        let alice = handle("alice");

        // when (操作):
        registry.register(charlie).await;
        registry.register(alice).await;

        // then (期待する結果):
        let names: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(Identity::into_string)
            .collect();
        assert_eq!(names, vec!["charlie", "alice"]);
    }

    #[tokio::test]
    async fn test_replaying_session_queues_lines_until_activated() {
        // テスト項目: activate されるまでライブ行は保留され、activate で順に取り出される
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let alice = handle("alice");
        let alice_id = alice.id;
        registry.register(alice).await;

        // when (操作):
        let targets = registry.broadcast_targets("first", None, None).await;
        registry.broadcast_targets("second", None, None).await;
        let drained = registry.activate(alice_id).await;
        let activated = registry.activate(alice_id).await;
        let after = registry.broadcast_targets("third", None, None).await;

        // then (期待する結果):
        assert!(targets.is_empty());
        assert_eq!(
            drained,
            Activation::Drain(vec!["first".to_string(), "second".to_string()])
        );
        assert_eq!(activated, Activation::Live);
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn test_lines_already_in_history_are_not_delivered_again() {
        // テスト項目: 再送済み履歴に含まれるメッセージは保留からも直接配信からも除外される
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let bob = handle("bob");
        let bob_id = bob.id;
        registry.register(bob).await;
        let replayed = Utc::now();
        let later = replayed + TimeDelta::microseconds(1);

        // when (操作):
        registry
            .broadcast_targets("in history, queued early", None, Some(replayed))
            .await;
        registry.mark_replayed(bob_id, Some(replayed)).await;
        registry
            .broadcast_targets("in history, queued late", None, Some(replayed))
            .await;
        registry.broadcast_targets("new", None, Some(later)).await;
        let drained = registry.activate(bob_id).await;
        registry.activate(bob_id).await;
        let direct = registry
            .broadcast_targets("in history, sent live", None, Some(replayed))
            .await;

        // then (期待する結果):
        assert_eq!(drained, Activation::Drain(vec!["new".to_string()]));
        assert!(direct.is_empty());
    }

    #[tokio::test]
    async fn test_activate_unknown_session() {
        // テスト項目: 削除済みのセッションの activate は Unregistered を返す
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let alice = handle("alice");
        let alice_id = alice.id;
        registry.register(alice).await;
        registry.deregister(alice_id).await;

        // when (操作):
        let result = registry.activate(alice_id).await;

        // then (期待する結果):
        assert_eq!(result, Activation::Unregistered);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        // テスト項目: 同じセッションを 2 回 deregister しても 2 回目は None（冪等性）
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let alice = handle("alice");
        let alice_id = alice.id;
        register_live(&registry, alice).await;

        // when (操作):
        let first = registry.deregister(alice_id).await;
        let second = registry.deregister(alice_id).await;

        // then (期待する結果):
        assert!(first.is_some_and(|d| d.was_live));
        assert!(second.is_none());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_targets_excludes_session() {
        // テスト項目: exclude に指定したセッションは対象から外れる
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let alice = handle("alice");
        let bob = handle("bob");
        let (alice_id, bob_id) = (alice.id, bob.id);
        register_live(&registry, alice).await;
        register_live(&registry, bob).await;

        // when (操作):
        let targets = registry.broadcast_targets("hi", Some(alice_id), None).await;

        // then (期待する結果):
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, bob_id);
    }

    #[tokio::test]
    async fn test_find_by_identity_returns_first_match() {
        // テスト項目: 同名のセッションが複数ある場合、最初に接続したものが返る
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let first = handle("bob");
        let second = handle("bob");
        let first_id = first.id;
        register_live(&registry, first).await;
        register_live(&registry, second).await;

        // when (操作):
        let found = registry
            .find_by_identity(&Identity::new("bob").unwrap())
            .await;

        // then (期待する結果):
        assert_eq!(found.map(|h| h.id), Some(first_id));
    }

    #[tokio::test]
    async fn test_deliver_or_queue_queues_for_replaying_session() {
        // テスト項目: 履歴再送中のセッション宛ての個人宛メッセージは保留される
        // given (前提条件):
        let registry = PresenceRegistry::new();
        let bob = handle("bob");
        let bob_id = bob.id;
        registry.register(bob).await;

        // when (操作):
        let queued = registry.deliver_or_queue(bob_id, "psst").await;
        let drained = registry.activate(bob_id).await;
        registry.activate(bob_id).await;
        let direct = registry.deliver_or_queue(bob_id, "again").await;

        // then (期待する結果):
        assert!(matches!(queued, Delivery::Queued));
        assert_eq!(drained, Activation::Drain(vec!["psst".to_string()]));
        assert!(matches!(direct, Delivery::Direct(h) if h.id == bob_id));
    }

    #[tokio::test]
    async fn test_concurrent_register_and_deregister() {
        // テスト項目: 並行した登録・削除でも件数が整合する
        // given (前提条件):
        let registry = Arc::new(PresenceRegistry::new());
        let handles: Vec<SessionHandle> = (0..32).map(|i| handle(&format!("user{}", i))).collect();

        // when (操作):
        let mut tasks = Vec::new();
        for (i, h) in handles.into_iter().enumerate() {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = h.id;
                registry.register(h).await;
                if i % 2 == 0 {
                    registry.deregister(id).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // then (期待する結果):
        assert_eq!(registry.snapshot().await.len(), 16);
    }
}
