//! ドメインモデル：identity、メッセージ本文、セッション、永続化されたメッセージ

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use hiroba_shared::time::UtcOffset;
use serde::Serialize;

use super::error::DomainError;

/// identity の最大文字数
pub const MAX_IDENTITY_LENGTH: usize = 50;

/// メッセージ本文の最大文字数
pub const MAX_BODY_LENGTH: usize = 500;

/// 参加・退出通知の送信者名。クライアントは名乗れない
pub const SYSTEM_IDENTITY: &str = "System";

/// セッションに紐づく表示名。個人宛メッセージの宛先キーでもある
///
/// セッション間で一意ではない（同じ名前で 2 本接続できる）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// 検証して identity を作成
    ///
    /// 前後の空白は除去する。空でなく、[`MAX_IDENTITY_LENGTH`] 文字以内で、
    /// 空白・制御文字・`|`（いずれもワイヤ上の区切り）を含まず、
    /// [`SYSTEM_IDENTITY`] でないこと。
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value: String = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(DomainError::EmptyIdentity);
        }

        let length = trimmed.chars().count();
        if length > MAX_IDENTITY_LENGTH {
            return Err(DomainError::IdentityTooLong {
                max: MAX_IDENTITY_LENGTH,
                actual: length,
            });
        }

        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '|')
        {
            return Err(DomainError::InvalidIdentity(trimmed.to_string()));
        }

        if trimmed.eq_ignore_ascii_case(SYSTEM_IDENTITY) {
            return Err(DomainError::ReservedIdentity(trimmed.to_string()));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 公開・個人宛メッセージの本文（長さ制限あり）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody(String);

impl MessageBody {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value: String = value.into();

        if value.trim().is_empty() {
            return Err(DomainError::EmptyBody);
        }

        let length = value.chars().count();
        if length > MAX_BODY_LENGTH {
            return Err(DomainError::BodyTooLong {
                max: MAX_BODY_LENGTH,
                actual: length,
            });
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 接続 1 本を識別する ID
///
/// 増加順に払い出されるため、ID の順序は接続順と一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// プロセス内で一意かつ単調増加する [`SessionId`] のファクトリ
pub struct SessionIdFactory;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionIdFactory {
    pub fn generate() -> SessionId {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// ハンドシェイクで送られるセッションごとのメタデータ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    /// このセッションの時刻表示に使う UTC オフセット（表示専用）
    pub utc_offset: Option<UtcOffset>,
}

/// 永続化された公開メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// 永続化された個人宛メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}
