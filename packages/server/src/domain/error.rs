//! ドメイン層のエラー型

use std::time::Duration;

use thiserror::Error;

/// 値オブジェクトの検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("identity exceeds {max} characters (got {actual})")]
    IdentityTooLong { max: usize, actual: usize },

    #[error("identity '{0}' contains whitespace or '|'")]
    InvalidIdentity(String),

    #[error("identity '{0}' is reserved")]
    ReservedIdentity(String),

    #[error("message body must not be empty")]
    EmptyBody,

    #[error("message body exceeds {max} characters (got {actual})")]
    BodyTooLong { max: usize, actual: usize },
}

/// [`MessageStore`](super::MessageStore) 実装のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// 接続の読み書きで発生するエラー
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds the maximum length")]
    LineTooLong,

    #[error("send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("no data received within {0:?}")]
    Idle(Duration),
}

impl From<tokio_util::codec::LinesCodecError> for TransportError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            tokio_util::codec::LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}
