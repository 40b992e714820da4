//! UseCase 層のエラー型

use thiserror::Error;

use crate::domain::{DomainError, StoreError};

/// [`SendMessageUseCase`](super::SendMessageUseCase) のエラー
#[derive(Debug, Error)]
pub enum SendMessageError {
    #[error("invalid message body: {0}")]
    InvalidBody(#[from] DomainError),

    #[error("failed to persist message: {0}")]
    Store(#[from] StoreError),
}
