//! ドメイン層：値オブジェクト、永続化レコード、ユースケースが依存する
//! インターフェース（MessageStore、LineSink）

pub mod error;
pub mod model;
pub mod sink;
pub mod store;

pub use error::{DomainError, StoreError, TransportError};
pub use model::{
    ChatMessage, Identity, MAX_BODY_LENGTH, MAX_IDENTITY_LENGTH, MessageBody, PrivateMessage,
    SYSTEM_IDENTITY, SessionId, SessionIdFactory, SessionMetadata,
};
pub use sink::LineSink;
pub use store::MessageStore;

#[cfg(test)]
pub use store::MockMessageStore;
