//! UseCase 層：全セッションが共有するメッセージ配信処理

pub mod broadcast;
pub mod error;
pub mod notify_presence;
pub mod route_private_message;
pub mod send_message;

pub use broadcast::{BroadcastEngine, BroadcastReport};
pub use error::SendMessageError;
pub use notify_presence::PresenceNotifier;
pub use route_private_message::{PrivateMessageRouter, RouteResult};
pub use send_message::SendMessageUseCase;
