//! Shared application state handed to every connection task.

use std::sync::Arc;

use hiroba_shared::time::{Clock, TimestampFormatter};

use crate::{
    config::SessionSettings,
    domain::MessageStore,
    infrastructure::registry::PresenceRegistry,
    usecase::{BroadcastEngine, PresenceNotifier, PrivateMessageRouter, SendMessageUseCase},
};

pub struct AppState {
    /// PresenceRegistry（接続中セッションの管理）
    pub registry: Arc<PresenceRegistry>,
    /// MessageStore（永続化の抽象化）
    pub store: Arc<dyn MessageStore>,
    pub broadcast: Arc<BroadcastEngine>,
    pub presence: PresenceNotifier,
    pub send_message: SendMessageUseCase,
    pub private_router: PrivateMessageRouter,
    pub clock: Arc<dyn Clock>,
    pub formatter: Arc<dyn TimestampFormatter>,
    pub settings: SessionSettings,
}

impl AppState {
    /// Wire the use cases around one registry and one store.
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        formatter: Arc<dyn TimestampFormatter>,
        settings: SessionSettings,
    ) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        let broadcast = Arc::new(BroadcastEngine::new(
            registry.clone(),
            clock.clone(),
            formatter.clone(),
            settings.send_timeout,
        ));
        let presence = PresenceNotifier::new(registry.clone(), broadcast.clone());
        let send_message =
            SendMessageUseCase::new(store.clone(), broadcast.clone(), formatter.clone());
        let private_router = PrivateMessageRouter::new(
            registry.clone(),
            store.clone(),
            broadcast.clone(),
            formatter.clone(),
        );

        Self {
            registry,
            store,
            broadcast,
            presence,
            send_message,
            private_router,
            clock,
            formatter,
            settings,
        }
    }
}
