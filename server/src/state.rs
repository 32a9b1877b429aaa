use std::sync::Arc;

use crate::config::ChatConfig;
use crate::store::MessageStore;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Conversation and message persistence
    pub store: Arc<dyn MessageStore>,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active conversation connections
    pub connections: ConnectionRegistry,
    /// Message limits and keepalive timings
    pub chat: ChatConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn MessageStore>, jwt_secret: Vec<u8>, chat: ChatConfig) -> Self {
        Self {
            store,
            jwt_secret,
            connections: ConnectionRegistry::new(),
            chat,
        }
    }
}
