use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::chat::registry::ChatRegistry;
use crate::chat::store::ChatStore;
use crate::notify::OfflineNotifier;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry: all live chat connections and both indices
    pub registry: Arc<ChatRegistry>,
    /// Persistence collaborator (messages, read receipts, room access)
    pub store: Arc<dyn ChatStore>,
    /// Token validation collaborator for the WebSocket upgrade
    pub validator: Arc<dyn TokenValidator>,
    /// Offline notification collaborator, fire-and-forget
    pub notifier: Arc<dyn OfflineNotifier>,
    /// JWT signing secret for the REST Claims extractor
    pub jwt_secret: Vec<u8>,
}
