pub mod jwt;
pub mod middleware;

/// Identity handed to the chat engine after successful token validation.
/// The engine itself never inspects tokens — it only sees this.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub nombre: String,
    pub role: String,
}

/// Token validation capability consumed by the WebSocket upgrade handler.
/// Returns None for any token that must not produce a connection.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<Identity>;
}
