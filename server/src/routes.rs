use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::JwtSecret;
use crate::chat::{conversations, messages};
use crate::config::ChatConfig;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Identity extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // History reads back every live refresh, so only writes are limited
    let chat_reads = Router::new()
        .route("/api/chat", get(conversations::list_conversations))
        .route("/api/chat/{conversation_id}", get(messages::list_messages));

    let chat_writes = Router::new()
        .route("/api/chat", post(conversations::create_conversation))
        .route("/api/chat/{conversation_id}", post(messages::post_message));
    let chat_writes = with_rate_limit(chat_writes, &state.chat);

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route(
        "/ws/chat/{conversation_id}",
        get(ws_handler::ws_upgrade),
    );

    // Health check
    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(chat_reads)
        .merge(chat_writes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Per-IP rate limiting for the REST chat writes.
/// Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>.
fn with_rate_limit(routes: Router<AppState>, chat: &ChatConfig) -> Router<AppState> {
    let Some(governor_config) = GovernorConfigBuilder::default()
        .key_extractor(PeerIpKeyExtractor)
        .per_second(chat.rest_replenish_secs)
        .burst_size(chat.rest_burst)
        .finish()
    else {
        tracing::warn!("Invalid REST rate limit settings, serving without rate limiting");
        return routes;
    };
    let governor_config = Arc::new(governor_config);

    // Spawn background task to clean up rate limiter state
    let limiter = governor_config.limiter().clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            limiter.retain_recent();
        }
    });

    routes.layer(GovernorLayer {
        config: governor_config,
    })
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
