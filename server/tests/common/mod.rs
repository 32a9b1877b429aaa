//! Shared helpers: a real server on a random port backed by a temp dir.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tempest_chat_server::auth::jwt;
use tempest_chat_server::config::ChatConfig;
use tempest_chat_server::db::models::User;
use tempest_chat_server::state::AppState;
use tempest_chat_server::store::{MessageStore, SqliteStore};
use tempest_chat_shared::{Conversation, ServerFrame};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: Arc<SqliteStore>,
    pub jwt_secret: Vec<u8>,
    _tmp_dir: tempfile::TempDir,
}

/// Start the server on a random port.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(ChatConfig {
        rest_burst: 1000,
        ..ChatConfig::default()
    })
    .await
}

/// Start the server with specific gateway settings.
pub async fn start_test_server_with(chat: ChatConfig) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let store = Arc::new(SqliteStore::open(&data_dir).expect("Failed to open store"));
    let jwt_secret =
        jwt::load_or_generate_jwt_secret(&data_dir).expect("Failed to generate JWT secret");
    let state = AppState::new(store.clone(), jwt_secret.clone(), chat);

    let app = tempest_chat_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        state,
        store,
        jwt_secret,
        _tmp_dir: tmp_dir,
    }
}

impl TestServer {
    /// Create a user and an access token for it.
    pub fn user(&self, name: &str) -> (User, String) {
        let user = self
            .store
            .create_user(name, &format!("{name}@example.com"))
            .expect("create user");
        let token = jwt::issue_access_token(&self.jwt_secret, user.id, &user.username)
            .expect("issue token");
        (user, token)
    }

    pub fn conversation(&self, landlord: &User, guest: &User) -> Conversation {
        self.store
            .create_conversation(landlord.id, guest.id, None)
            .expect("create conversation")
            .0
    }

    pub fn ws_url(&self, conversation_id: Uuid, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws/chat/{}?token={}", self.addr, conversation_id, token),
            None => format!("ws://{}/ws/chat/{}", self.addr, conversation_id),
        }
    }

    /// Connect and wait for the `ready` frame.
    pub async fn connect(&self, conversation_id: Uuid, token: &str) -> WsStream {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.ws_url(conversation_id, Some(token)))
            .await
            .expect("WebSocket connect");
        match next_frame(&mut ws).await {
            Some(ServerFrame::Ready { .. }) => ws,
            other => panic!("expected ready frame, got {other:?}"),
        }
    }
}

/// Next JSON frame, skipping control frames. `None` on close or timeout.
pub async fn next_frame(ws: &mut WsStream) -> Option<ServerFrame> {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).expect("server frame"))
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Assert that nothing arrives for a short while.
pub async fn assert_silent(ws: &mut WsStream) {
    match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_)))) => {}
        Ok(other) => panic!("expected no frame, got {other:?}"),
    }
}

/// Wait for the close frame and return its code.
pub async fn close_code(ws: &mut WsStream) -> Option<u16> {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

pub async fn send_text(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::text(value.to_string())).await.expect("send frame");
}
