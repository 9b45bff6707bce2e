use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::Method,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_shared::message::{ChatMessage, MessageStatus};
use huddle_shared::protocol::InboundFrame;
use huddle_shared::types::{MessageId, Profile, UserId};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::relay::{self, Hub};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            store: Arc::new(Store::new()),
            hub: Arc::new(Hub::new(config.channel_buffer)),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws/{user_id}", get(ws_upgrade))
        .route("/api/users/{user_id}/profile", get(get_profile).post(save_profile))
        .route("/api/users/{user_id}/friends", get(list_friends).post(add_friend))
        .route("/api/messages/status", post(update_status))
        .route("/api/messages/{user_id}/{peer_id}", get(history))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online: usize,
}

#[derive(Serialize)]
struct FriendEntry {
    user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

#[derive(Serialize)]
struct FriendsResponse {
    friends: Vec<FriendEntry>,
}

#[derive(Deserialize)]
struct AddFriendRequest {
    friend_id: UserId,
}

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct StatusRequest {
    message_ids: Vec<MessageId>,
    status: MessageStatus,
}

#[derive(Serialize)]
struct StatusResponse {
    updated: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online: state.hub.online_count(),
    })
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let user = parse_user(&user_id)?;
    Ok(ws.on_upgrade(move |socket| {
        relay::serve_socket(socket, user, state.hub, state.store, state.config)
    }))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Profile>, ServerError> {
    let user = parse_user(&user_id)?;
    state
        .store
        .profile(&user)
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("no profile for {user}")))
}

async fn save_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(profile): Json<Profile>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = parse_user(&user_id)?;
    info!(user = %user.short(), username = %profile.username, "Profile saved");
    state.store.save_profile(user, profile);
    Ok(Json(serde_json::json!({ "saved": true })))
}

async fn list_friends(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<FriendsResponse>, ServerError> {
    let user = parse_user(&user_id)?;
    let friends = state
        .store
        .friends(&user)
        .into_iter()
        .map(|friend| FriendEntry {
            username: state.store.profile(&friend).map(|p| p.username),
            user_id: friend,
        })
        .collect();
    Ok(Json(FriendsResponse { friends }))
}

async fn add_friend(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<AddFriendRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = parse_user(&user_id)?;
    if req.friend_id == user {
        return Err(ServerError::BadRequest("cannot befriend yourself".into()));
    }
    let added = state.store.add_friend(user, req.friend_id);
    Ok(Json(serde_json::json!({ "added": added })))
}

async fn history(
    State(state): State<AppState>,
    Path((user_id, peer_id)): Path<(String, String)>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let user = parse_user(&user_id)?;
    let peer = parse_user(&peer_id)?;
    Ok(Json(HistoryResponse {
        messages: state.store.history(&user, &peer),
    }))
}

/// Batched status change. Senders of messages that became read are told
/// through `messages_read` on their sockets.
async fn update_status(
    State(state): State<AppState>,
    Json(req): Json<StatusRequest>,
) -> Json<StatusResponse> {
    let changed = state.store.update_status(&req.message_ids, req.status);

    if req.status == MessageStatus::Read {
        let mut by_sender: BTreeMap<UserId, Vec<MessageId>> = BTreeMap::new();
        for message in &changed {
            if let Some(id) = message.id {
                by_sender.entry(message.sender_id.clone()).or_default().push(id);
            }
        }
        for (sender, message_ids) in by_sender {
            state
                .hub
                .send_to(&sender, &InboundFrame::MessagesRead { message_ids });
        }
    }

    Json(StatusResponse {
        updated: changed.len(),
    })
}

fn parse_user(raw: &str) -> Result<UserId, ServerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ServerError::BadRequest("empty user id".into()));
    }
    Ok(UserId::from(raw))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
