use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::content::ContentPipeline;
use parley_shared::protocol::ChatEvent;
use parley_shared::validation::validate_credentials;
use parley_shared::{
    Message, MessageId, Notification, ProfileUpdate, UserProfile, UserSettings, UserStatus,
};
use parley_store::{MessageStore, TimeRange, UserStore};

use crate::auth::{self, SessionTable};
use crate::cache::ReadCache;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, GroupCreated};
use crate::error::ServerError;
use crate::notifications::NotificationService;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::webhook::{WebhookQueue, WebhookTransport};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub messages: Arc<MessageStore>,
    pub users: Arc<UserStore>,
    pub presence: PresenceTracker,
    pub registry: ConnectionRegistry,
    pub notifications: NotificationService,
    pub sessions: SessionTable,
    pub pipeline: ContentPipeline,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Open the stores under the configured data directory and wire up every
    /// component. Starts the webhook worker.
    pub async fn build(
        config: ServerConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> anyhow::Result<Self> {
        let messages = Arc::new(MessageStore::open(config.messages_path()).await?);
        let users = Arc::new(UserStore::open(config.users_path()).await?);

        let (webhooks, _worker) = WebhookQueue::spawn(transport);
        let notifications = NotificationService::new(webhooks, config.webhook_urls.clone());

        let cache = ReadCache::new(config.cache_ttl);
        let registry = ConnectionRegistry::new();
        let pipeline = ContentPipeline::default();

        let dispatcher = Dispatcher::new(
            messages.clone(),
            users.clone(),
            cache,
            registry.clone(),
            notifications.clone(),
            pipeline.clone(),
        );

        Ok(Self {
            dispatcher,
            messages,
            users,
            presence: PresenceTracker::new(),
            registry,
            notifications,
            sessions: SessionTable::new(),
            pipeline,
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.config.max_body_size;

    Router::new()
        .route("/health", get(health_check))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/ws", get(ws_handler))
        .route("/api/messages", get(list_messages))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/edit", post(edit_message))
        .route("/api/messages/delete", post(delete_message))
        .route("/api/messages/read", post(mark_read))
        .route("/api/messages/reply", post(reply_message))
        .route("/api/messages/search", get(search_messages))
        .route("/api/messages/export", get(export_messages))
        .route("/api/messages/stats", get(message_stats))
        .route("/api/history", get(history))
        .route("/api/users/online", get(online_users))
        .route("/api/users/status", get(user_status))
        .route("/api/avatar", post(update_avatar))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/profile", get(get_profile).post(update_profile))
        .route("/api/typing", get(typing_status).post(report_typing))
        .route("/api/groups", get(list_groups))
        .route("/api/groups/create", post(create_group))
        .route(
            "/api/notifications",
            get(unread_notifications)
                .post(mark_notification)
                .delete(clear_notifications),
        )
        .route("/api/notifications/all", get(all_notifications))
        .route("/api/notifications/group", get(group_notifications))
        .route("/api/notifications/read-all", post(mark_all_notifications))
        .route("/api/notifications/webhooks", post(add_webhook))
        .route("/api/preview", post(preview))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Serialize, Deserialize)]
struct LoginResponse {
    token: String,
    username: String,
}

#[derive(Deserialize)]
struct MessageIdRequest {
    message_id: MessageId,
}

#[derive(Deserialize)]
struct EditRequest {
    message_id: MessageId,
    content: String,
}

#[derive(Deserialize)]
struct ReplyRequest {
    reply_to: MessageId,
    to_user: String,
    content: String,
}

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    with: Option<String>,
}

#[derive(Deserialize)]
struct StatusQuery {
    user: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StatsResponse {
    total_messages: usize,
    unread_count: usize,
    group_count: usize,
}

#[derive(Deserialize)]
struct AvatarRequest {
    avatar: String,
}

#[derive(Deserialize)]
struct TypingRequest {
    to_user: String,
    is_typing: bool,
}

#[derive(Deserialize)]
struct TypingQuery {
    from: String,
}

#[derive(Serialize, Deserialize)]
struct TypingResponse {
    is_typing: bool,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Deserialize)]
struct NotificationIdRequest {
    notification_id: u64,
}

#[derive(Deserialize)]
struct WebhookRequest {
    url: String,
}

#[derive(Deserialize)]
struct PreviewRequest {
    content: String,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.len().await,
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<(StatusCode, Json<UserProfile>), ServerError> {
    let username = validate_credentials(&req.username, &req.password)?;
    let hash = auth::hash_password(req.password).await?;
    let user = state.users.register(&username, hash).await?;
    Ok((StatusCode::CREATED, Json(UserProfile::from(&user))))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<Json<LoginResponse>, ServerError> {
    let username = req.username.trim();
    let user = state
        .users
        .find(username)
        .await
        .ok_or(ServerError::Unauthenticated)?;

    if !auth::verify_password(req.password, user.password.clone()).await {
        return Err(ServerError::Unauthenticated);
    }

    let token = state.sessions.issue(&user.username).await;
    info!(user = %user.username, "User logged in");
    Ok(Json(LoginResponse {
        token,
        username: user.username,
    }))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ServerError> {
    let token = auth::bearer_token(&headers).ok_or(ServerError::Unauthenticated)?;
    state
        .sessions
        .revoke(token)
        .await
        .ok_or(ServerError::Unauthenticated)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let mut messages = state.dispatcher.messages_for(&username).await;

    if let Some(needle) = query.q.map(|q| q.to_lowercase()).filter(|q| !q.is_empty()) {
        messages.retain(|m| m.content.to_lowercase().contains(&needle));
    }
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<ChatEvent>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let message = state.dispatcher.dispatch(&username, event).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EditRequest>,
) -> Result<Json<Message>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let message = state
        .dispatcher
        .edit(req.message_id, &username, &req.content)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessageIdRequest>,
) -> Result<StatusCode, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    state.dispatcher.delete(req.message_id, &username).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessageIdRequest>,
) -> Result<Json<Message>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let message = state.dispatcher.mark_read(req.message_id, &username).await?;
    Ok(Json(message))
}

async fn reply_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReplyRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let event = ChatEvent {
        to_user: req.to_user,
        content: req.content,
        reply_to: Some(req.reply_to),
        ..Default::default()
    };
    let message = state.dispatcher.dispatch(&username, event).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Midnight UTC of a `YYYY-MM-DD` date. Absent or empty means unbounded.
fn parse_day(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, ServerError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ServerError::BadRequest(format!("{field} must be YYYY-MM-DD")))?;
    Ok(day.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()))
}

async fn search_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let range = TimeRange {
        after: parse_day(query.start.as_deref(), "start")?,
        before: parse_day(query.end.as_deref(), "end")?,
    };
    let results = state
        .messages
        .search(&username, query.q.as_deref().unwrap_or(""), range)
        .await;
    Ok(Json(results))
}

async fn export_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let export = state.messages.export(&username).await;
    let body = serde_json::to_vec_pretty(&export)
        .map_err(|e| ServerError::Internal(format!("Failed to encode export: {e}")))?;

    let disposition = format!(
        "attachment; filename=messages_{}_{}.json",
        username,
        export.export_date.format("%Y-%m-%d")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn message_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(StatsResponse {
        total_messages: state.messages.count().await,
        unread_count: state.messages.unread_count(&username).await,
        group_count: state.messages.groups_for(&username).await.len(),
    }))
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let with = query
        .with
        .filter(|w| !w.is_empty())
        .ok_or_else(|| ServerError::BadRequest("User parameter required".into()))?;
    Ok(Json(state.messages.history(&username, &with).await))
}

// ---------------------------------------------------------------------------
// Users and presence
// ---------------------------------------------------------------------------

async fn online_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ServerError> {
    state.sessions.authenticate(&headers).await?;
    Ok(Json(state.users.online_users().await))
}

async fn user_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<UserStatus>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let target = query.user.unwrap_or(username);
    Ok(Json(state.presence.status(&target).await))
}

async fn update_avatar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AvatarRequest>,
) -> Result<Json<UserProfile>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let user = state.users.update_avatar(&username, req.avatar).await?;
    Ok(Json(UserProfile::from(&user)))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserSettings>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let user = state
        .users
        .find(&username)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("user '{username}'")))?;
    Ok(Json(user.settings))
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(settings): Json<UserSettings>,
) -> Result<Json<UserSettings>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let user = state.users.update_settings(&username, settings).await?;
    Ok(Json(user.settings))
}

async fn get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let user = state
        .users
        .find(&username)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("user '{username}'")))?;
    Ok(Json(UserProfile::from(&user)))
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(profile): Json<ProfileUpdate>,
) -> Result<Json<UserProfile>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let user = state.users.update_profile(&username, profile).await?;
    Ok(Json(UserProfile::from(&user)))
}

async fn report_typing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TypingRequest>,
) -> Result<StatusCode, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    state
        .presence
        .set_typing(&username, &req.to_user, req.is_typing)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Whether `from` is currently typing to the caller.
async fn typing_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TypingQuery>,
) -> Result<Json<TypingResponse>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(TypingResponse {
        is_typing: state.presence.is_typing(&query.from, &username).await,
    }))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupCreated>), ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    let group = state
        .dispatcher
        .create_group(&username, &req.name, req.users)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Vec<String>>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(state.messages.groups_for(&username).await))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

async fn unread_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Notification>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(state.notifications.unread(&username).await))
}

async fn all_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Notification>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(state.notifications.all(&username).await))
}

async fn group_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Notification>>, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    Ok(Json(state.notifications.group(&username).await))
}

async fn mark_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NotificationIdRequest>,
) -> Result<StatusCode, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    if !state
        .notifications
        .mark_read(&username, req.notification_id)
        .await
    {
        return Err(ServerError::NotFound(format!(
            "notification {}",
            req.notification_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    state.notifications.mark_all_read(&username).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ServerError> {
    let username = state.sessions.authenticate(&headers).await?;
    state.notifications.clear_all(&username).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WebhookRequest>,
) -> Result<StatusCode, ServerError> {
    state.sessions.authenticate(&headers).await?;
    let url = req.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ServerError::BadRequest("webhook url must be http(s)".into()));
    }
    state.notifications.add_webhook(url.to_string()).await;
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

async fn preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PreviewRequest>,
) -> Result<Response, ServerError> {
    state.sessions.authenticate(&headers).await?;
    let html = state.pipeline.process(&req.content);
    Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::Engine;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::webhook::tests::RecordingTransport;

    async fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = AppState::build(config, Arc::new(RecordingTransport::default()))
            .await
            .unwrap();
        (state, dir)
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn signup(state: &AppState, username: &str) -> String {
        let creds = json!({ "username": username, "password": "secret1" });
        let (status, _) = call(state, Method::POST, "/register", None, Some(creds.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(state, Method::POST, "/login", None, Some(creds)).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice::<LoginResponse>(&body).unwrap().token
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (state, _dir) = test_state().await;
        let (status, body) = call(&state, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_session() {
        let (state, _dir) = test_state().await;
        let (status, _) = call(&state, Method::GET, "/api/messages", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&state, Method::GET, "/api/messages", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let (state, _dir) = test_state().await;
        signup(&state, "alice").await;

        let dup = json!({ "username": "alice", "password": "secret1" });
        let (status, _) = call(&state, Method::POST, "/register", None, Some(dup)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let short = json!({ "username": "al", "password": "secret1" });
        let (status, _) = call(&state, Method::POST, "/register", None, Some(short)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let wrong = json!({ "username": "alice", "password": "nope-nope" });
        let (status, _) = call(&state, Method::POST, "/login", None, Some(wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_read_and_stats() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/messages/send",
            Some(&alice),
            Some(json!({ "to_user": "bob", "content": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let sent: Message = serde_json::from_slice(&body).unwrap();
        assert_eq!(sent.from_user, "alice");
        assert!(!sent.is_read);

        let (_, body) = call(&state, Method::GET, "/api/messages/stats", Some(&bob), None).await;
        let stats: StatsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.unread_count, 1);
        assert_eq!(stats.total_messages, 1);

        // Only the recipient may mark as read.
        let read = json!({ "message_id": sent.id });
        let (status, _) =
            call(&state, Method::POST, "/api/messages/read", Some(&alice), Some(read.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) =
            call(&state, Method::POST, "/api/messages/read", Some(&bob), Some(read)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&state, Method::GET, "/api/messages/stats", Some(&bob), None).await;
        let stats: StatsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.unread_count, 0);

        let (_, body) = call(&state, Method::GET, "/api/notifications", Some(&bob), None).await;
        let notes: Vec<Notification> = serde_json::from_slice(&body).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "New message from alice");
    }

    #[tokio::test]
    async fn test_edit_and_delete_ownership() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        let (_, body) = call(
            &state,
            Method::POST,
            "/api/messages/send",
            Some(&alice),
            Some(json!({ "to_user": "bob", "content": "draft" })),
        )
        .await;
        let sent: Message = serde_json::from_slice(&body).unwrap();

        let edit = json!({ "message_id": sent.id, "content": "mine now" });
        let (status, _) =
            call(&state, Method::POST, "/api/messages/edit", Some(&bob), Some(edit)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(state.messages.get(sent.id).await.unwrap().content, "draft");

        let delete = json!({ "message_id": sent.id });
        let (status, _) =
            call(&state, Method::POST, "/api/messages/delete", Some(&bob), Some(delete.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) =
            call(&state, Method::POST, "/api/messages/delete", Some(&alice), Some(delete.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) =
            call(&state, Method::POST, "/api/messages/delete", Some(&alice), Some(delete)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_date_bounds() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        signup(&state, "bob").await;

        call(
            &state,
            Method::POST,
            "/api/messages/send",
            Some(&alice),
            Some(json!({ "to_user": "bob", "content": "Quarterly Report" })),
        )
        .await;

        let (_, body) =
            call(&state, Method::GET, "/api/messages/search?q=report", Some(&alice), None).await;
        let found: Vec<Message> = serde_json::from_slice(&body).unwrap();
        assert_eq!(found.len(), 1);

        let (_, body) = call(
            &state,
            Method::GET,
            "/api/messages/search?q=report&end=2000-01-01",
            Some(&alice),
            None,
        )
        .await;
        let found: Vec<Message> = serde_json::from_slice(&body).unwrap();
        assert!(found.is_empty());

        let (status, _) = call(
            &state,
            Method::GET,
            "/api/messages/search?start=yesterday",
            Some(&alice),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_groups_and_history() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;
        signup(&state, "carol").await;

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/groups/create",
            Some(&alice),
            Some(json!({ "name": "team", "users": ["bob", "carol"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&state, Method::GET, "/api/groups", Some(&bob), None).await;
        let groups: Vec<Vec<String>> = serde_json::from_slice(&body).unwrap();
        assert_eq!(groups, vec![vec!["bob", "carol", "alice"]]);

        let (_, body) =
            call(&state, Method::GET, "/api/notifications/group", Some(&bob), None).await;
        let notes: Vec<Notification> = serde_json::from_slice(&body).unwrap();
        assert_eq!(notes.len(), 1);

        let (status, _) = call(&state, Method::GET, "/api/history", Some(&bob), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_attachment_limits() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        signup(&state, "bob").await;

        let data = base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.4");
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/messages/send",
            Some(&alice),
            Some(json!({
                "to_user": "bob",
                "content": "",
                "attachment": { "file_name": "notes.pdf", "file_data": data },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let sent: Message = serde_json::from_slice(&body).unwrap();
        assert!(sent.content.ends_with("[Attachment: notes.pdf]"));

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/messages/send",
            Some(&alice),
            Some(json!({
                "to_user": "bob",
                "content": "run me",
                "attachment": { "file_name": "tool.exe", "file_data": "" },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_typing_and_preview() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;
        let bob = signup(&state, "bob").await;

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/typing",
            Some(&alice),
            Some(json!({ "to_user": "bob", "is_typing": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&state, Method::GET, "/api/typing?from=alice", Some(&bob), None).await;
        let typing: TypingResponse = serde_json::from_slice(&body).unwrap();
        assert!(typing.is_typing);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/preview",
            Some(&alice),
            Some(json!({ "content": "<script>x</script> :star:" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "&lt;script&gt;x&lt;/script&gt; ⭐"
        );
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let (state, _dir) = test_state().await;
        let alice = signup(&state, "alice").await;

        let (status, _) = call(&state, Method::POST, "/logout", Some(&alice), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, Method::GET, "/api/profile", Some(&alice), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
