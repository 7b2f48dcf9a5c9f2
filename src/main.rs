//! Collab Engine Server - Real-Time Document Collaboration
//!
//! A real-time collaboration server providing:
//! - Collaboration sessions with participant management
//! - Ordered edit dispatch with conflict resolution
//! - Document versioning, annotations, comments and change tracking
//! - Axum with WebSocket for live event fan-out

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

mod broadcast;
mod dispatch;
mod engine;
mod notify;
mod session;
mod store;

use engine::core::{CollaborationOverview, CollaborationStats, RealtimeStats};
use engine::{CollaborationEngine, EditKind, EngineConfig, Position, UserRef};
use notify::{Notification, NotificationStats};
use session::SessionActivity;
use store::annotations::{AnnotationKind, Comment, DocumentAnnotation};
use store::changes::{ChangeDiff, ChangeRecord, StateMap, UserChangeSummary};
use store::versions::{DocumentVersion, VersionDiff};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Collaboration engine
    engine: Arc<CollaborationEngine>,
    /// Server start time
    started_at: std::time::Instant,
}

// ============================================================================
// API TYPES
// ============================================================================

type ApiError = (StatusCode, String);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_sessions: usize,
    connected_clients: usize,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    document_id: String,
    user_id: String,
    username: String,
    max_participants: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: String,
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct ParticipantRequest {
    user_id: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitEditRequest {
    user_id: String,
    kind: EditKind,
    position: Position,
    content: String,
    #[serde(default)]
    previous_version: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SubmitEditResponse {
    edit_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CreateAnnotationRequest {
    user_id: String,
    #[serde(rename = "type")]
    kind: AnnotationKind,
    content: String,
    position: Position,
}

#[derive(Debug, Serialize)]
struct CreateAnnotationResponse {
    annotation_id: String,
}

#[derive(Debug, Deserialize)]
struct UpdateAnnotationRequest {
    content: String,
    #[serde(default)]
    position: Option<Position>,
}

#[derive(Debug, Deserialize)]
struct UserFilter {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateVersionRequest {
    content_snapshot: String,
    created_by: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateVersionResponse {
    version_id: String,
}

#[derive(Debug, Deserialize)]
struct VersionDiffQuery {
    from: u64,
    to: u64,
}

#[derive(Debug, Deserialize)]
struct CreateCommentRequest {
    user_id: String,
    content: String,
    #[serde(default)]
    parent_comment_id: Option<String>,
    #[serde(default)]
    position: Option<Position>,
}

#[derive(Debug, Serialize)]
struct CreateCommentResponse {
    comment_id: String,
}

#[derive(Debug, Deserialize)]
struct SendNotificationRequest {
    user_id: String,
    #[serde(rename = "type")]
    kind: String,
    title: String,
    message: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    #[serde(default)]
    unread_only: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct MarkAllReadResponse {
    marked: usize,
}

#[derive(Debug, Deserialize)]
struct TrackChangeRequest {
    user_id: String,
    change_type: String,
    description: String,
    #[serde(default)]
    before_state: Option<StateMap>,
    #[serde(default)]
    after_state: Option<StateMap>,
}

#[derive(Debug, Serialize)]
struct TrackChangeResponse {
    change_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_summary_days")]
    days: i64,
}

fn default_limit() -> usize {
    50
}

fn default_summary_days() -> i64 {
    30
}

// ============================================================================
// SESSION HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.realtime_stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: stats.active_sessions,
        connected_clients: stats.connected_clients,
    })
}

/// Create a collaboration session on a document
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Json<CreateSessionResponse> {
    let creator = UserRef::new(payload.user_id, payload.username);
    let session_id =
        state
            .engine
            .create_session(&payload.document_id, creator, payload.max_participants);

    info!("Created session {} on {}", session_id, payload.document_id);

    Json(CreateSessionResponse {
        ws_url: format!("/ws/{}", session_id),
        session_id,
    })
}

/// Join an existing session
async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<ParticipantRequest>,
) -> Result<StatusCode, ApiError> {
    let username = payload.username.unwrap_or_else(|| payload.user_id.clone());
    let user = UserRef::new(payload.user_id, username);

    if state.engine.join_session(&session_id, user) {
        Ok(StatusCode::OK)
    } else {
        Err((
            StatusCode::CONFLICT,
            "Session is unknown, inactive or full".to_string(),
        ))
    }
}

/// Leave a session
async fn leave_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<ParticipantRequest>,
) -> Result<StatusCode, ApiError> {
    if state.engine.leave_session(&session_id, &payload.user_id) {
        Ok(StatusCode::OK)
    } else {
        Err((StatusCode::NOT_FOUND, "Not a session participant".to_string()))
    }
}

/// List session participants
async fn session_participants(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Vec<UserRef>> {
    Json(state.engine.session_participants(&session_id))
}

/// Session activity snapshot
async fn session_activity(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionActivity>, ApiError> {
    state
        .engine
        .session_activity(&session_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Unknown session".to_string()))
}

/// End a session
async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.end_session(&session_id) {
        Ok(StatusCode::OK)
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown session".to_string()))
    }
}

/// Submit a collaborative edit
async fn submit_edit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<SubmitEditRequest>,
) -> Result<Json<SubmitEditResponse>, ApiError> {
    state
        .engine
        .apply_collaborative_edit(
            &session_id,
            &payload.user_id,
            payload.kind,
            payload.position,
            payload.content,
            payload.previous_version,
        )
        .map(|edit_id| {
            Json(SubmitEditResponse {
                edit_id,
                status: "queued".to_string(),
            })
        })
        .ok_or_else(|| {
            (
                StatusCode::CONFLICT,
                "Session is unknown or inactive, or the queue is full".to_string(),
            )
        })
}

// ============================================================================
// ANNOTATION HANDLERS
// ============================================================================

async fn create_annotation(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(payload): Json<CreateAnnotationRequest>,
) -> Result<Json<CreateAnnotationResponse>, ApiError> {
    state
        .engine
        .add_annotation(
            &document_id,
            &payload.user_id,
            payload.kind,
            payload.content,
            payload.position,
        )
        .map(|annotation_id| Json(CreateAnnotationResponse { annotation_id }))
        .ok_or_else(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Operation queue is full".to_string(),
            )
        })
}

async fn update_annotation(
    State(state): State<Arc<AppState>>,
    Path(annotation_id): Path<String>,
    Json(payload): Json<UpdateAnnotationRequest>,
) -> Result<StatusCode, ApiError> {
    if state
        .engine
        .update_annotation(&annotation_id, payload.content, payload.position)
    {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown annotation".to_string()))
    }
}

async fn resolve_annotation(
    State(state): State<Arc<AppState>>,
    Path(annotation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.resolve_annotation(&annotation_id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown annotation".to_string()))
    }
}

async fn document_annotations(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Query(filter): Query<UserFilter>,
) -> Json<Vec<DocumentAnnotation>> {
    let annotations = match filter.user_id {
        Some(user_id) => state.engine.user_annotations(&user_id, &document_id),
        None => state.engine.document_annotations(&document_id),
    };
    Json(annotations)
}

// ============================================================================
// VERSION HANDLERS
// ============================================================================

async fn create_version(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(payload): Json<CreateVersionRequest>,
) -> Json<CreateVersionResponse> {
    let version_id = state.engine.create_document_version(
        &document_id,
        payload.content_snapshot,
        &payload.created_by,
        payload.description,
    );
    Json(CreateVersionResponse { version_id })
}

async fn document_versions(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Json<Vec<DocumentVersion>> {
    Json(state.engine.document_versions(&document_id))
}

async fn version_diff(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Query(query): Query<VersionDiffQuery>,
) -> Result<Json<VersionDiff>, ApiError> {
    state
        .engine
        .version_diff(&document_id, query.from, query.to)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Unknown version".to_string()))
}

// ============================================================================
// COMMENT HANDLERS
// ============================================================================

async fn create_comment(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(payload): Json<CreateCommentRequest>,
) -> Json<CreateCommentResponse> {
    let comment_id = state.engine.add_comment(
        &document_id,
        &payload.user_id,
        payload.content,
        payload.parent_comment_id,
        payload.position,
    );
    Json(CreateCommentResponse { comment_id })
}

async fn document_comments(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Json<Vec<Comment>> {
    Json(state.engine.document_comments(&document_id))
}

async fn resolve_comment(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.resolve_comment(&comment_id) {
        Ok(StatusCode::OK)
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown comment".to_string()))
    }
}

/// A root comment followed by its reply tree, depth-first
async fn comment_thread(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<String>,
) -> Json<Vec<Comment>> {
    Json(state.engine.comment_thread(&comment_id))
}

// ============================================================================
// NOTIFICATION HANDLERS
// ============================================================================

async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendNotificationRequest>,
) -> Json<Notification> {
    Json(state.engine.send_notification(
        &payload.user_id,
        &payload.kind,
        payload.title,
        payload.message,
        payload.metadata,
    ))
}

async fn user_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<NotificationQuery>,
) -> Json<Vec<Notification>> {
    Json(
        state
            .engine
            .user_notifications(&user_id, query.unread_only, query.limit),
    )
}

async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<String>,
    Json(payload): Json<MarkReadRequest>,
) -> Result<StatusCode, ApiError> {
    if state
        .engine
        .mark_notification_read(&payload.user_id, &notification_id)
    {
        Ok(StatusCode::OK)
    } else {
        Err((StatusCode::NOT_FOUND, "Unknown notification".to_string()))
    }
}

async fn mark_all_notifications_read(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<MarkAllReadResponse> {
    Json(MarkAllReadResponse {
        marked: state.engine.mark_all_notifications_read(&user_id),
    })
}

async fn notification_stats(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<NotificationStats> {
    Json(state.engine.notification_stats(&user_id))
}

// ============================================================================
// CHANGE TRACKING HANDLERS
// ============================================================================

async fn track_change(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(payload): Json<TrackChangeRequest>,
) -> Json<TrackChangeResponse> {
    let change_id = state.engine.track_document_change(
        &document_id,
        &payload.user_id,
        &payload.change_type,
        payload.description,
        payload.before_state,
        payload.after_state,
    );
    Json(TrackChangeResponse { change_id })
}

async fn change_history(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<ChangeRecord>> {
    Json(state.engine.document_change_history(&document_id, query.limit))
}

async fn change_diff(
    State(state): State<Arc<AppState>>,
    Path(change_id): Path<String>,
) -> Result<Json<ChangeDiff>, ApiError> {
    state
        .engine
        .change_diff(&change_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Unknown change".to_string()))
}

async fn user_change_summary(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Json<UserChangeSummary> {
    Json(state.engine.user_change_summary(&user_id, query.days))
}

// ============================================================================
// INTROSPECTION HANDLERS
// ============================================================================

async fn document_stats(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Json<CollaborationStats> {
    Json(state.engine.collaboration_stats(&document_id))
}

async fn document_overview(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Json<CollaborationOverview> {
    Json(state.engine.collaboration_overview(&document_id))
}

async fn engine_stats(State(state): State<Arc<AppState>>) -> Json<RealtimeStats> {
    Json(state.engine.realtime_stats())
}

#[derive(Debug, Serialize)]
struct ConnectedClient {
    user: UserRef,
    connected_at: chrono::DateTime<chrono::Utc>,
}

async fn connected_clients(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectedClient>> {
    let clients = state
        .engine
        .connected_clients()
        .into_iter()
        .map(|(user, connected_at)| ConnectedClient { user, connected_at })
        .collect();
    Json(clients)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: String,
    #[serde(default)]
    username: Option<String>,
}

/// Inbound client messages over the live connection
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientEvent {
    Edit {
        kind: EditKind,
        position: Position,
        content: String,
        #[serde(default)]
        previous_version: Option<u64>,
    },
    Cursor {
        position: Position,
    },
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for session: {}", session_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, session_id, query, state))
}

/// Handle a live client connection: register for fan-out, forward
/// events out as JSON, accept edit and cursor messages in.
async fn handle_websocket(socket: WebSocket, session_id: String, query: WsQuery, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user_id = query.user_id;
    let username = query.username.unwrap_or_else(|| user_id.clone());
    let user = UserRef::new(user_id.clone(), username);

    let (mut rx, color) = state.engine.register_client(user);
    info!("Live client connected: user={}, session={}", user_id, session_id);

    let connected = serde_json::json!({
        "event": "connected",
        "session_id": session_id,
        "user_id": user_id,
        "color": color,
    });
    if ws_sender
        .send(Message::Text(connected.to_string()))
        .await
        .is_err()
    {
        state.engine.unregister_client(&user_id);
        return;
    }

    // Task to forward engine events to the WebSocket
    let user_id_send = user_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode event: {}", e);
                }
            }
        }
        debug!("Send task ended for user {}", user_id_send);
    });

    // Task to handle incoming WebSocket messages
    let user_id_recv = user_id.clone();
    let session_id_recv = session_id.clone();
    let state_recv = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(ClientEvent::Edit {
                        kind,
                        position,
                        content,
                        previous_version,
                    }) => {
                        if state_recv
                            .engine
                            .apply_collaborative_edit(
                                &session_id_recv,
                                &user_id_recv,
                                kind,
                                position,
                                content,
                                previous_version,
                            )
                            .is_none()
                        {
                            warn!(
                                "Edit from {} rejected for session {}",
                                user_id_recv, session_id_recv
                            );
                        }
                    }
                    Ok(ClientEvent::Cursor { position }) => {
                        state_recv
                            .engine
                            .submit_cursor(&session_id_recv, &user_id_recv, position);
                    }
                    Err(e) => {
                        warn!("Failed to decode client message: {}", e);
                    }
                },
                Message::Ping(_) => {
                    // Pong is handled automatically
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", user_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for user {}", user_id_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.engine.unregister_client(&user_id);
    info!("Live client {} disconnected from session {}", user_id, session_id);
}

// ============================================================================
// MAIN
// ============================================================================

fn env_duration_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn engine_config_from_env() -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(timeout) = env_duration_secs("SESSION_TIMEOUT_SECS") {
        config.session_timeout = timeout;
    }
    if let Some(interval) = env_duration_secs("CLEANUP_INTERVAL_SECS") {
        config.cleanup_interval = interval;
    }
    if let Some(window) = std::env::var("COALESCE_WINDOW_MS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.coalesce_window = Duration::from_millis(window);
    }
    if let Some(max) = std::env::var("MAX_PARTICIPANTS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.default_max_participants = max;
    }
    config
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_engine=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Create and start the engine
    let engine = Arc::new(CollaborationEngine::new(engine_config_from_env()));
    engine.start();

    let state = Arc::new(AppState {
        engine,
        started_at: std::time::Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Sessions
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id", delete(end_session))
        .route("/api/sessions/:session_id/join", post(join_session))
        .route("/api/sessions/:session_id/leave", post(leave_session))
        .route(
            "/api/sessions/:session_id/participants",
            get(session_participants),
        )
        .route("/api/sessions/:session_id/activity", get(session_activity))
        .route("/api/sessions/:session_id/edits", post(submit_edit))
        // Annotations
        .route(
            "/api/documents/:document_id/annotations",
            get(document_annotations).post(create_annotation),
        )
        .route("/api/annotations/:annotation_id", patch(update_annotation))
        .route(
            "/api/annotations/:annotation_id/resolve",
            post(resolve_annotation),
        )
        // Versions
        .route(
            "/api/documents/:document_id/versions",
            get(document_versions).post(create_version),
        )
        .route("/api/documents/:document_id/versions/diff", get(version_diff))
        // Comments
        .route(
            "/api/documents/:document_id/comments",
            get(document_comments).post(create_comment),
        )
        .route("/api/comments/:comment_id/resolve", post(resolve_comment))
        .route("/api/comments/:comment_id/thread", get(comment_thread))
        // Notifications
        .route("/api/notifications", post(send_notification))
        .route(
            "/api/notifications/:notification_id/read",
            post(mark_notification_read),
        )
        .route("/api/users/:user_id/notifications", get(user_notifications))
        .route(
            "/api/users/:user_id/notifications/read-all",
            post(mark_all_notifications_read),
        )
        .route(
            "/api/users/:user_id/notifications/stats",
            get(notification_stats),
        )
        // Change tracking
        .route(
            "/api/documents/:document_id/changes",
            get(change_history).post(track_change),
        )
        .route("/api/changes/:change_id/diff", get(change_diff))
        .route("/api/users/:user_id/changes/summary", get(user_change_summary))
        // Introspection
        .route("/api/documents/:document_id/stats", get(document_stats))
        .route("/api/documents/:document_id/overview", get(document_overview))
        .route("/api/stats", get(engine_stats))
        .route("/api/clients", get(connected_clients))
        // WebSocket endpoint
        .route("/ws/:session_id", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Collab engine v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:session_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
