// src/routes.rs

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    config::Config,
    credentials::CredentialError,
    error::AppError,
    models::{Credentials, Envelope, RoomQuery, is_valid_room_name},
    state::{AppState, bearer_token},
    websocket::websocket_handler,
};

/// Request bodies are only ever credentials.
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Defines the application routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let handshake_timeout = state.config.handshake_timeout();

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/messages", get(messages))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(websocket_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            handshake_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_is_permissive() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

fn credentials_from(payload: Result<Json<Credentials>, JsonRejection>) -> Result<Credentials, AppError> {
    payload
        .map(|Json(credentials)| credentials)
        .map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::PayloadTooLarge(format!("request body exceeds {MAX_BODY_BYTES} bytes"))
            } else {
                AppError::InvalidInput(rejection.body_text())
            }
        })
}

/// `POST /register`
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let credentials = credentials_from(payload)?;
    match state
        .credentials
        .register(&credentials.username, &credentials.password)
        .await
    {
        Ok(()) => {
            state.metrics.registered();
            tracing::info!(event = "auth.register", outcome = "created", user = %credentials.username);
            Ok(StatusCode::CREATED)
        }
        Err(CredentialError::AlreadyExists(user)) => {
            tracing::info!(event = "auth.register", outcome = "existing_user");
            Err(AppError::AlreadyExists(format!("username '{user}' is taken")))
        }
        Err(CredentialError::InvalidInput(detail)) => Err(AppError::InvalidInput(detail.to_owned())),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

/// `POST /login`. Returns the bearer token as a plain string.
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<String, AppError> {
    let credentials = credentials_from(payload)?;
    if !state
        .credentials
        .verify(&credentials.username, &credentials.password)
        .await
    {
        state.metrics.auth_failed();
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(AppError::Unauthorized("invalid credentials"));
    }

    let token = state.tokens.issue(&credentials.username);
    tracing::info!(event = "auth.login", outcome = "success", user = %credentials.username);
    Ok(token)
}

/// `POST /logout`. Revokes the bearer token.
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    let token = bearer_token(&headers).ok_or(AppError::Unauthorized("missing bearer token"))?;
    if !state.tokens.revoke(token) {
        state.metrics.auth_failed();
        return Err(AppError::Unauthorized("invalid or expired token"));
    }
    tracing::info!(event = "auth.logout", outcome = "success");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /messages?room=<name>`. The room's recent history, oldest first.
async fn messages(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Envelope>>, AppError> {
    let room = query
        .room
        .filter(|room| !room.is_empty())
        .ok_or_else(|| AppError::InvalidInput(String::from("missing room parameter")))?;
    state.authenticate(&headers, query.token.as_deref())?;
    if !is_valid_room_name(&room) {
        return Err(AppError::NotFound(format!("no such room '{room}'")));
    }
    Ok(Json(state.rooms.history(&room).await))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "rooms": state.rooms.room_count().await,
        "sessions": state.metrics.active_sessions(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
