// src/websocket.rs

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::time::Instant;

use crate::{
    broadcast::{self, WireError},
    error::AppError,
    models::{RoomQuery, is_valid_room_name},
    session::{CloseReason, Session, SessionState},
    state::AppState,
    tokens::Identity,
};

/// Consecutive rejected frames tolerated before the session is closed.
pub const MAX_STRIKES: u32 = 3;

/// Extra time the handler grants the writer beyond the flush deadline to put
/// the close frame on the wire.
const CLOSE_FRAME_GRACE: Duration = Duration::from_millis(500);

/// `GET /ws?room=<name>`. Authenticates and validates before completing the
/// upgrade so refusals are plain HTTP responses.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    tracing::debug!(state = ?SessionState::Handshaking, room = ?query.room, "upgrade requested");

    let room = query
        .room
        .filter(|room| !room.is_empty())
        .ok_or_else(|| AppError::InvalidInput(String::from("missing room parameter")))?;
    let identity = state.authenticate(&headers, query.token.as_deref())?;
    if !is_valid_room_name(&room) {
        return Err(AppError::NotFound(format!("no such room '{room}'")));
    }
    if state.is_shutting_down() {
        return Err(AppError::Internal(String::from("server is shutting down")));
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    tracing::debug!(
        state = ?SessionState::Authenticated,
        user = %identity.username,
        room = %room,
        "upgrade accepted"
    );
    let max_transport = state.config.max_transport_bytes();
    Ok(ws
        .max_message_size(max_transport)
        .on_upgrade(move |socket| handle_socket(socket, state, identity, room)))
}

/// Manages the lifecycle of one session from join to close.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity, room: String) {
    let session = Arc::new(Session::new(
        identity.username.clone(),
        room.clone(),
        state.config.send_queue_capacity,
    ));
    let (mut sender, receiver) = socket.split();

    let history = state.rooms.join(&room, &session).await;
    state.metrics.session_opened();
    tracing::info!(
        event = "session.join",
        session_id = %session.id,
        user = %session.username,
        room = %room,
        history = history.len()
    );

    // History goes out before the write pump starts, so it always precedes
    // anything fanned out after the join.
    for envelope in &history {
        let Some(frame) = broadcast::encode(envelope) else {
            continue;
        };
        if sender.send(Message::Text(frame)).await.is_err() {
            session.close(CloseReason::Io);
            break;
        }
    }
    session.mark_joined();

    let flush_deadline = state.config.flush_deadline();
    let mut send_task = tokio::spawn(write_to_client(sender, session.clone(), flush_deadline));
    let mut receive_task = tokio::spawn(read_from_client(
        receiver,
        session.clone(),
        state.clone(),
        identity.expires_at,
    ));

    let writer_done = tokio::select! {
        _ = &mut receive_task => false,
        _ = &mut send_task => true,
    };
    session.close(CloseReason::ClientClosed);

    // Leave before the socket is released: no ghost memberships.
    state.rooms.leave(&room, session.id).await;

    if !writer_done
        && tokio::time::timeout(flush_deadline + CLOSE_FRAME_GRACE, &mut send_task)
            .await
            .is_err()
    {
        tracing::debug!(session_id = %session.id, "writer missed the close deadline");
        send_task.abort();
    }
    receive_task.abort();

    session.mark_closed();
    state.metrics.session_closed();
    let reason = session.close_reason().unwrap_or(CloseReason::Internal);
    tracing::info!(
        event = "session.close",
        session_id = %session.id,
        user = %session.username,
        room = %room,
        reason = reason.label()
    );
}

/// Drains the session's outbound queue onto the socket, then performs the
/// closing handshake.
async fn write_to_client(
    mut sender: SplitSink<WebSocket, Message>,
    session: Arc<Session>,
    flush_deadline: Duration,
) {
    loop {
        if session.is_closing() {
            break;
        }
        match session.pop() {
            Some(frame) => {
                if sender.send(Message::Text(frame)).await.is_err() {
                    session.close(CloseReason::Io);
                    return;
                }
            }
            None => session.ready().await,
        }
    }

    let reason = session.close_reason().unwrap_or(CloseReason::Internal);
    if reason == CloseReason::Io {
        return;
    }

    if reason.flushes() {
        let flush = async {
            while let Some(frame) = session.pop() {
                if sender.send(Message::Text(frame)).await.is_err() {
                    return false;
                }
            }
            true
        };
        if !matches!(tokio::time::timeout(flush_deadline, flush).await, Ok(true)) {
            tracing::debug!(session_id = %session.id, "outbound queue not fully flushed");
        }
    } else {
        let discarded = session.discard_backlog();
        tracing::debug!(session_id = %session.id, discarded, "backlog discarded");
    }

    let close = Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.label().into(),
    }));
    let _ = tokio::time::timeout(CLOSE_FRAME_GRACE, sender.send(close)).await;
}

/// Reads frames from the client and hands valid ones to the broadcast engine.
/// Sets the session's close reason when the pump stops.
async fn read_from_client(
    receiver: SplitStream<WebSocket>,
    session: Arc<Session>,
    state: AppState,
    expires_at: std::time::Instant,
) {
    let reason = read_loop(receiver, &session, &state, Instant::from_std(expires_at)).await;
    session.close(reason);
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    session: &Session,
    state: &AppState,
    expires_at: Instant,
) -> CloseReason {
    let idle_timeout = state.config.idle_timeout();
    let mut lifecycle = session.subscribe();
    let mut shutdown = state.shutdown_signal();
    let mut strikes = 0;

    loop {
        let next = tokio::select! {
            closing = lifecycle.wait_for(SessionState::is_closing) => {
                return closing
                    .ok()
                    .and_then(|current| current.reason())
                    .unwrap_or(CloseReason::Internal);
            }
            _ = shutdown.wait_for(|stop| *stop) => return CloseReason::Shutdown,
            () = tokio::time::sleep_until(expires_at) => return CloseReason::TokenExpired,
            next = tokio::time::timeout(idle_timeout, receiver.next()) => next,
        };

        let message = match next {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) if exceeds_transport_limit(&e) => {
                // The socket is still writable: answer in-band, then close.
                state.metrics.frame_rejected();
                tracing::debug!(event = "session.reject", session_id = %session.id, error = %e);
                let limit = state.config.max_frame_bytes();
                let err = WireError::FrameTooLarge { limit };
                session.deliver(
                    broadcast::error_frame(err.kind(), err.to_string()),
                    state.config.slow_consumer_policy,
                );
                return CloseReason::MessageTooLarge;
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session.id, error = %e, "socket read failed");
                return CloseReason::Io;
            }
            Ok(Some(Ok(message))) => message,
        };

        let outcome = match message {
            Message::Text(text) => broadcast::parse_frame(
                text.as_str(),
                state.config.max_frame_bytes(),
                state.config.max_message_bytes,
            ),
            Message::Binary(_) => Err(WireError::Binary),
            Message::Close(_) => return CloseReason::ClientClosed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match outcome {
            Ok(accepted) => {
                strikes = 0;
                broadcast::publish(state, session, accepted).await;
            }
            Err(err) => {
                strikes += 1;
                state.metrics.frame_rejected();
                tracing::debug!(
                    event = "session.reject",
                    session_id = %session.id,
                    strikes,
                    error = %err
                );
                session.deliver(
                    broadcast::error_frame(err.kind(), err.to_string()),
                    state.config.slow_consumer_policy,
                );
                if strikes >= MAX_STRIKES {
                    return CloseReason::TooManyErrors;
                }
            }
        }
    }
}

/// Whether a read failed because the message outgrew the transport limit.
/// axum only exposes the transport error boxed, so the chain is matched on
/// tungstenite's capacity error text.
fn exceeds_transport_limit(error: &axum::Error) -> bool {
    let mut source = Some(error as &(dyn std::error::Error + 'static));
    while let Some(err) = source {
        let text = err.to_string();
        if text.contains("Space limit exceeded") || text.contains("Message too long") {
            return true;
        }
        source = err.source();
    }
    false
}
