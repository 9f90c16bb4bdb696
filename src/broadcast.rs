// src/broadcast.rs

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use axum::extract::ws::Utf8Bytes;
use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::{
    error::{ErrorBody, ErrorKind},
    models::{Envelope, InboundEnvelope},
    session::{Delivery, Session},
    state::AppState,
};

/// Reasons an inbound frame is refused. Reported in-band, never fatal on
/// their own.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("content must not be empty")]
    EmptyContent,
    #[error("content exceeds {limit} bytes")]
    ContentTooLarge { limit: usize },
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("binary frames are not supported")]
    Binary,
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContentTooLarge { .. } | Self::FrameTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Malformed(_) | Self::EmptyContent | Self::Binary => ErrorKind::InvalidInput,
        }
    }
}

/// A frame that passed validation. Only these two fields survive from the
/// client; everything else is stamped by the server.
#[derive(Debug, PartialEq, Eq)]
pub struct Accepted {
    pub content: String,
    pub receiver: String,
}

/// Counts from one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub recipients: usize,
    pub queued: usize,
    pub dropped: usize,
    pub closed: usize,
}

pub fn parse_frame(text: &str, max_frame_bytes: usize, max_content_bytes: usize) -> Result<Accepted, WireError> {
    if text.len() > max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            limit: max_frame_bytes,
        });
    }
    let inbound: InboundEnvelope =
        serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))?;

    let content = inbound.content.trim();
    if content.is_empty() {
        return Err(WireError::EmptyContent);
    }
    if content.len() > max_content_bytes {
        return Err(WireError::ContentTooLarge {
            limit: max_content_bytes,
        });
    }
    Ok(Accepted {
        content: content.to_owned(),
        receiver: inbound.receiver.unwrap_or_default().trim().to_owned(),
    })
}

/// ISO-8601 UTC wall clock.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn encode(envelope: &Envelope) -> Option<Utf8Bytes> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            tracing::error!(event = "broadcast.encode", error = %e);
            None
        }
    }
}

pub fn error_frame(kind: ErrorKind, detail: impl Into<String>) -> Utf8Bytes {
    let body = ErrorBody {
        error: kind,
        detail: detail.into(),
    };
    serde_json::to_string(&body)
        .map(Utf8Bytes::from)
        .unwrap_or_else(|_| Utf8Bytes::from_static(r#"{"error":"Internal","detail":"internal error"}"#))
}

/// Who receives an envelope sent by `origin`.
///
/// Broadcasts go to every member, minus the originator unless `echo` is set.
/// Direct messages go to the sessions of `receiver` in the same room plus the
/// originating session.
pub fn recipients(members: Vec<Arc<Session>>, origin: &Session, receiver: &str, echo: bool) -> Vec<Arc<Session>> {
    members
        .into_iter()
        .filter(|member| {
            if receiver.is_empty() {
                echo || member.id != origin.id
            } else {
                member.id == origin.id || member.username == receiver
            }
        })
        .collect()
}

/// Stamps an accepted frame, records it in the room history and enqueues a
/// copy on every recipient's outbound queue.
pub async fn publish(state: &AppState, origin: &Session, accepted: Accepted) -> Option<FanoutReport> {
    let Accepted { content, receiver } = accepted;
    let (envelope, members) = state
        .rooms
        .append(&origin.room, || Envelope {
            content,
            sender: origin.username.clone(),
            receiver,
            room: origin.room.clone(),
            timestamp: timestamp_now(),
        })
        .await?;
    state.metrics.message_published();

    let frame = encode(&envelope)?;
    let targets = recipients(
        members,
        origin,
        &envelope.receiver,
        state.config.echo_own_broadcast,
    );
    let policy = state.config.slow_consumer_policy;

    let mut report = FanoutReport {
        recipients: targets.len(),
        ..FanoutReport::default()
    };
    // Each enqueue is isolated: one recipient's failure must not starve the rest.
    for target in targets {
        let delivery = catch_unwind(AssertUnwindSafe(|| target.deliver(frame.clone(), policy)));
        match delivery {
            Ok(Delivery::Queued) => report.queued += 1,
            Ok(Delivery::DroppedOldest) => {
                report.queued += 1;
                report.dropped += 1;
                state.metrics.message_dropped();
            }
            Ok(Delivery::SlowConsumer) => {
                report.dropped += 1;
                report.closed += 1;
                state.metrics.message_dropped();
                state.metrics.slow_consumer_closed();
                tracing::warn!(
                    event = "broadcast.slow_consumer",
                    room = %origin.room,
                    session_id = %target.id,
                    user = %target.username
                );
            }
            Ok(Delivery::Closed) => report.closed += 1,
            Err(_) => {
                report.closed += 1;
                tracing::error!(event = "broadcast.enqueue_panic", session_id = %target.id);
            }
        }
    }
    state.metrics.messages_delivered(report.queued as u64);

    tracing::debug!(
        event = "broadcast.publish",
        room = %origin.room,
        sender = %origin.username,
        direct = !envelope.receiver.is_empty(),
        recipients = report.recipients,
        dropped = report.dropped
    );
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, SlowConsumerPolicy},
        credentials::CredentialStore,
    };

    fn state(config: Config) -> AppState {
        AppState::new(config, CredentialStore::new(None).unwrap())
    }

    async fn joined(state: &AppState, user: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(user, "general", state.config.send_queue_capacity));
        state.rooms.join("general", &session).await;
        session.mark_joined();
        session
    }

    fn drain(session: &Session) -> Vec<Envelope> {
        std::iter::from_fn(|| session.pop())
            .map(|frame| serde_json::from_str(frame.as_str()).unwrap())
            .collect()
    }

    fn accepted(content: &str, receiver: &str) -> Accepted {
        Accepted {
            content: content.into(),
            receiver: receiver.into(),
        }
    }

    #[test]
    fn parse_frame_validates_content() {
        let ok = parse_frame(r#"{"content":"  hi  ","receiver":"bob"}"#, 2048, 1024).unwrap();
        assert_eq!(ok, accepted("hi", "bob"));

        assert!(matches!(parse_frame("not json", 2048, 1024), Err(WireError::Malformed(_))));
        assert!(matches!(parse_frame(r#"{"receiver":""}"#, 2048, 1024), Err(WireError::Malformed(_))));
        assert_eq!(
            parse_frame(r#"{"content":"   "}"#, 2048, 1024),
            Err(WireError::EmptyContent)
        );

        let big = format!(r#"{{"content":"{}"}}"#, "a".repeat(1025));
        assert_eq!(
            parse_frame(&big, 4096, 1024),
            Err(WireError::ContentTooLarge { limit: 1024 })
        );
        assert_eq!(
            parse_frame(&big, 100, 1024),
            Err(WireError::FrameTooLarge { limit: 100 })
        );
        assert_eq!(WireError::FrameTooLarge { limit: 1 }.kind(), ErrorKind::PayloadTooLarge);
    }

    #[test]
    fn error_frame_shape() {
        let frame = error_frame(ErrorKind::InvalidInput, "bad frame");
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(value, serde_json::json!({"error":"InvalidInput","detail":"bad frame"}));
    }

    #[tokio::test]
    async fn broadcast_is_stamped_and_skips_originator() {
        let state = state(Config::default());
        let alice = joined(&state, "alice").await;
        let bob = joined(&state, "bob").await;

        let report = publish(&state, &alice, accepted("hi", "")).await.unwrap();
        assert_eq!(report.recipients, 1);

        let received = drain(&bob);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, "alice");
        assert_eq!(received[0].room, "general");
        assert_eq!(received[0].receiver, "");
        assert!(received[0].timestamp.ends_with('Z'));
        assert!(drain(&alice).is_empty());
    }

    #[tokio::test]
    async fn echo_includes_originator() {
        let state = state(Config {
            echo_own_broadcast: true,
            ..Config::default()
        });
        let alice = joined(&state, "alice").await;
        publish(&state, &alice, accepted("hi", "")).await.unwrap();
        assert_eq!(drain(&alice).len(), 1);
    }

    #[tokio::test]
    async fn direct_message_reaches_receiver_and_originator_only() {
        let state = state(Config::default());
        let alice = joined(&state, "alice").await;
        let bob = joined(&state, "bob").await;
        let bob_again = joined(&state, "bob").await;
        let carol = joined(&state, "carol").await;

        publish(&state, &alice, accepted("psst", "bob")).await.unwrap();
        assert_eq!(drain(&alice).len(), 1);
        assert_eq!(drain(&bob)[0].receiver, "bob");
        assert_eq!(drain(&bob_again).len(), 1);
        assert!(drain(&carol).is_empty());
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let state = state(Config::default());
        let alice = joined(&state, "alice").await;
        let bob = joined(&state, "bob").await;
        for i in 0..20 {
            publish(&state, &alice, accepted(&i.to_string(), "")).await.unwrap();
        }
        let contents: Vec<String> = drain(&bob).into_iter().map(|e| e.content).collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);

        let history: Vec<String> = state
            .rooms
            .history("general")
            .await
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(history, expected);
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_under_close_policy() {
        let state = state(Config {
            send_queue_capacity: 4,
            slow_consumer_policy: SlowConsumerPolicy::Close,
            ..Config::default()
        });
        let alice = joined(&state, "alice").await;
        let bob = joined(&state, "bob").await;

        for i in 0..4 {
            let report = publish(&state, &alice, accepted(&i.to_string(), "")).await.unwrap();
            assert_eq!(report.closed, 0);
        }
        let report = publish(&state, &alice, accepted("overflow", "")).await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(
            bob.close_reason(),
            Some(crate::session::CloseReason::SlowConsumer)
        );
        assert_eq!(state.metrics.snapshot().slow_consumer_closes, 1);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_frames() {
        let state = state(Config {
            send_queue_capacity: 2,
            ..Config::default()
        });
        let alice = joined(&state, "alice").await;
        let bob = joined(&state, "bob").await;
        for i in 0..3 {
            publish(&state, &alice, accepted(&i.to_string(), "")).await.unwrap();
        }
        let contents: Vec<String> = drain(&bob).into_iter().map(|e| e.content).collect();
        assert_eq!(contents, ["1", "2"]);
        assert!(!bob.is_closing());
        assert_eq!(state.metrics.snapshot().messages_dropped, 1);
    }
}
