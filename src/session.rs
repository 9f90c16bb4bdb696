// src/session.rs

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use axum::extract::ws::{Utf8Bytes, close_code};
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::config::SlowConsumerPolicy;

/// Drops tolerated under `drop_oldest` before the writer drains the queue
/// again; past this the session is closed as a slow consumer.
pub const MAX_DROPS_BEFORE_CLOSE: u32 = 32;

/// Why a session left the `Joined` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Io,
    IdleTimeout,
    TokenExpired,
    TooManyErrors,
    MessageTooLarge,
    SlowConsumer,
    Shutdown,
    Internal,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::Shutdown | Self::Io => close_code::NORMAL,
            Self::IdleTimeout
            | Self::TokenExpired
            | Self::TooManyErrors
            | Self::MessageTooLarge
            | Self::SlowConsumer => close_code::POLICY,
            Self::Internal => close_code::ERROR,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Io => "io_error",
            Self::IdleTimeout => "idle_timeout",
            Self::TokenExpired => "token_expired",
            Self::TooManyErrors => "too_many_errors",
            Self::MessageTooLarge => "message_too_large",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal_error",
        }
    }

    /// A slow consumer's backlog is discarded rather than flushed.
    pub fn flushes(self) -> bool {
        !matches!(self, Self::SlowConsumer | Self::Io)
    }
}

/// Lifecycle of a session. `Handshaking` and `Authenticated` cover the HTTP
/// upgrade; a `Session` value is created once the upgrade is authorised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Authenticated,
    Joined,
    Closing(CloseReason),
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Closing(_) | Self::Closed(_))
    }

    pub fn reason(&self) -> Option<CloseReason> {
        match self {
            Self::Closing(reason) | Self::Closed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Result of offering a frame to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// The session is closing; the frame was discarded.
    Closed,
    /// The queue was full and the session is now closing.
    SlowConsumer,
}

#[derive(Default)]
struct Outbox {
    frames: VecDeque<Utf8Bytes>,
    drops_since_drain: u32,
}

/// One authenticated socket bound to one room for its whole life.
///
/// The owning handler task drives the socket; fan-out paths only touch the
/// outbound queue and the close state.
pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub room: String,
    capacity: usize,
    outbox: Mutex<Outbox>,
    ready: Notify,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(username: impl Into<String>, room: impl Into<String>, capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Authenticated);
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            room: room.into(),
            capacity,
            outbox: Mutex::new(Outbox::default()),
            ready: Notify::new(),
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.state.borrow().is_closing()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.borrow().reason()
    }

    pub fn mark_joined(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Authenticated {
                *state = SessionState::Joined;
                true
            } else {
                false
            }
        });
    }

    /// Moves the session to `Closing`. The first reason wins; returns whether
    /// this call performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = SessionState::Closing(reason);
                true
            }
        });
        if changed {
            tracing::debug!(session_id = %self.id, reason = reason.label(), "session closing");
            self.ready.notify_one();
        }
        changed
    }

    pub fn mark_closed(&self) {
        self.state.send_if_modified(|state| {
            let next = match *state {
                SessionState::Closed(_) => return false,
                SessionState::Closing(reason) => SessionState::Closed(reason),
                _ => SessionState::Closed(CloseReason::Internal),
            };
            *state = next;
            true
        });
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn deliver(&self, frame: Utf8Bytes, policy: SlowConsumerPolicy) -> Delivery {
        if self.is_closing() {
            return Delivery::Closed;
        }

        let delivery = {
            let mut outbox = self.lock_outbox();
            if outbox.frames.len() < self.capacity {
                outbox.frames.push_back(frame);
                Delivery::Queued
            } else {
                match policy {
                    SlowConsumerPolicy::Close => Delivery::SlowConsumer,
                    SlowConsumerPolicy::DropOldest => {
                        outbox.frames.pop_front();
                        outbox.frames.push_back(frame);
                        outbox.drops_since_drain += 1;
                        if outbox.drops_since_drain >= MAX_DROPS_BEFORE_CLOSE {
                            Delivery::SlowConsumer
                        } else {
                            Delivery::DroppedOldest
                        }
                    }
                }
            }
        };

        match delivery {
            Delivery::SlowConsumer => {
                self.close(CloseReason::SlowConsumer);
            }
            Delivery::Queued | Delivery::DroppedOldest => self.ready.notify_one(),
            Delivery::Closed => {}
        }
        delivery
    }

    /// Takes the next frame for the writer.
    pub fn pop(&self) -> Option<Utf8Bytes> {
        let mut outbox = self.lock_outbox();
        let frame = outbox.frames.pop_front();
        if outbox.frames.is_empty() {
            outbox.drops_since_drain = 0;
        }
        frame
    }

    pub fn discard_backlog(&self) -> usize {
        let mut outbox = self.lock_outbox();
        let discarded = outbox.frames.len();
        outbox.frames.clear();
        discarded
    }

    pub fn queued(&self) -> usize {
        self.lock_outbox().frames.len()
    }

    /// Resolves once a frame was queued or the session started closing.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame(text: &str) -> Utf8Bytes {
        Utf8Bytes::from(text.to_owned())
    }

    #[test]
    fn frames_leave_in_enqueue_order() {
        let session = Session::new("alice", "general", 4);
        for text in ["a", "b", "c"] {
            assert_eq!(
                session.deliver(frame(text), SlowConsumerPolicy::DropOldest),
                Delivery::Queued
            );
        }
        let drained: Vec<_> = std::iter::from_fn(|| session.pop()).collect();
        assert_eq!(drained, vec![frame("a"), frame("b"), frame("c")]);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let session = Session::new("bob", "general", 2);
        session.deliver(frame("1"), SlowConsumerPolicy::DropOldest);
        session.deliver(frame("2"), SlowConsumerPolicy::DropOldest);
        assert_eq!(
            session.deliver(frame("3"), SlowConsumerPolicy::DropOldest),
            Delivery::DroppedOldest
        );
        assert_eq!(session.queued(), 2);
        assert_eq!(session.pop(), Some(frame("2")));
        assert_eq!(session.pop(), Some(frame("3")));
        assert!(!session.is_closing());
    }

    #[test]
    fn repeated_drops_promote_to_close() {
        let session = Session::new("bob", "general", 1);
        session.deliver(frame("first"), SlowConsumerPolicy::DropOldest);
        for _ in 1..MAX_DROPS_BEFORE_CLOSE {
            assert_eq!(
                session.deliver(frame("x"), SlowConsumerPolicy::DropOldest),
                Delivery::DroppedOldest
            );
        }
        assert_eq!(
            session.deliver(frame("x"), SlowConsumerPolicy::DropOldest),
            Delivery::SlowConsumer
        );
        assert_eq!(session.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[test]
    fn draining_resets_drop_count() {
        let session = Session::new("bob", "general", 1);
        session.deliver(frame("first"), SlowConsumerPolicy::DropOldest);
        for _ in 1..MAX_DROPS_BEFORE_CLOSE {
            session.deliver(frame("x"), SlowConsumerPolicy::DropOldest);
        }
        assert!(session.pop().is_some());
        session.deliver(frame("y"), SlowConsumerPolicy::DropOldest);
        assert_eq!(
            session.deliver(frame("z"), SlowConsumerPolicy::DropOldest),
            Delivery::DroppedOldest
        );
        assert!(!session.is_closing());
    }

    #[test]
    fn close_policy_closes_on_first_overflow() {
        let session = Session::new("bob", "general", 2);
        assert_eq!(session.deliver(frame("1"), SlowConsumerPolicy::Close), Delivery::Queued);
        assert_eq!(session.deliver(frame("2"), SlowConsumerPolicy::Close), Delivery::Queued);
        assert_eq!(
            session.deliver(frame("3"), SlowConsumerPolicy::Close),
            Delivery::SlowConsumer
        );
        assert_eq!(session.state(), SessionState::Closing(CloseReason::SlowConsumer));
        assert_eq!(session.deliver(frame("4"), SlowConsumerPolicy::Close), Delivery::Closed);
        assert_eq!(CloseReason::SlowConsumer.code(), 1008);
    }

    #[test]
    fn first_close_reason_wins() {
        let session = Session::new("alice", "general", 1);
        session.mark_joined();
        assert_eq!(session.state(), SessionState::Joined);
        assert!(session.close(CloseReason::IdleTimeout));
        assert!(!session.close(CloseReason::Io));
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed(CloseReason::IdleTimeout));
        session.mark_joined();
        assert_eq!(session.state(), SessionState::Closed(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_writer() {
        let session = std::sync::Arc::new(Session::new("alice", "general", 1));
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.ready().await })
        };
        session.close(CloseReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
