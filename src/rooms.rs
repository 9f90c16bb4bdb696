// src/rooms.rs

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{models::Envelope, session::Session};

/// A chat room: the sessions currently attached plus a bounded ring of the
/// most recent envelopes, oldest first.
#[derive(Default)]
struct Room {
    members: HashMap<Uuid, Weak<Session>>,
    history: VecDeque<Envelope>,
    empty_since: Option<Instant>,
}

impl Room {
    fn live_members(&mut self) -> Vec<Arc<Session>> {
        let mut live = Vec::with_capacity(self.members.len());
        self.members.retain(|_, weak| match weak.upgrade() {
            Some(session) => {
                live.push(session);
                true
            }
            None => false,
        });
        live
    }
}

/// All rooms. The outer lock only guards lookup/insert/delete of entries;
/// membership and history sit behind a lock per room.
///
/// Lock order is always registry map, then room.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Mutex<Room>>>>,
    history_capacity: usize,
    grace: Duration,
}

impl RoomRegistry {
    pub fn new(history_capacity: usize, grace: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            history_capacity,
            grace,
        }
    }

    async fn get(&self, name: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.lock().await.get(name).cloned()
    }

    /// Adds the session to the room, creating the room if needed, and returns
    /// the history the session should be replayed.
    pub async fn join(&self, name: &str, session: &Arc<Session>) -> Vec<Envelope> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(name.to_owned()).or_insert_with(|| {
            tracing::info!(event = "room.create", room = %name);
            Arc::default()
        });
        // Held with the map lock so a concurrent sweep cannot retire the room.
        let mut room = room.lock().await;
        room.members.insert(session.id, Arc::downgrade(session));
        room.empty_since = None;
        room.history.iter().cloned().collect()
    }

    /// Removes the session. Returns whether it was a member.
    pub async fn leave(&self, name: &str, session_id: Uuid) -> bool {
        let Some(room) = self.get(name).await else {
            return false;
        };
        let mut room = room.lock().await;
        let removed = room.members.remove(&session_id).is_some();
        room.live_members();
        if room.members.is_empty() && room.empty_since.is_none() {
            tracing::debug!(event = "room.empty", room = %name);
            room.empty_since = Some(Instant::now());
        }
        removed
    }

    /// Snapshot of the live sessions in the room, for fan-out.
    pub async fn members(&self, name: &str) -> Vec<Arc<Session>> {
        match self.get(name).await {
            Some(room) => room.lock().await.live_members(),
            None => Vec::new(),
        }
    }

    pub async fn member_count(&self, name: &str) -> usize {
        self.members(name).await.len()
    }

    pub async fn history(&self, name: &str) -> Vec<Envelope> {
        match self.get(name).await {
            Some(room) => room.lock().await.history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Builds an envelope under the room lock, appends it to the history ring
    /// and returns it with a membership snapshot. Stamping under the lock
    /// keeps history order equal to stamp order.
    pub async fn append(
        &self,
        name: &str,
        build: impl FnOnce() -> Envelope,
    ) -> Option<(Envelope, Vec<Arc<Session>>)> {
        let room = self.get(name).await?;
        let mut room = room.lock().await;
        let envelope = build();
        room.history.push_back(envelope.clone());
        while room.history.len() > self.history_capacity {
            room.history.pop_front();
        }
        let members = room.live_members();
        Some((envelope, members))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Removes rooms that have had no members for at least the grace period.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut rooms = self.rooms.lock().await;
        let mut expired = Vec::new();
        for (name, room) in rooms.iter() {
            let mut room = room.lock().await;
            room.live_members();
            let idle_long_enough = room
                .empty_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.grace);
            if room.members.is_empty() && idle_long_enough {
                expired.push(name.clone());
            }
        }
        for name in &expired {
            rooms.remove(name);
            tracing::info!(event = "room.remove", room = %name);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(content: &str) -> Envelope {
        Envelope {
            content: content.into(),
            sender: "alice".into(),
            receiver: String::new(),
            room: "general".into(),
            timestamp: "2025-01-01T12:00:00Z".into(),
        }
    }

    fn session(user: &str) -> Arc<Session> {
        Arc::new(Session::new(user, "general", 8))
    }

    #[tokio::test]
    async fn join_creates_room_and_returns_history() {
        let registry = RoomRegistry::new(10, Duration::from_secs(60));
        let alice = session("alice");
        assert!(registry.join("general", &alice).await.is_empty());
        registry.append("general", || envelope("one")).await.unwrap();
        registry.append("general", || envelope("two")).await.unwrap();

        let carol = session("carol");
        let history = registry.join("general", &carol).await;
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["one", "two"]);
        assert_eq!(registry.member_count("general").await, 2);
    }

    #[tokio::test]
    async fn history_is_bounded_and_evicts_oldest() {
        let registry = RoomRegistry::new(3, Duration::from_secs(60));
        let alice = session("alice");
        registry.join("general", &alice).await;
        for i in 0..10 {
            registry
                .append("general", || envelope(&i.to_string()))
                .await
                .unwrap();
            assert!(registry.history("general").await.len() <= 3);
        }
        let contents: Vec<_> = registry
            .history("general")
            .await
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, ["7", "8", "9"]);
    }

    #[tokio::test]
    async fn append_to_unknown_room_is_none() {
        let registry = RoomRegistry::new(3, Duration::from_secs(60));
        assert!(registry.append("nowhere", || envelope("x")).await.is_none());
    }

    #[tokio::test]
    async fn leave_removes_membership() {
        let registry = RoomRegistry::new(3, Duration::from_secs(60));
        let alice = session("alice");
        registry.join("general", &alice).await;
        assert!(registry.leave("general", alice.id).await);
        assert!(!registry.leave("general", alice.id).await);
        assert_eq!(registry.member_count("general").await, 0);
    }

    #[tokio::test]
    async fn dropped_sessions_are_not_fanned_out_to() {
        let registry = RoomRegistry::new(3, Duration::from_secs(60));
        let alice = session("alice");
        let bob = session("bob");
        registry.join("general", &alice).await;
        registry.join("general", &bob).await;
        drop(bob);
        let (_, members) = registry.append("general", || envelope("x")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");
    }

    #[tokio::test]
    async fn empty_room_survives_grace_period_then_is_swept() {
        let grace = Duration::from_secs(60);
        let registry = RoomRegistry::new(3, grace);
        let alice = session("alice");
        registry.join("general", &alice).await;
        registry.append("general", || envelope("kept")).await.unwrap();
        registry.leave("general", alice.id).await;

        assert!(registry.sweep(Instant::now()).await.is_empty());
        let carol = session("carol");
        assert_eq!(registry.join("general", &carol).await.len(), 1);
        registry.leave("general", carol.id).await;

        let later = Instant::now() + grace + Duration::from_secs(1);
        assert_eq!(registry.sweep(later).await, vec![String::from("general")]);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn occupied_rooms_are_never_swept() {
        let registry = RoomRegistry::new(3, Duration::ZERO);
        let alice = session("alice");
        registry.join("general", &alice).await;
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(registry.sweep(later).await.is_empty());
    }
}
