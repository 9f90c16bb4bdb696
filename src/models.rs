// src/models.rs

use serde::{Deserialize, Serialize};

pub const MAX_NAME_BYTES: usize = 64;

/// The message envelope as delivered to clients.
/// `sender`, `room` and `timestamp` are always stamped by the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub content: String,
    pub sender: String,
    pub receiver: String,
    pub room: String,
    pub timestamp: String,
}

/// A message sent from a client to the server.
/// Only `content` and `receiver` are honoured; anything else the client
/// supplies (`sender`, `room`, `timestamp`, ...) is ignored.
#[derive(Deserialize, Debug)]
pub struct InboundEnvelope {
    pub content: String,
    #[serde(default)]
    pub receiver: Option<String>,
}

/// Body of `POST /register` and `POST /login`.
#[derive(Deserialize, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Query string accepted by `/ws` and `/messages`.
#[derive(Deserialize, Debug, Default)]
pub struct RoomQuery {
    pub room: Option<String>,
    pub token: Option<String>,
}

/// Room names are 1-64 bytes of `[A-Za-z0-9_-]`.
pub fn is_valid_room_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_BYTES
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Usernames are 1-64 printable ASCII bytes, case-sensitive.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_BYTES && name.bytes().all(|b| b.is_ascii_graphic())
}
