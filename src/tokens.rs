// src/tokens.rs

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

use crate::config::MAX_TOKEN_TTL_SECONDS;

/// 256 bits of entropy per token.
const TOKEN_BYTES: usize = 32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("unknown token")]
    Unknown,
}

/// The authenticated identity a token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Instant,
}

/// Mints and resolves opaque bearer tokens. The table lives only in memory,
/// so a restart invalidates every token.
pub struct TokenIssuer {
    ttl: Duration,
    tokens: RwLock<HashMap<String, Identity>>,
}

impl TokenIssuer {
    /// Lifetimes beyond [`MAX_TOKEN_TTL_SECONDS`] are clamped.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(Duration::from_secs(MAX_TOKEN_TTL_SECONDS)),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn issue(&self, username: &str) -> String {
        let mut bytes = [0_u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let identity = Identity {
            username: username.to_owned(),
            issued_at: Utc::now(),
            expires_at: expiry_from(Instant::now(), self.ttl),
        };
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), identity);
        token
    }

    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        self.verify_at(token, Instant::now())
    }

    pub fn verify_at(&self, token: &str, now: Instant) -> Result<Identity, TokenError> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        let identity = tokens.get(token).ok_or(TokenError::Unknown)?;
        if now >= identity.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(identity.clone())
    }

    /// Explicit logout. Returns whether a live token was removed.
    pub fn revoke(&self, token: &str) -> bool {
        let removed = self
            .tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        removed.is_some_and(|identity| Instant::now() < identity.expires_at)
    }

    /// Drops expired entries; returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|_, identity| now < identity.expires_at);
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expiry_from(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_TOKEN_TTL_SECONDS)))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_resolves_to_subject() {
        let issuer = TokenIssuer::new(Duration::from_secs(60));
        let token = issuer.issue("alice");
        assert_eq!(issuer.verify(&token).unwrap().username, "alice");
        assert!(token.len() >= 43);
        assert_ne!(token, issuer.issue("alice"));
    }

    #[test]
    fn unknown_and_expired_tokens_are_distinguished() {
        let issuer = TokenIssuer::new(Duration::from_secs(1));
        assert_eq!(issuer.verify("nope"), Err(TokenError::Unknown));

        let token = issuer.issue("alice");
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(issuer.verify_at(&token, later), Err(TokenError::Expired));
    }

    #[test]
    fn oversized_ttl_does_not_overflow() {
        let issuer = TokenIssuer::new(Duration::MAX);
        let token = issuer.issue("alice");
        let identity = issuer.verify(&token).unwrap();
        assert!(identity.expires_at > Instant::now());
    }

    #[test]
    fn revoke_invalidates() {
        let issuer = TokenIssuer::new(Duration::from_secs(60));
        let token = issuer.issue("alice");
        assert!(issuer.revoke(&token));
        assert!(!issuer.revoke(&token));
        assert_eq!(issuer.verify(&token), Err(TokenError::Unknown));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let issuer = TokenIssuer::new(Duration::from_secs(10));
        issuer.issue("alice");
        issuer.issue("bob");
        assert_eq!(issuer.sweep(Instant::now()), 0);
        assert_eq!(issuer.sweep(Instant::now() + Duration::from_secs(11)), 2);
        assert!(issuer.is_empty());
    }
}
