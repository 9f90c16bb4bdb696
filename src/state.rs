// src/state.rs

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::{HeaderMap, header::AUTHORIZATION};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::Config,
    credentials::{CredentialError, CredentialStore},
    error::AppError,
    rooms::RoomRegistry,
    telemetry::Metrics,
    tokens::{Identity, TokenIssuer},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Handles to every component a request or session needs. Cloning is cheap;
/// each field is shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub tokens: Arc<TokenIssuer>,
    pub rooms: Arc<RoomRegistry>,
    pub metrics: Arc<Metrics>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: Config, credentials: CredentialStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tokens: Arc::new(TokenIssuer::new(config.token_ttl())),
            rooms: Arc::new(RoomRegistry::new(
                config.history_capacity,
                config.room_grace(),
            )),
            credentials: Arc::new(credentials),
            metrics: Arc::new(Metrics::default()),
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Builds the state, loading the credential snapshot when configured.
    pub async fn from_config(config: Config) -> Result<Self, CredentialError> {
        let credentials = CredentialStore::open(config.credential_store_path.clone()).await?;
        Ok(Self::new(config, credentials))
    }

    /// Resolves the caller's identity from `Authorization: Bearer <token>`,
    /// falling back to a `token` query parameter.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Identity, AppError> {
        let token = bearer_token(headers)
            .or(query_token)
            .filter(|token| !token.is_empty());
        let Some(token) = token else {
            self.metrics.auth_failed();
            tracing::warn!(event = "auth.token", outcome = "missing");
            return Err(AppError::Unauthorized("missing bearer token"));
        };
        self.tokens.verify(token).map_err(|e| {
            self.metrics.auth_failed();
            tracing::warn!(event = "auth.token", outcome = %e);
            AppError::Unauthorized("invalid or expired token")
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tells every session to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Waits until every session has closed, or the deadline passes.
    /// Returns the number of sessions still open.
    pub async fn drain(&self, deadline: Duration) -> u64 {
        let _ = tokio::time::timeout(deadline, async {
            while self.metrics.active_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        self.metrics.active_sessions()
    }

    /// Periodic upkeep: expired tokens, abandoned rooms, credential snapshot.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut shutdown = state.shutdown_signal();
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            let mut snapshot = tokio::time::interval(state.config.snapshot_interval());
            loop {
                tokio::select! {
                    // The watch guard must not live across the sweep's await.
                    () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = sweep.tick() => {
                        let now = Instant::now();
                        let tokens = state.tokens.sweep(now);
                        let rooms = state.rooms.sweep(now).await;
                        if tokens > 0 || !rooms.is_empty() {
                            tracing::debug!(event = "maintenance.sweep", tokens, rooms = rooms.len());
                        }
                    }
                    _ = snapshot.tick() => {
                        if let Err(e) = state.credentials.persist_if_dirty().await {
                            tracing::error!(event = "credentials.persist", error = %e);
                        }
                    }
                }
            }
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn state() -> AppState {
        AppState::new(Config::default(), CredentialStore::new(None).unwrap())
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn empty_bearer_header_falls_back_to_query() {
        let state = state();
        let token = state.tokens.issue("alice");
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        let identity = state.authenticate(&headers, Some(&token)).unwrap();
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_shutdown() {
        let state = state();
        let handle = state.spawn_maintenance();
        state.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("maintenance task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_tolerates_huge_deadlines() {
        let state = state();
        assert_eq!(state.drain(Duration::from_millis(u64::MAX)).await, 0);
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let state = state();
        let alice = state.tokens.issue("alice");
        let bob = state.tokens.issue("bob");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {alice}")).unwrap(),
        );
        let identity = state.authenticate(&headers, Some(&bob)).unwrap();
        assert_eq!(identity.username, "alice");

        let identity = state.authenticate(&HeaderMap::new(), Some(&bob)).unwrap();
        assert_eq!(identity.username, "bob");
    }

    #[test]
    fn missing_or_unknown_tokens_are_unauthorized() {
        let state = state();
        assert!(matches!(
            state.authenticate(&HeaderMap::new(), None),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            state.authenticate(&HeaderMap::new(), Some("forged")),
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(state.metrics.snapshot().auth_failures, 2);
    }

    #[tokio::test]
    async fn drain_returns_immediately_without_sessions() {
        let state = state();
        state.begin_shutdown();
        assert!(state.is_shutting_down());
        assert_eq!(state.drain(Duration::from_secs(5)).await, 0);
    }
}
