// src/credentials.rs

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    ffi::OsString,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::is_valid_username;

pub const MAX_PASSWORD_BYTES: usize = 1024;
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("username '{0}' already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("credential snapshot {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("credential snapshot i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// On-disk form of the store.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    users: BTreeMap<String, String>,
}

/// Maps usernames to argon2id PHC strings. Optionally snapshotted to a JSON
/// file by a full atomic rewrite.
pub struct CredentialStore {
    users: RwLock<HashMap<String, String>>,
    dummy_hash: String,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl CredentialStore {
    /// An empty in-memory store.
    pub fn new(snapshot_path: Option<PathBuf>) -> Result<Self, CredentialError> {
        // Verified against on a miss so unknown users cost a full KDF run.
        let dummy_hash = hash_password("dummy password for unknown users")?;
        Ok(Self {
            users: RwLock::new(HashMap::new()),
            dummy_hash,
            snapshot_path,
            dirty: AtomicBool::new(false),
        })
    }

    /// Opens the store, reading the snapshot at `path` when it exists.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, CredentialError> {
        let store = Self::new(path.clone())?;
        let Some(path) = path else {
            return Ok(store);
        };

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(event = "credentials.open", path = %path.display(), outcome = "fresh");
                return Ok(store);
            }
            Err(source) => return Err(CredentialError::Io { path, source }),
        };

        let users = parse_snapshot(&path, &raw)?;
        tracing::info!(
            event = "credentials.open",
            path = %path.display(),
            users = users.len(),
            outcome = "loaded"
        );
        *store.users.write().await = users;
        Ok(store)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        if !is_valid_username(username) {
            return Err(CredentialError::InvalidInput(
                "username must be 1-64 printable ASCII bytes",
            ));
        }
        if password.is_empty() || password.len() > MAX_PASSWORD_BYTES {
            return Err(CredentialError::InvalidInput(
                "password must be 1-1024 bytes",
            ));
        }
        if self.users.read().await.contains_key(username) {
            return Err(CredentialError::AlreadyExists(username.to_owned()));
        }

        let password = password.to_owned();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| CredentialError::Hash(e.to_string()))??;

        // Re-checked under the write lock: a concurrent registration may have won.
        match self.users.write().await.entry(username.to_owned()) {
            Entry::Occupied(_) => Err(CredentialError::AlreadyExists(username.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(hash);
                self.dirty.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Checks a password. Runs the KDF whether or not the user exists.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let (stored, known) = match self.users.read().await.get(username) {
            Some(hash) => (hash.clone(), true),
            None => (self.dummy_hash.clone(), false),
        };

        let password = password.to_owned();
        let matched = tokio::task::spawn_blocking(move || verify_password(&stored, &password))
            .await
            .unwrap_or(false);
        matched && known
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    /// Writes the snapshot when the store changed since the last write.
    pub async fn persist_if_dirty(&self) -> Result<bool, CredentialError> {
        if self.snapshot_path.is_none() || !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Err(e) = self.persist().await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    /// Rewrites the whole snapshot: temp file first, then rename over the target.
    pub async fn persist(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            users: self
                .users
                .read()
                .await
                .iter()
                .map(|(user, hash)| (user.clone(), hash.clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&snapshot).map_err(|e| CredentialError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = temp_path(path);
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|source| CredentialError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| CredentialError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(event = "credentials.persist", path = %path.display(), users = snapshot.users.len());
        Ok(())
    }
}

fn parse_snapshot(path: &Path, raw: &[u8]) -> Result<HashMap<String, String>, CredentialError> {
    let corrupt = |reason: String| CredentialError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let snapshot: Snapshot = serde_json::from_slice(raw).map_err(|e| corrupt(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(corrupt(format!("unsupported version {}", snapshot.version)));
    }
    for (user, hash) in &snapshot.users {
        if !is_valid_username(user) {
            return Err(corrupt(format!("invalid username '{user}'")));
        }
        if PasswordHash::new(hash).is_err() {
            return Err(corrupt(format!("invalid password hash for '{user}'")));
        }
    }
    Ok(snapshot.users.into_iter().collect())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}
