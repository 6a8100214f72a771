//! Token store: persists a single hex-SHA-256 digest of the shared bearer
//! secret inside the JSON config file's `auth.tokenHash` field.
//!
//! The hashing itself is the same `Sha256` + hex-digest idiom this
//! codebase already used for its (multi-token, expiring) token manager;
//! here it backs a single shared secret instead, matching the simpler
//! `status/init/verify/rotate/clear` contract this crate exposes.

use crate::config::{AuthSection, Config};
use crate::error::AppError;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const MIN_TOKEN_LEN: usize = 8;

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two hex digests. Unequal lengths are
/// treated as an immediate mismatch — both are fixed-length SHA-256 hex
/// strings in practice, so this never leaks more than "same digest
/// algorithm or not".
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[derive(Clone)]
pub struct TokenStore {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    legacy_token_path: PathBuf,
}

impl TokenStore {
    pub fn new(config: Arc<RwLock<Config>>, config_path: PathBuf, legacy_token_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
            legacy_token_path,
        }
    }

    /// One-shot migration of a legacy bare-digest `.clicast-token` file
    /// into the JSON config, performed only when the JSON config has no
    /// `auth` block yet. Call once at startup, before serving requests.
    pub async fn migrate_legacy(&self) {
        let mut config = self.config.write().await;
        if config.auth.token_hash.is_some() {
            return;
        }
        match std::fs::read_to_string(&self.legacy_token_path) {
            Ok(raw) => {
                let digest = raw.trim().to_string();
                if digest.is_empty() {
                    return;
                }
                config.auth.token_hash = Some(digest);
                if let Err(e) = config.save(&self.config_path) {
                    warn!(error = %e, "failed to persist migrated legacy token");
                    return;
                }
                info!("migrated legacy .clicast-token into JSON config");
            }
            Err(_) => {
                // No legacy file, or unreadable — nothing to migrate.
            }
        }
    }

    pub async fn status(&self) -> bool {
        self.config.read().await.auth.token_hash.is_some()
    }

    pub async fn init(&self, plain: &str) -> Result<(), AppError> {
        if plain.len() < MIN_TOKEN_LEN {
            return Err(AppError::WeakToken);
        }
        let mut config = self.config.write().await;
        if config.auth.token_hash.is_some() {
            return Err(AppError::AlreadyExists);
        }
        config.auth = AuthSection {
            token_hash: Some(hash_token(plain)),
        };
        config
            .save(&self.config_path)
            .map_err(|e| AppError::Fatal(e.to_string()))
    }

    /// Verifies `plain` against the stored hash. Used identically for both
    /// the `Authorization: Bearer` path and the WebSocket `?token=` path.
    pub async fn verify(&self, plain: &str) -> bool {
        let config = self.config.read().await;
        match &config.auth.token_hash {
            Some(hash) => constant_time_eq(&hash_token(plain), hash),
            None => false,
        }
    }

    pub async fn rotate(&self, current: &str, next: &str) -> Result<(), AppError> {
        if next.len() < MIN_TOKEN_LEN {
            return Err(AppError::WeakToken);
        }
        let mut config = self.config.write().await;
        let matches = config
            .auth
            .token_hash
            .as_ref()
            .is_some_and(|hash| constant_time_eq(&hash_token(current), hash));
        if !matches {
            return Err(AppError::Unauthorized);
        }
        config.auth = AuthSection {
            token_hash: Some(hash_token(next)),
        };
        config
            .save(&self.config_path)
            .map_err(|e| AppError::Fatal(e.to_string()))
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        let mut config = self.config.write().await;
        config.auth = AuthSection::default();
        config
            .save(&self.config_path)
            .map_err(|e| AppError::Fatal(e.to_string()))
    }
}
