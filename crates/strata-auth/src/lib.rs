//! Bearer-token management for the Strata control plane.
//!
//! Every non-health RPC carries `authorization: Bearer <token>`. Tokens are
//! opaque to callers; the store keeps only SHA-256 hashes of the secrets and
//! resolves a valid token to a [`Principal`].

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use strata_store::snapshot::JsonSnapshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// A token record. The secret itself is never stored, only its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub name: String,
    pub secret_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// The authenticated identity threaded through RPC handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub token_id: String,
    pub name: String,
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// In-memory token store backed by JSON snapshots.
pub struct TokenStore {
    tokens: HashMap<String, TokenRecord>,
    snapshot: Option<JsonSnapshot>,
}

impl TokenStore {
    pub fn new(state_path: &Path) -> Self {
        let snapshot = JsonSnapshot::new(state_path, "tokens");
        let tokens: HashMap<String, TokenRecord> = snapshot.load();
        debug!(count = tokens.len(), "loaded tokens from disk");
        Self {
            tokens,
            snapshot: Some(snapshot),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            tokens: HashMap::new(),
            snapshot: None,
        }
    }

    /// Mint a token for `name`. Returns (token_id, plaintext secret); the
    /// secret is shown exactly once and only its hash is kept.
    pub fn create(&mut self, name: &str) -> (String, String) {
        let token_id = format!("tk-{}", Uuid::new_v4().simple());
        let secret = format!("st_{}", Uuid::new_v4().simple());
        let record = TokenRecord {
            token_id: token_id.clone(),
            name: name.to_string(),
            secret_hash: hash_secret(&secret),
            active: true,
            created_at: Utc::now(),
            last_used: None,
        };
        self.tokens.insert(token_id.clone(), record);
        self.persist();
        (token_id, secret)
    }

    /// Resolve a bearer token to its principal. `None` for unknown,
    /// revoked, or empty tokens. Stamps `last_used`.
    pub fn validate(&mut self, secret: &str) -> Option<Principal> {
        if secret.is_empty() {
            return None;
        }
        let hash = hash_secret(secret);
        let record = self
            .tokens
            .values_mut()
            .find(|t| t.active && t.secret_hash == hash)?;
        record.last_used = Some(Utc::now());
        let principal = Principal {
            token_id: record.token_id.clone(),
            name: record.name.clone(),
        };
        self.persist();
        Some(principal)
    }

    pub fn revoke(&mut self, token_id: &str) -> Result<(), String> {
        let record = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| format!("token '{token_id}' not found"))?;
        record.active = false;
        self.persist();
        Ok(())
    }

    pub fn list(&self) -> Vec<&TokenRecord> {
        let mut records: Vec<_> = self.tokens.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    fn persist(&self) {
        if let Some(snap) = &self.snapshot {
            if let Err(e) = snap.save(&self.tokens) {
                warn!(error = %e, "failed to snapshot token store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_validate_roundtrip() {
        let mut store = TokenStore::in_memory();
        let (token_id, secret) = store.create("worker-fleet");

        let principal = store.validate(&secret).expect("valid token");
        assert_eq!(principal.token_id, token_id);
        assert_eq!(principal.name, "worker-fleet");

        let record = store.list()[0];
        assert!(record.last_used.is_some());
        assert_ne!(record.secret_hash, secret, "secret must not be stored raw");
    }

    #[test]
    fn unknown_and_empty_tokens_rejected() {
        let mut store = TokenStore::in_memory();
        store.create("worker-fleet");
        assert!(store.validate("st_nonsense").is_none());
        assert!(store.validate("").is_none());
    }

    #[test]
    fn revoked_token_rejected() {
        let mut store = TokenStore::in_memory();
        let (token_id, secret) = store.create("ci");
        assert!(store.validate(&secret).is_some());

        store.revoke(&token_id).expect("revoke");
        assert!(store.validate(&secret).is_none());

        assert!(store.revoke("tk-ghost").is_err());
    }

    #[test]
    fn tokens_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secret = {
            let mut store = TokenStore::new(dir.path());
            let (_, secret) = store.create("persisted");
            secret
        };
        let mut store = TokenStore::new(dir.path());
        let principal = store.validate(&secret).expect("valid after reload");
        assert_eq!(principal.name, "persisted");
    }
}
