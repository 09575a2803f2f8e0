//! Server long-term identity and pairing-token lifecycle.
//!
//! `server.json` — `{privateKey, publicKey, pairingToken|null}`. The private
//! key never leaves process memory except to this file, written with owner-only
//! permissions, mirroring the restrictive-perms convention the teacher's
//! `device.rs`/`config.rs` apply to every secret-bearing file.

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{atomic_write, config_dir};
use crate::crypto::{self, KeyPairB64};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "pairingToken")]
    pairing_token: Option<String>,
}

/// The server's long-term ECDH identity plus the current (if any) single-use
/// pairing token.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub key_pair: KeyPairB64,
    pub pairing_token: Option<String>,
}

impl ServerIdentity {
    fn path() -> Result<std::path::PathBuf> {
        Ok(config_dir()?.join("server.json"))
    }

    /// Load the identity from disk, generating and persisting a fresh key
    /// pair plus a newly minted pairing token if none exists yet (first
    /// boot).
    pub fn load_or_create() -> Result<Self> {
        let path = Self::path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let stored: StoredIdentity =
                serde_json::from_str(&content).context("parsing server.json")?;
            return Ok(Self {
                key_pair: KeyPairB64 {
                    private_key: stored.private_key,
                    public_key: stored.public_key,
                },
                pairing_token: stored.pairing_token,
            });
        }

        let key_pair = crypto::generate_key_pair();
        let identity = Self {
            key_pair,
            pairing_token: Some(mint_token()),
        };
        identity.save()?;
        Ok(identity)
    }

    pub fn save(&self) -> Result<()> {
        let stored = StoredIdentity {
            private_key: self.key_pair.private_key.clone(),
            public_key: self.key_pair.public_key.clone(),
            pairing_token: self.pairing_token.clone(),
        };
        atomic_write(&Self::path()?, &serde_json::to_string_pretty(&stored)?)
    }

    /// Mint a fresh pairing token, replacing any existing one (operator
    /// command — e.g. re-opening pairing after the first device consumed the
    /// prior token).
    pub fn remint_token(&mut self) -> Result<&str> {
        self.pairing_token = Some(mint_token());
        self.save()?;
        Ok(self.pairing_token.as_deref().expect("just set"))
    }

    /// Clear the pairing token after a successful pair (single-pairing-at-a-time
    /// policy — see SPEC_FULL.md §9 open question (a)).
    pub fn clear_token(&mut self) -> Result<()> {
        self.pairing_token = None;
        self.save()
    }
}

/// A short, URL-safe, single-use secret for the pairing URL.
fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_mints_token_once() {
        let _lock = test_lock();
        clear_test_dir();

        let identity = ServerIdentity::load_or_create().unwrap();
        assert!(identity.pairing_token.is_some());

        let reloaded = ServerIdentity::load_or_create().unwrap();
        assert_eq!(reloaded.pairing_token, identity.pairing_token);
        assert_eq!(reloaded.key_pair.public_key, identity.key_pair.public_key);
    }

    #[test]
    fn clear_token_persists() {
        let _lock = test_lock();
        clear_test_dir();

        let mut identity = ServerIdentity::load_or_create().unwrap();
        identity.clear_token().unwrap();

        let reloaded = ServerIdentity::load_or_create().unwrap();
        assert!(reloaded.pairing_token.is_none());
    }

    fn clear_test_dir() {
        let _ = std::fs::remove_dir_all(crate::config::config_dir().unwrap());
    }

    // Unit tests in this module share one config directory; serialize them.
    fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
