//! On-disk config directory resolution and the PIN-hash config file.
//!
//! `config.json` holds exactly `{pinHash}` (see SPEC_FULL.md §6); everything
//! else that varies per run (projects base, bind address, public URL) is a
//! `ServerConfig` built from CLI flags and env overrides in `main.rs`, not
//! persisted here.

use anyhow::{Context, Result};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// Returns the configuration directory, creating it if necessary.
///
/// Directory selection priority:
/// 1. `#[cfg(test)]` (unit tests): `tmp/claude-remote-test`.
/// 2. `CLAUDE_REMOTE_CONFIG_DIR` env var: explicit override.
/// 3. `CLAUDE_REMOTE_ENV=test` (integration tests): same tmp directory.
/// 4. Default: platform config dir (e.g. `~/.config/claude-remote`).
pub fn config_dir() -> Result<PathBuf> {
    let dir = {
        #[cfg(test)]
        {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/claude-remote-test")
        }

        #[cfg(not(test))]
        {
            if let Ok(dir) = std::env::var("CLAUDE_REMOTE_CONFIG_DIR") {
                PathBuf::from(dir)
            } else if crate::env::is_test_mode() {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/claude-remote-test")
            } else {
                dirs::config_dir()
                    .context("could not determine platform config directory")?
                    .join(crate::env::APP_NAME)
            }
        }
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write `contents` to `path` atomically (write to a sibling temp file, then
/// rename) with owner-only permissions, following the same
/// write-temp-then-rename convention used for every store in this crate.
pub fn atomic_write(path: &std::path::Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path.display()))?;

    #[cfg(unix)]
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;

    fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// `config.json` — `{pinHash}`. The PIN is verified in constant time by
/// `PinHash::verify`; it is set on first successful auth flow or configured
/// out of band by the operator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PinHash {
    #[serde(rename = "pinHash")]
    pub pin_hash: Option<String>,
}

impl PinHash {
    fn path() -> Result<PathBuf> {
        Ok(config_dir()?.join("config.json"))
    }

    /// Load `config.json`, or an empty (no PIN set) value if absent.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self { pin_hash: None });
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        atomic_write(&path, &serde_json::to_string_pretty(self)?)
    }

    /// Hash and persist a new PIN using argon2id.
    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        use argon2::password_hash::{PasswordHasher, SaltString};
        use argon2::Argon2;

        let salt = SaltString::generate(&mut rand_core::OsRng);
        let hash = Argon2::default()
            .hash_password(pin.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("failed to hash pin: {e}"))?
            .to_string();
        self.pin_hash = Some(hash);
        self.save()
    }

    /// Verify `pin` in constant time against the stored hash. Returns
    /// `false` (never errors) if no PIN has been configured yet.
    pub fn verify(&self, pin: &str) -> bool {
        use argon2::password_hash::{PasswordHash, PasswordVerifier};
        use argon2::Argon2;

        let Some(stored) = &self.pin_hash else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default().verify_password(pin.as_bytes(), &parsed).is_ok()
    }
}
