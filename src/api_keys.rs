//! Persisted API-key store for the HTTP control API.
//!
//! Keys are stored as a JSON map from the SHA-256 hex digest of the token
//! to its metadata; the token itself is shown once at generation and never
//! persisted. The file is owner-only (0600, parent 0700) since it gates
//! sandbox creation on the host.

use anyhow::{Context, Result, bail};
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding the store location.
pub const API_KEYS_FILE_ENV: &str = "K7_API_KEYS_FILE";

const DEFAULT_API_KEYS_FILE: &str = "/etc/k7/api_keys.json";

/// Metadata for one API key. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub name: String,
    pub created: i64,
    pub expires: i64,
    pub last_used: Option<i64>,
}

pub struct ApiKeyStore {
    path: PathBuf,
}

impl ApiKeyStore {
    /// Store at `$K7_API_KEYS_FILE`, or the default system path.
    pub fn from_env() -> Self {
        let path = std::env::var(API_KEYS_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_API_KEYS_FILE));
        Self { path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Generate a new key, persist its digest, and return the token. The
    /// token cannot be recovered later.
    pub fn generate(&self, name: &str, expires_days: i64) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now().timestamp();
        let mut keys = self.load()?;
        keys.insert(
            hash_token(&token),
            ApiKeyRecord {
                name: name.to_string(),
                created: now,
                expires: now + expires_days * 86_400,
                last_used: None,
            },
        );
        self.save(&keys)?;
        Ok(token)
    }

    /// All stored records, keyed by token digest.
    pub fn list(&self) -> Result<BTreeMap<String, ApiKeyRecord>> {
        self.load()
    }

    /// Remove the key with the given name. Returns false when no key
    /// matches.
    pub fn revoke(&self, name: &str) -> Result<bool> {
        let mut keys = self.load()?;
        let hash = keys
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(hash, _)| hash.clone());
        match hash {
            Some(hash) => {
                keys.remove(&hash);
                self.save(&keys)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Verify a presented token: constant-time digest comparison, expiry
    /// check, and a persisted `last_used` bump on success.
    pub fn verify(&self, token: &str) -> Result<ApiKeyRecord> {
        let mut keys = self.load()?;
        let token_hash = hash_token(token);

        let matched = keys
            .iter()
            .find(|(stored_hash, _)| constant_time_eq(stored_hash.as_bytes(), token_hash.as_bytes()))
            .map(|(hash, record)| (hash.clone(), record.clone()));

        let Some((hash, record)) = matched else {
            bail!("Invalid API key");
        };

        let now = Utc::now().timestamp();
        if now > record.expires {
            bail!("API key expired");
        }

        if let Some(entry) = keys.get_mut(&hash) {
            entry.last_used = Some(now);
        }
        self.save(&keys)?;
        Ok(record)
    }

    /// Load the store, dropping (and persisting the removal of) any keys
    /// that have already expired.
    fn load(&self) -> Result<BTreeMap<String, ApiKeyRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut keys: BTreeMap<String, ApiKeyRecord> = match serde_json::from_str(&content) {
            Ok(keys) => keys,
            Err(_) => return Ok(BTreeMap::new()),
        };

        let now = Utc::now().timestamp();
        let before = keys.len();
        keys.retain(|_, record| now <= record.expires);
        if keys.len() != before {
            self.save(&keys)?;
        }
        Ok(keys)
    }

    fn save(&self, keys: &BTreeMap<String, ApiKeyRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            create_private_dir(parent)?;
        }
        let content = serde_json::to_string_pretty(keys)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        set_private_file(&self.path)?;
        Ok(())
    }
}

pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Compare two byte strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if !path.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_private_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_file(_path: &Path) -> Result<()> {
    Ok(())
}
