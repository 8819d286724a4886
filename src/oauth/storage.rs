//! OAuth Token Storage
//!
//! Persists one [`TokenRecord`] per server name in a single encrypted file
//! (`tokens.enc`). The file holds `base64(nonce || AES-256-GCM(json map))`
//! with a key derived via PBKDF2 from the `user@host` identity, so the same
//! user on the same machine recreates the key without a keyfile.
//!
//! A wrong key or a corrupted file degrades to an empty store with a
//! warning. It never fails the caller.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{Error, Result};

const KDF_SALT: &[u8] = b"mcp_oauth_bridge_salt_v1";
const KDF_ITERATIONS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();
const KEY_LEN: usize = 32;

/// OAuth token information for one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Access token
    pub access_token: String,

    /// Refresh token (optional)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Expiry of the current access token
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenRecord {
    /// Create a record from token endpoint fields, computing
    /// `expires_at = now + expires_in` when a lifetime is given
    #[must_use]
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: token_type.unwrap_or_else(default_token_type),
            expires_at: expires_in.and_then(expiry_from_now),
            scope,
        }
    }

    /// Whether the access token is past its expiry. Records without an
    /// expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Whether the access token expires within `window` from now
    #[must_use]
    pub fn expires_within(&self, window: Duration) -> bool {
        let Some(at) = self.expires_at else {
            return false;
        };
        TimeDelta::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_add_signed(w))
            .is_none_or(|deadline| deadline >= at)
    }

    /// Whether a refresh grant can recover this record
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Time left until expiry, if any
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
    }
}

fn expiry_from_now(expires_in: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(expires_in).ok()?;
    Utc::now().checked_add_signed(TimeDelta::try_seconds(secs)?)
}

/// Symmetric cipher for the token file
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the key for the current `user@host`
    #[must_use]
    pub fn for_current_user() -> Self {
        Self::from_identity(&current_identity())
    }

    /// Derive the key from an explicit identity string
    #[must_use]
    pub fn from_identity(identity: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            KDF_ITERATIONS,
            KDF_SALT,
            identity.as_bytes(),
            &mut key,
        );
        Self { key }
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        UnboundKey::new(&AES_256_GCM, &self.key)
            .map(LessSafeKey::new)
            .map_err(|_| Error::Storage("invalid token encryption key".to_string()))
    }

    /// Encrypt `plaintext` into `base64(nonce || ciphertext || tag)`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Storage("failed to generate nonce".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.sealing_key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Storage("token encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(STANDARD.encode(sealed))
    }

    /// Decrypt data produced by [`TokenCipher::encrypt`]
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Storage(format!("token file is not valid base64: {e}")))?;
        if sealed.len() < NONCE_LEN {
            return Err(Error::Storage("token file is truncated".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Storage("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .sealing_key()?
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                Error::Storage("token file could not be decrypted (wrong key or corrupted)".to_string())
            })?;
        Ok(plaintext.to_vec())
    }
}

fn current_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}")
}

/// Encrypted token store keyed by server name
pub struct TokenStore {
    path: PathBuf,
    cipher: TokenCipher,
    /// Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl TokenStore {
    /// Open (or lazily create) the store at `path`
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, cipher: TokenCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
            lock: Mutex::new(()),
        }
    }

    /// Location of the encrypted file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Token record for a server
    pub fn get(&self, name: &str) -> Option<TokenRecord> {
        let _guard = self.lock.lock();
        self.load().remove(name)
    }

    /// Insert or replace a server's record
    pub fn put(&self, name: &str, record: TokenRecord) -> Result<()> {
        let _guard = self.lock.lock();
        let mut tokens = self.load();
        tokens.insert(name.to_string(), record);
        self.save(&tokens)?;
        info!(server = %name, "Stored OAuth token");
        Ok(())
    }

    /// Remove a server's record, returning whether one existed
    pub fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut tokens = self.load();
        if tokens.remove(name).is_none() {
            return Ok(false);
        }
        self.save(&tokens)?;
        info!(server = %name, "Deleted OAuth token");
        Ok(true)
    }

    /// All stored records
    pub fn list(&self) -> BTreeMap<String, TokenRecord> {
        let _guard = self.lock.lock();
        self.load()
    }

    /// Mutate a record in place. Returns `false` when no record exists.
    pub fn update<F>(&self, name: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut TokenRecord),
    {
        let _guard = self.lock.lock();
        let mut tokens = self.load();
        let Some(record) = tokens.get_mut(name) else {
            return Ok(false);
        };
        f(record);
        self.save(&tokens)?;
        Ok(true)
    }

    /// `true` when `now + window >= expires_at`
    #[must_use]
    pub fn expiring_soon(record: &TokenRecord, window: Duration) -> bool {
        record.expires_within(window)
    }

    /// Remove records that are expired and cannot be refreshed.
    ///
    /// Expired records that still carry a refresh token are kept.
    pub fn sweep_unrecoverable(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut tokens = self.load();
        let before = tokens.len();
        tokens.retain(|name, record| {
            let keep = !record.is_expired() || record.is_recoverable();
            if !keep {
                debug!(server = %name, "Sweeping unrecoverable token");
            }
            keep
        });

        let removed = before - tokens.len();
        if removed > 0 {
            self.save(&tokens)?;
            info!(removed, "Swept unrecoverable tokens");
        }
        Ok(removed)
    }

    fn load(&self) -> BTreeMap<String, TokenRecord> {
        let encoded = match fs::read_to_string(&self.path) {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                return BTreeMap::new();
            }
        };

        let decoded = self
            .cipher
            .decrypt(&encoded)
            .and_then(|plain| serde_json::from_slice(&plain).map_err(Error::from));

        match decoded {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Token file unreadable, treating store as empty"
                );
                BTreeMap::new()
            }
        }
    }

    /// Write to a sibling temp file (mode `0600`), then rename it over the
    /// token file so a failed write never truncates existing tokens.
    fn save(&self, tokens: &BTreeMap<String, TokenRecord>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let plain = serde_json::to_vec(tokens)?;
        let encoded = self.cipher.encrypt(&plain)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        tmp.write_all(encoded.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to replace token file: {e}")))?;

        Ok(())
    }
}
