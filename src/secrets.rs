use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use log::debug;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::BoxError;

/// sealed blobs carry the random nonce in front of the ciphertext
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct PlatformCredentials {
    pub api_id: i32,
    pub api_hash: String,
}

/// read-only secret source.
///
/// implementations may cache results for the lifetime of a short-lived token
/// (at most an hour) and must renew transparently.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_platform_credentials(&self) -> Result<PlatformCredentials, BoxError>;
    /// 32-byte key under which this session's blob is sealed at rest
    async fn get_session_key(&self, session_id: &str) -> Result<Vec<u8>, BoxError>;
    async fn get_signing_key(&self, purpose: &str) -> Result<Vec<u8>, BoxError>;
}

/// seals a session blob under its per-session key; the stored form is
/// nonce || ciphertext and carries no plaintext auth material
pub fn seal_session_blob(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, BoxError> {
    if key.len() != KEY_LEN {
        return Err("session key must be 32 bytes".into());
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    for byte in nonce_bytes.iter_mut() {
        *byte = fastrand::u8(..);
    }
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| "session blob encryption failed")?;
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// opens a sealed session blob; fails on truncation, tampering or a wrong key
pub fn open_session_blob(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, BoxError> {
    if key.len() != KEY_LEN {
        return Err("session key must be 32 bytes".into());
    }
    if sealed.len() <= NONCE_LEN {
        return Err("sealed session blob is truncated".into());
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(&sealed[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &sealed[NONCE_LEN..])
        .map_err(|_| "session blob failed to open, wrong key or corrupted data".into())
}

/// environment-backed secret store: the static-token fallback mode.
///
/// platform credentials come from `TG_API_ID` / `TG_API_HASH`; keys are
/// derived from `SESSION_MASTER_KEY`. credentials are cached and re-read
/// once the cache ages out, which also covers rotated values.
pub struct EnvSecretStore {
    cache_ttl: Duration,
    cached: Mutex<Option<(Instant, PlatformCredentials)>>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60 * 60),
            cached: Mutex::new(None),
        }
    }

    fn read_credentials() -> Result<PlatformCredentials, BoxError> {
        let api_id = env::var("TG_API_ID")
            .map_err(|_| "TG_API_ID environment variable is required")?
            .parse::<i32>()
            .map_err(|_| "TG_API_ID must be a valid integer")?;
        let api_hash =
            env::var("TG_API_HASH").map_err(|_| "TG_API_HASH environment variable is required")?;
        Ok(PlatformCredentials { api_id, api_hash })
    }

    /// domain-separated 32-byte key from the master secret
    fn derive_key(label: &str, subject: &str) -> Result<Vec<u8>, BoxError> {
        let master = env::var("SESSION_MASTER_KEY")
            .map_err(|_| "SESSION_MASTER_KEY environment variable is required")?;
        let mut hasher = Sha256::new();
        hasher.update(master.as_bytes());
        hasher.update(b":");
        hasher.update(label.as_bytes());
        hasher.update(b":");
        hasher.update(subject.as_bytes());
        Ok(hasher.finalize().to_vec())
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_platform_credentials(&self) -> Result<PlatformCredentials, BoxError> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some((fetched_at, credentials)) = cached.as_ref() {
                if fetched_at.elapsed() < self.cache_ttl {
                    return Ok(credentials.clone());
                }
            }
        }

        debug!("Refreshing platform credentials");
        let credentials = Self::read_credentials()?;
        let mut cached = self.cached.lock().unwrap();
        *cached = Some((Instant::now(), credentials.clone()));
        Ok(credentials)
    }

    async fn get_session_key(&self, session_id: &str) -> Result<Vec<u8>, BoxError> {
        Self::derive_key("session", session_id)
    }

    async fn get_signing_key(&self, purpose: &str) -> Result<Vec<u8>, BoxError> {
        Self::derive_key("signing", purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn sealed_blob_round_trips() {
        let key = test_key();
        let plaintext = b"telegram auth material".to_vec();
        let sealed = seal_session_blob(&key, &plaintext).unwrap();
        // the stored form never contains the plaintext
        assert!(!sealed.windows(plaintext.len()).any(|w| w == plaintext));
        let opened = open_session_blob(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn sealing_twice_yields_distinct_ciphertexts() {
        let key = test_key();
        let first = seal_session_blob(&key, b"blob").unwrap();
        let second = seal_session_blob(&key, b"blob").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_blob_fails_to_open() {
        let key = test_key();
        let mut sealed = seal_session_blob(&key, b"blob").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_session_blob(&key, &sealed).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = seal_session_blob(&test_key(), b"blob").unwrap();
        let other_key: Vec<u8> = (100u8..132).collect();
        assert!(open_session_blob(&other_key, &sealed).is_err());
    }

    #[test]
    fn short_inputs_are_rejected() {
        assert!(seal_session_blob(&[1, 2, 3], b"blob").is_err());
        assert!(open_session_blob(&test_key(), &[0u8; 10]).is_err());
    }
}
