//! Encryption envelope for cached values.
//!
//! Every encrypted value is wrapped in a structured record carrying the
//! algorithm identifier, nonce, ciphertext, authentication tag, key salt,
//! write timestamp and format version. The timestamp is validated against a
//! freshness window on open so stale or clock-skewed envelopes are rejected.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::core::{XyPrissError, XyResult};
use crate::crypto::{AeadAlgorithm, CryptoProvider, NONCE_SIZE};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Default maximum envelope age: 24 hours.
pub const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Default tolerated forward clock skew: 60 seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub algorithm: AeadAlgorithm,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub salt: String,
    pub timestamp: u64,
    pub version: u8,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encrypts `plaintext` into a serialized envelope.
///
/// `salt` is the key-derivation salt of the cache instance; it rides along
/// so a reader can re-derive the key from the master secret.
pub fn seal(
    provider: &dyn CryptoProvider,
    algorithm: AeadAlgorithm,
    key: &[u8],
    salt: &[u8],
    plaintext: &[u8],
) -> XyResult<Vec<u8>> {
    let nonce = provider.random_bytes(NONCE_SIZE);
    let sealed = provider.aead_encrypt(algorithm, key, &nonce, plaintext, b"")?;

    let envelope = Envelope {
        algorithm,
        iv: BASE64.encode(&nonce),
        ciphertext: BASE64.encode(&sealed.ciphertext),
        auth_tag: BASE64.encode(&sealed.auth_tag),
        salt: BASE64.encode(salt),
        timestamp: unix_now(),
        version: ENVELOPE_VERSION,
    };
    serde_json::to_vec(&envelope).map_err(|e| XyPrissError::Crypto(e.to_string()))
}

/// Decrypts a serialized envelope, enforcing the freshness window
/// `now - max_age <= timestamp <= now + clock_skew`.
pub fn open(
    provider: &dyn CryptoProvider,
    key: &[u8],
    envelope_bytes: &[u8],
    max_age_secs: u64,
    clock_skew_secs: u64,
) -> XyResult<Vec<u8>> {
    let envelope: Envelope = serde_json::from_slice(envelope_bytes)
        .map_err(|e| XyPrissError::Crypto(format!("malformed envelope: {e}")))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(XyPrissError::Crypto(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let now = unix_now();
    if envelope.timestamp > now + clock_skew_secs {
        return Err(XyPrissError::Crypto("envelope timestamp in the future".to_string()));
    }
    if now.saturating_sub(envelope.timestamp) > max_age_secs {
        return Err(XyPrissError::Crypto("envelope expired".to_string()));
    }

    let decode = |field: &str, data: &str| {
        BASE64
            .decode(data)
            .map_err(|e| XyPrissError::Crypto(format!("invalid {field} encoding: {e}")))
    };
    let nonce = decode("iv", &envelope.iv)?;
    let ciphertext = decode("ciphertext", &envelope.ciphertext)?;
    let auth_tag = decode("auth_tag", &envelope.auth_tag)?;

    provider.aead_decrypt(envelope.algorithm, key, &nonce, &ciphertext, &auth_tag, b"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DefaultCryptoProvider, StubCryptoProvider, KEY_SIZE};

    #[test]
    fn test_seal_open_roundtrip() {
        let provider = DefaultCryptoProvider;
        let key = vec![9u8; KEY_SIZE];
        let sealed = seal(
            &provider,
            AeadAlgorithm::Aes256Gcm,
            &key,
            b"salt",
            b"cached value",
        )
        .unwrap();
        let opened = open(
            &provider,
            &key,
            &sealed,
            DEFAULT_MAX_AGE_SECS,
            DEFAULT_CLOCK_SKEW_SECS,
        )
        .unwrap();
        assert_eq!(opened, b"cached value");
    }

    #[test]
    fn test_envelope_fields_present() {
        let provider = StubCryptoProvider;
        let key = vec![1u8; KEY_SIZE];
        let sealed = seal(&provider, AeadAlgorithm::ChaCha20Poly1305, &key, b"s", b"v").unwrap();
        let envelope: Envelope = serde_json::from_slice(&sealed).unwrap();
        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(envelope.algorithm, AeadAlgorithm::ChaCha20Poly1305);
        assert!(envelope.timestamp > 0);
        assert!(!envelope.iv.is_empty());
        assert!(!envelope.auth_tag.is_empty());
    }

    #[test]
    fn test_expired_envelope_rejected() {
        let provider = StubCryptoProvider;
        let key = vec![1u8; KEY_SIZE];
        let sealed = seal(&provider, AeadAlgorithm::Aes256Gcm, &key, b"s", b"v").unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&sealed).unwrap();
        envelope.timestamp -= 100;
        let aged = serde_json::to_vec(&envelope).unwrap();
        // max_age of 10s with a 100s-old timestamp must fail.
        let err = open(&provider, &key, &aged, 10, DEFAULT_CLOCK_SKEW_SECS).unwrap_err();
        assert!(matches!(err, XyPrissError::Crypto(_)));
    }

    #[test]
    fn test_future_envelope_rejected() {
        let provider = StubCryptoProvider;
        let key = vec![1u8; KEY_SIZE];
        let sealed = seal(&provider, AeadAlgorithm::Aes256Gcm, &key, b"s", b"v").unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&sealed).unwrap();
        envelope.timestamp += 3600;
        let skewed = serde_json::to_vec(&envelope).unwrap();
        assert!(open(&provider, &key, &skewed, DEFAULT_MAX_AGE_SECS, 60).is_err());
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let provider = DefaultCryptoProvider;
        let key = vec![9u8; KEY_SIZE];
        let other = vec![8u8; KEY_SIZE];
        let sealed = seal(&provider, AeadAlgorithm::Aes256Gcm, &key, b"s", b"v").unwrap();
        let err = open(
            &provider,
            &other,
            &sealed,
            DEFAULT_MAX_AGE_SECS,
            DEFAULT_CLOCK_SKEW_SECS,
        )
        .unwrap_err();
        assert!(matches!(err, XyPrissError::Auth(_)));
    }
}
