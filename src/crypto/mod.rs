//! Cryptographic capability surface consumed by the secure cache and the
//! console interceptor.
//!
//! Core logic never touches cipher crates directly; everything goes through
//! the [`CryptoProvider`] trait so tests can swap in a deterministic stub.
//! The default provider offers AES-256-GCM as the primary AEAD with
//! ChaCha20-Poly1305 as the fallback, PBKDF2-HMAC-SHA256 key derivation and
//! an OS CSPRNG.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::core::{XyPrissError, XyResult};

/// AEAD key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;
/// AEAD nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;
/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// Minimum PBKDF2 iterations accepted for password-derived keys.
pub const MIN_PASSWORD_ITERATIONS: u32 = 100_000;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AeadAlgorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AeadAlgorithm::Aes256Gcm => f.write_str("aes-256-gcm"),
            AeadAlgorithm::ChaCha20Poly1305 => f.write_str("chacha20-poly1305"),
        }
    }
}

/// Ciphertext plus detached authentication tag.
#[derive(Debug, Clone)]
pub struct AeadOutput {
    pub ciphertext: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Abstract cryptographic capability.
///
/// Nonce uniqueness is the caller's responsibility; providers only validate
/// lengths.
pub trait CryptoProvider: Send + Sync {
    fn aead_encrypt(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> XyResult<AeadOutput>;

    fn aead_decrypt(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        auth_tag: &[u8],
        associated_data: &[u8],
    ) -> XyResult<Vec<u8>>;

    /// PBKDF-style derivation. Password contexts must pass at least
    /// [`MIN_PASSWORD_ITERATIONS`]; other contexts choose their own count.
    fn kdf(&self, password: &[u8], salt: &[u8], iterations: u32, out_len: usize)
        -> XyResult<Vec<u8>>;

    fn random_bytes(&self, n: usize) -> Vec<u8>;

    /// Constant-time equality: length mismatch returns false immediately,
    /// otherwise the comparison fold-XOR accumulates over every byte.
    fn constant_time_eq(&self, a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut acc = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            acc |= x ^ y;
        }
        acc == 0
    }
}

fn check_key(key: &[u8]) -> XyResult<()> {
    if key.len() != KEY_SIZE {
        return Err(XyPrissError::Crypto(format!(
            "invalid key length: expected {KEY_SIZE}, got {}",
            key.len()
        )));
    }
    Ok(())
}

fn check_nonce(nonce: &[u8]) -> XyResult<()> {
    if nonce.len() != NONCE_SIZE {
        return Err(XyPrissError::Crypto(format!(
            "invalid nonce length: expected {NONCE_SIZE}, got {}",
            nonce.len()
        )));
    }
    Ok(())
}

/// Production provider backed by RustCrypto ciphers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoProvider;

impl DefaultCryptoProvider {
    pub fn new() -> Self {
        Self
    }

    fn seal(
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        payload: Payload<'_, '_>,
    ) -> XyResult<Vec<u8>> {
        let result = match algorithm {
            AeadAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| XyPrissError::Crypto(e.to_string()))?;
                cipher.encrypt(AesNonce::from_slice(nonce), payload)
            }
            AeadAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| XyPrissError::Crypto(e.to_string()))?;
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        result.map_err(|_| XyPrissError::Crypto("AEAD encryption failed".to_string()))
    }

    fn open(
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        payload: Payload<'_, '_>,
    ) -> XyResult<Vec<u8>> {
        let result = match algorithm {
            AeadAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| XyPrissError::Crypto(e.to_string()))?;
                cipher.decrypt(AesNonce::from_slice(nonce), payload)
            }
            AeadAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| XyPrissError::Crypto(e.to_string()))?;
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        // RustCrypto reports any decryption failure as an opaque error; for
        // AEAD the only failure mode here is an authentication mismatch.
        result.map_err(|_| XyPrissError::Auth("AEAD tag verification failed".to_string()))
    }
}

impl CryptoProvider for DefaultCryptoProvider {
    fn aead_encrypt(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> XyResult<AeadOutput> {
        check_key(key)?;
        check_nonce(nonce)?;

        let sealed = Self::seal(
            algorithm,
            key,
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )?;
        // RustCrypto appends the tag to the ciphertext; the envelope keeps
        // them as separate fields.
        let split = sealed.len() - TAG_SIZE;
        let auth_tag = sealed[split..].to_vec();
        let mut ciphertext = sealed;
        ciphertext.truncate(split);
        Ok(AeadOutput {
            ciphertext,
            auth_tag,
        })
    }

    fn aead_decrypt(
        &self,
        algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        auth_tag: &[u8],
        associated_data: &[u8],
    ) -> XyResult<Vec<u8>> {
        check_key(key)?;
        check_nonce(nonce)?;
        if auth_tag.len() != TAG_SIZE {
            return Err(XyPrissError::Auth("invalid authentication tag length".to_string()));
        }

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(auth_tag);
        Self::open(
            algorithm,
            key,
            nonce,
            Payload {
                msg: &sealed,
                aad: associated_data,
            },
        )
    }

    fn kdf(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out_len: usize,
    ) -> XyResult<Vec<u8>> {
        if iterations == 0 {
            return Err(XyPrissError::Crypto("kdf iterations must be non-zero".to_string()));
        }
        if out_len == 0 {
            return Err(XyPrissError::Crypto("kdf output length must be non-zero".to_string()));
        }
        let mut out = vec![0u8; out_len];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, salt, iterations, &mut out);
        Ok(out)
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        OsRng.fill_bytes(&mut out);
        out
    }
}

/// Derives a cache master key from a password, enforcing the password-context
/// iteration floor.
pub fn derive_password_key(
    provider: &dyn CryptoProvider,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> XyResult<Vec<u8>> {
    let iterations = iterations.max(MIN_PASSWORD_ITERATIONS);
    provider.kdf(password, salt, iterations, KEY_SIZE)
}

/// Deterministic provider for tests: XOR keystream "encryption" with a
/// checksum tag and a counter-free RNG. Never use outside tests.
#[derive(Debug, Default)]
pub struct StubCryptoProvider;

impl StubCryptoProvider {
    fn keystream_byte(key: &[u8], nonce: &[u8], i: usize) -> u8 {
        key[i % key.len()] ^ nonce[i % nonce.len()] ^ (i as u8)
    }

    fn tag(key: &[u8], nonce: &[u8], data: &[u8], aad: &[u8]) -> Vec<u8> {
        let mut tag = vec![0u8; TAG_SIZE];
        for (i, b) in data.iter().chain(aad.iter()).enumerate() {
            tag[i % TAG_SIZE] ^= b.wrapping_add(Self::keystream_byte(key, nonce, i));
        }
        tag
    }
}

impl CryptoProvider for StubCryptoProvider {
    fn aead_encrypt(
        &self,
        _algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> XyResult<AeadOutput> {
        check_key(key)?;
        check_nonce(nonce)?;
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ Self::keystream_byte(key, nonce, i))
            .collect();
        let auth_tag = Self::tag(key, nonce, &ciphertext, associated_data);
        Ok(AeadOutput {
            ciphertext,
            auth_tag,
        })
    }

    fn aead_decrypt(
        &self,
        _algorithm: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        auth_tag: &[u8],
        associated_data: &[u8],
    ) -> XyResult<Vec<u8>> {
        check_key(key)?;
        check_nonce(nonce)?;
        let expected = Self::tag(key, nonce, ciphertext, associated_data);
        if !self.constant_time_eq(&expected, auth_tag) {
            return Err(XyPrissError::Auth("stub tag mismatch".to_string()));
        }
        Ok(ciphertext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ Self::keystream_byte(key, nonce, i))
            .collect())
    }

    fn kdf(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out_len: usize,
    ) -> XyResult<Vec<u8>> {
        let mut out = vec![0u8; out_len];
        for (i, byte) in out.iter_mut().enumerate() {
            let p = password.get(i % password.len().max(1)).copied().unwrap_or(0);
            let s = salt.get(i % salt.len().max(1)).copied().unwrap_or(0);
            *byte = p ^ s ^ (iterations as u8) ^ (i as u8);
        }
        Ok(out)
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        // Fixed pattern keeps envelope tests reproducible.
        (0..n).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<Box<dyn CryptoProvider>> {
        vec![Box::new(DefaultCryptoProvider), Box::new(StubCryptoProvider)]
    }

    #[test]
    fn test_roundtrip_both_algorithms() {
        let provider = DefaultCryptoProvider;
        let key = provider.random_bytes(KEY_SIZE);
        let nonce = provider.random_bytes(NONCE_SIZE);
        for algorithm in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::ChaCha20Poly1305] {
            let sealed = provider
                .aead_encrypt(algorithm, &key, &nonce, b"secret payload", b"aad")
                .unwrap();
            let opened = provider
                .aead_decrypt(
                    algorithm,
                    &key,
                    &nonce,
                    &sealed.ciphertext,
                    &sealed.auth_tag,
                    b"aad",
                )
                .unwrap();
            assert_eq!(opened, b"secret payload");
        }
    }

    #[test]
    fn test_tampered_tag_is_auth_error() {
        for provider in providers() {
            let key = vec![1u8; KEY_SIZE];
            let nonce = vec![2u8; NONCE_SIZE];
            let mut sealed = provider
                .aead_encrypt(AeadAlgorithm::Aes256Gcm, &key, &nonce, b"data", b"")
                .unwrap();
            sealed.auth_tag[0] ^= 0xff;
            let err = provider
                .aead_decrypt(
                    AeadAlgorithm::Aes256Gcm,
                    &key,
                    &nonce,
                    &sealed.ciphertext,
                    &sealed.auth_tag,
                    b"",
                )
                .unwrap_err();
            assert!(matches!(err, XyPrissError::Auth(_)));
        }
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let provider = DefaultCryptoProvider;
        let key = vec![3u8; KEY_SIZE];
        let nonce = vec![4u8; NONCE_SIZE];
        let sealed = provider
            .aead_encrypt(AeadAlgorithm::Aes256Gcm, &key, &nonce, b"data", b"right")
            .unwrap();
        assert!(provider
            .aead_decrypt(
                AeadAlgorithm::Aes256Gcm,
                &key,
                &nonce,
                &sealed.ciphertext,
                &sealed.auth_tag,
                b"wrong",
            )
            .is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let provider = DefaultCryptoProvider;
        let err = provider
            .aead_encrypt(AeadAlgorithm::Aes256Gcm, &[0u8; 16], &[0u8; NONCE_SIZE], b"", b"")
            .unwrap_err();
        assert!(matches!(err, XyPrissError::Crypto(_)));
    }

    #[test]
    fn test_kdf_deterministic_and_length() {
        let provider = DefaultCryptoProvider;
        let a = provider.kdf(b"password", b"salt", 1000, 32).unwrap();
        let b = provider.kdf(b"password", b"salt", 1000, 32).unwrap();
        let c = provider.kdf(b"password", b"pepper", 1000, 32).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_password_iteration_floor() {
        let provider = DefaultCryptoProvider;
        // Requesting fewer iterations than the floor silently raises to it;
        // the derived key must match an explicit floor derivation.
        let low = derive_password_key(&provider, b"pw", b"salt", 10).unwrap();
        let floor = provider
            .kdf(b"pw", b"salt", MIN_PASSWORD_ITERATIONS, KEY_SIZE)
            .unwrap();
        assert_eq!(low, floor);
    }

    #[test]
    fn test_constant_time_eq() {
        let provider = DefaultCryptoProvider;
        assert!(provider.constant_time_eq(b"abc", b"abc"));
        assert!(!provider.constant_time_eq(b"abc", b"abd"));
        assert!(!provider.constant_time_eq(b"abc", b"abcd"));
        assert!(provider.constant_time_eq(b"", b""));
    }
}
