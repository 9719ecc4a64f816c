//! `WireGuard` key types.
//!
//! `WireGuard` uses Curve25519 for key exchange. Keys are 32 bytes and are
//! exchanged as standard base64 text.

use std::fmt;
use std::path::Path;

use base64::Engine;
use rand_core::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::WireGuardError;

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], WireGuardError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
    if bytes.len() != KEY_SIZE {
        return Err(WireGuardError::InvalidKeyLength(bytes.len()));
    }
    let mut arr = [0u8; KEY_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// A `WireGuard` public key (Curve25519, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        let short = &b64[..8.min(b64.len())];
        write!(f, "PublicKey({short}...)")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// A `WireGuard` private key (Curve25519, 32 bytes).
///
/// Neither `Debug` nor any rendering helper in this crate outputs the key
/// except [`render_config`](crate::config::render_config) and
/// [`render_device_config`](crate::config::render_device_config).
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey::from(X25519PublicKey::from(&secret))
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a private key from base64, ignoring surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_key(s.trim()).map(Self)
    }

    /// Reads a base64 private key from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a key.
    pub async fn load(path: &Path) -> Result<Self, WireGuardError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| WireGuardError::KeyFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_base64(&text)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_to_public_key_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn different_private_keys_produce_different_public_keys() {
        let private1 = PrivateKey::generate();
        let private2 = PrivateKey::generate();
        assert_ne!(private1.public_key(), private2.public_key());
    }

    #[test]
    fn known_public_key_decodes() {
        let key = PublicKey::from_base64("qlgnbDFeqmA/qbxbtol4mYB0Eq/rDNfJA7Wg97mJ2Vs=")
            .expect("valid key");
        assert_eq!(key.to_base64(), "qlgnbDFeqmA/qbxbtol4mYB0Eq/rDNfJA7Wg97mJ2Vs=");
    }

    #[test]
    fn private_key_ignores_trailing_newline() {
        let key = PrivateKey::from_base64("QBNloaEPjZd/nafQcH55kdYqnQ6YB6gX35l//QGra2E=\n")
            .expect("valid key");
        assert_eq!(key.to_base64(), "QBNloaEPjZd/nafQcH55kdYqnQ6YB6gX35l//QGra2E=");
    }

    #[test]
    fn short_key_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        let err = PublicKey::from_base64(&short).expect_err("short key");
        assert!(matches!(err, WireGuardError::InvalidKeyLength(16)));
    }

    #[test]
    fn garbage_rejected() {
        let err = PublicKey::from_base64("not base64!").expect_err("garbage");
        assert!(matches!(err, WireGuardError::InvalidBase64(_)));
    }

    #[test]
    fn private_key_debug_redacts() {
        let private = PrivateKey::generate();
        let debug = format!("{private:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&private.to_base64()));
    }

    #[tokio::test]
    async fn load_reads_key_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wg0.key");
        let private = PrivateKey::generate();
        std::fs::write(&path, format!("{}\n", private.to_base64())).expect("write");

        let loaded = PrivateKey::load(&path).await.expect("load");
        assert_eq!(loaded, private);
    }

    #[tokio::test]
    async fn load_missing_file_names_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.key");
        let err = PrivateKey::load(&path).await.expect_err("missing");
        assert!(matches!(err, WireGuardError::KeyFile { .. }));
        assert!(err.to_string().contains("missing.key"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn public_key_base64_roundtrip_prop(bytes in prop::array::uniform32(any::<u8>())) {
                let public = PublicKey::from_bytes_array(bytes);
                let decoded = PublicKey::from_base64(&public.to_base64());
                prop_assert_eq!(Some(public), decoded.ok());
            }

            #[test]
            fn wrong_length_always_rejected(bytes in prop::collection::vec(any::<u8>(), 0..64usize)) {
                prop_assume!(bytes.len() != KEY_SIZE);
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                prop_assert!(PublicKey::from_base64(&encoded).is_err());
            }
        }
    }
}
