//! Key bundles: an encryption key, an HMAC key, and the prepared HMAC state
//!
//! - [`BulkKeyBundle`]: two independent random keys, exchanged as a base64 key pair.
//! - [`SyncKeyBundle`]: both keys derived from the user's sync key via HKDF-Expand.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::primitives::{self, HmacSha256};
use crate::{HMAC_INPUT, KEY_SIZE};

/// Default credential-storage realm for key bundles
pub use ksync_core::config::DEFAULT_REALM;

/// The populated keys of a bundle. Zeroized on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    encryption_key: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
    hmac: HmacSha256,
}

impl KeyMaterial {
    pub fn new(encryption_key: [u8; KEY_SIZE], hmac_key: [u8; KEY_SIZE]) -> Self {
        let hmac = primitives::hmac_key_object(&hmac_key);
        Self {
            encryption_key,
            hmac_key,
            hmac,
        }
    }

    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption_key
    }

    pub fn hmac_key(&self) -> &[u8; KEY_SIZE] {
        &self.hmac_key
    }

    /// HMAC state keyed with [`hmac_key`](Self::hmac_key)
    pub fn hmac_key_object(&self) -> &HmacSha256 {
        &self.hmac
    }

    /// Byte-for-byte comparison of both keys, in constant time.
    pub fn same_keys(&self, other: &KeyMaterial) -> bool {
        let enc = self.encryption_key.ct_eq(&other.encryption_key);
        let mac = self.hmac_key.ct_eq(&other.hmac_key);
        (enc & mac).into()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.hmac_key.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("encryption_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// Anything that can hand out an encryption key and an HMAC key.
pub trait KeyBundle {
    /// Credential-storage realm the bundle belongs to
    fn realm(&self) -> &str;

    /// Collection the bundle protects (the username for a sync key bundle)
    fn collection(&self) -> &str;

    /// The keys, or `None` if the bundle has not been populated.
    fn key_material(&self) -> Option<&KeyMaterial>;

    fn encryption_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.key_material().map(KeyMaterial::encryption_key)
    }

    fn hmac_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.key_material().map(KeyMaterial::hmac_key)
    }

    fn hmac_key_object(&self) -> Option<&HmacSha256> {
        self.key_material().map(KeyMaterial::hmac_key_object)
    }

    /// Two bundles are equal iff both their encryption and HMAC keys match.
    fn equals(&self, other: &dyn KeyBundle) -> bool {
        match (self.key_material(), other.key_material()) {
            (Some(a), Some(b)) => a.same_keys(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// A bundle of two independent keys, randomly generated or installed from a key pair.
#[derive(Clone)]
pub struct BulkKeyBundle {
    realm: String,
    collection: String,
    keys: Option<KeyMaterial>,
}

impl BulkKeyBundle {
    /// An empty bundle for `collection`; populate it with
    /// [`generate_random`](Self::generate_random) or [`set_key_pair`](Self::set_key_pair).
    pub fn new(collection: impl Into<String>) -> Self {
        Self::with_realm(DEFAULT_REALM, collection)
    }

    pub fn with_realm(realm: impl Into<String>, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        tracing::debug!(collection = %collection, "bulk key bundle created");
        Self {
            realm: realm.into(),
            collection,
            keys: None,
        }
    }

    /// A new bundle with freshly generated random keys.
    pub fn random(collection: impl Into<String>) -> Self {
        let mut bundle = Self::new(collection);
        bundle.generate_random();
        bundle
    }

    /// A new bundle populated from a `[encryption_key_b64, hmac_key_b64]` pair.
    pub fn from_key_pair<S: AsRef<str>>(collection: impl Into<String>, pair: &[S]) -> CryptoResult<Self> {
        let mut bundle = Self::new(collection);
        bundle.set_key_pair(pair)?;
        Ok(bundle)
    }

    /// Replace both keys with independent random keys.
    pub fn generate_random(&mut self) {
        self.keys = Some(KeyMaterial::new(primitives::random_key(), primitives::random_key()));
    }

    /// `[base64(encryption_key), base64(hmac_key)]`, or `None` if unpopulated.
    pub fn key_pair(&self) -> Option<[String; 2]> {
        self.keys.as_ref().map(|k| {
            [
                STANDARD.encode(k.encryption_key()),
                STANDARD.encode(k.hmac_key()),
            ]
        })
    }

    /// Install both keys from a `[encryption_key_b64, hmac_key_b64]` pair.
    ///
    /// Either both keys are installed or, on error, the bundle is unchanged.
    pub fn set_key_pair<S: AsRef<str>>(&mut self, pair: &[S]) -> CryptoResult<()> {
        let [encryption, hmac] = pair else {
            return Err(CryptoError::InvalidKeyPair(format!(
                "expected 2 elements, got {}",
                pair.len()
            )));
        };

        let encryption_key = decode_key(encryption.as_ref(), "encryption key")?;
        let hmac_key = decode_key(hmac.as_ref(), "HMAC key")?;
        self.keys = Some(KeyMaterial::new(encryption_key, hmac_key));
        Ok(())
    }
}

fn decode_key(encoded: &str, what: &str) -> CryptoResult<[u8; KEY_SIZE]> {
    let mut bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKeyPair(format!("{what} is not base64: {e}")))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyPair(format!(
            "{what} has wrong size: {} bytes (expected {KEY_SIZE})",
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

impl KeyBundle for BulkKeyBundle {
    fn realm(&self) -> &str {
        &self.realm
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn key_material(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref()
    }
}

impl PartialEq for BulkKeyBundle {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl std::fmt::Debug for BulkKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkKeyBundle")
            .field("realm", &self.realm)
            .field("collection", &self.collection)
            .field("populated", &self.keys.is_some())
            .finish()
    }
}

/// A bundle whose keys are derived from the user's sync key.
///
/// The sync key is decoded when set; the HKDF derivation itself runs on the
/// first key access and is cached until the sync key changes.
pub struct SyncKeyBundle {
    realm: String,
    username: String,
    key_str: SecretString,
    prk: Option<Zeroizing<Vec<u8>>>,
    derived: OnceLock<KeyMaterial>,
}

impl SyncKeyBundle {
    pub fn new(username: impl Into<String>, key_str: SecretString) -> CryptoResult<Self> {
        Self::with_realm(DEFAULT_REALM, username, key_str)
    }

    pub fn with_realm(
        realm: impl Into<String>,
        username: impl Into<String>,
        key_str: SecretString,
    ) -> CryptoResult<Self> {
        let username = username.into();
        tracing::debug!(username = %username, "sync key bundle created");
        let mut bundle = Self {
            realm: realm.into(),
            username,
            key_str: SecretString::from(String::new()),
            prk: None,
            derived: OnceLock::new(),
        };
        bundle.set_key_str(key_str)?;
        Ok(bundle)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn key_str(&self) -> &SecretString {
        &self.key_str
    }

    /// Install a new sync key, discarding any derived keys.
    ///
    /// An empty key leaves the bundle unpopulated. A key that is not valid
    /// friendly base32 is rejected and the bundle is left as it was.
    pub fn set_key_str(&mut self, key_str: SecretString) -> CryptoResult<()> {
        let prk = if key_str.expose_secret().is_empty() {
            None
        } else {
            Some(primitives::decode_key_base32(key_str.expose_secret())?)
        };

        self.key_str = key_str;
        self.prk = prk;
        self.derived = OnceLock::new();
        Ok(())
    }

    /// Whether the keys have been derived since the sync key was last set.
    pub fn is_derived(&self) -> bool {
        self.derived.get().is_some()
    }

    fn generate_entry(&self) -> Option<KeyMaterial> {
        let prk = self.prk.as_ref()?;
        let info = format!("{HMAC_INPUT}{}", self.username);

        let okm = match primitives::hkdf_expand(prk, info.as_bytes(), 2 * KEY_SIZE) {
            Ok(okm) => okm,
            Err(e) => {
                tracing::error!(username = %self.username, "sync key derivation failed: {e}");
                return None;
            }
        };

        let mut encryption_key = [0u8; KEY_SIZE];
        let mut hmac_key = [0u8; KEY_SIZE];
        encryption_key.copy_from_slice(&okm[..KEY_SIZE]);
        hmac_key.copy_from_slice(&okm[KEY_SIZE..]);
        tracing::trace!(username = %self.username, "derived sync key bundle");
        Some(KeyMaterial::new(encryption_key, hmac_key))
    }
}

impl KeyBundle for SyncKeyBundle {
    fn realm(&self) -> &str {
        &self.realm
    }

    fn collection(&self) -> &str {
        &self.username
    }

    fn key_material(&self) -> Option<&KeyMaterial> {
        if let Some(keys) = self.derived.get() {
            return Some(keys);
        }
        let keys = self.generate_entry()?;
        Some(self.derived.get_or_init(|| keys))
    }
}

impl std::fmt::Debug for SyncKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKeyBundle")
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("key_str", &"[REDACTED]")
            .field("derived", &self.is_derived())
            .finish()
    }
}
