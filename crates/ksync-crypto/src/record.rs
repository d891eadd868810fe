//! Encrypted record envelope
//!
//! Wire payload (JSON string inside the base record):
//! ```text
//! { "ciphertext": base64(AES-256-CBC(json(cleartext))), "IV": base64(iv), "hmac": hex(HMAC-SHA256(ciphertext)) }
//! ```
//!
//! The HMAC covers the base64 ciphertext text exactly as it is stored. The
//! cleartext carries its own copy of the record id, which is checked after
//! decryption so an envelope cannot be replayed under a different id.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use ksync_core::Wbo;

use crate::bundle::{BulkKeyBundle, KeyBundle, SyncKeyBundle};
use crate::collection_keys::CollectionKeyManager;
use crate::error::{CryptoError, CryptoResult};
use crate::primitives;
use crate::IV_SIZE;

/// A decrypted record body: always a JSON object.
pub type Payload = serde_json::Map<String, Value>;

/// Where a record gets its key bundle from.
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// Use this bundle regardless of the record's collection
    Bundle(&'a dyn KeyBundle),
    /// Look the record's collection up in a keyset
    Collections(&'a CollectionKeyManager),
}

impl<'a> KeySource<'a> {
    fn resolve(&self, collection: &str) -> Option<&'a dyn KeyBundle> {
        match *self {
            KeySource::Bundle(bundle) => Some(bundle),
            KeySource::Collections(keys) => keys
                .key_for_collection(collection)
                .map(|bundle| bundle as &dyn KeyBundle),
        }
    }
}

impl<'a> From<&'a dyn KeyBundle> for KeySource<'a> {
    fn from(bundle: &'a dyn KeyBundle) -> Self {
        KeySource::Bundle(bundle)
    }
}

impl<'a> From<&'a BulkKeyBundle> for KeySource<'a> {
    fn from(bundle: &'a BulkKeyBundle) -> Self {
        KeySource::Bundle(bundle)
    }
}

impl<'a> From<&'a SyncKeyBundle> for KeySource<'a> {
    fn from(bundle: &'a SyncKeyBundle) -> Self {
        KeySource::Bundle(bundle)
    }
}

impl<'a> From<&'a CollectionKeyManager> for KeySource<'a> {
    fn from(keys: &'a CollectionKeyManager) -> Self {
        KeySource::Collections(keys)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    ciphertext: String,
    #[serde(rename = "IV")]
    iv: String,
    hmac: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Cleartext(Payload),
    Ciphertext(Envelope),
}

/// A record that is either in cleartext form or in authenticated ciphertext form, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedRecord {
    id: String,
    collection: String,
    pub sortindex: Option<i64>,
    pub modified: Option<f64>,
    body: Body,
}

impl EncryptedRecord {
    /// An empty cleartext record: `{"id": id}`.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::with_cleartext(collection, id, Payload::new())
    }

    /// A cleartext record; the record id is written into the payload.
    pub fn with_cleartext(collection: impl Into<String>, id: impl Into<String>, payload: Payload) -> Self {
        let mut record = Self {
            id: id.into(),
            collection: collection.into(),
            sortindex: None,
            modified: None,
            body: Body::Cleartext(Payload::new()),
        };
        record.set_cleartext(payload);
        record
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.body, Body::Ciphertext(_))
    }

    pub fn cleartext(&self) -> Option<&Payload> {
        match &self.body {
            Body::Cleartext(payload) => Some(payload),
            Body::Ciphertext(_) => None,
        }
    }

    pub fn cleartext_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.body {
            Body::Cleartext(payload) => Some(payload),
            Body::Ciphertext(_) => None,
        }
    }

    /// Replace the body with `payload`, discarding any ciphertext.
    pub fn set_cleartext(&mut self, mut payload: Payload) {
        payload.insert("id".into(), Value::String(self.id.clone()));
        self.body = Body::Cleartext(payload);
    }

    pub fn ciphertext(&self) -> Option<&str> {
        self.envelope().map(|e| e.ciphertext.as_str())
    }

    pub fn iv(&self) -> Option<&str> {
        self.envelope().map(|e| e.iv.as_str())
    }

    pub fn hmac(&self) -> Option<&str> {
        self.envelope().map(|e| e.hmac.as_str())
    }

    fn envelope(&self) -> Option<&Envelope> {
        match &self.body {
            Body::Ciphertext(envelope) => Some(envelope),
            Body::Cleartext(_) => None,
        }
    }

    /// Deletion is recorded inside the cleartext, so it is covered by the envelope.
    pub fn is_deleted(&self) -> bool {
        self.cleartext()
            .and_then(|c| c.get("deleted"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Turn the record into a tombstone: `{"id": id, "deleted": true}`.
    pub fn mark_deleted(&mut self) {
        let mut payload = Payload::new();
        payload.insert("deleted".into(), Value::Bool(true));
        self.set_cleartext(payload);
    }

    /// Hex HMAC-SHA256 of the stored ciphertext under `bundle`'s HMAC key.
    pub fn ciphertext_hmac(&self, bundle: &dyn KeyBundle) -> CryptoResult<String> {
        let envelope = self.envelope().ok_or(CryptoError::NoCiphertext)?;
        let hmac_key = bundle.hmac_key_object().ok_or(CryptoError::MissingKey)?;
        Ok(hex::encode(primitives::hmac_sha256(
            envelope.ciphertext.as_bytes(),
            hmac_key,
        )))
    }

    fn missing_bundle(&self) -> CryptoError {
        CryptoError::MissingKeyBundle {
            collection: self.collection.clone(),
            id: self.id.clone(),
        }
    }

    /// Encrypt the cleartext in place.
    ///
    /// `keys` is either an explicit bundle or a keyset in which the record's
    /// collection is looked up.
    pub fn encrypt<'k>(&mut self, keys: impl Into<KeySource<'k>>) -> CryptoResult<()> {
        let Body::Cleartext(cleartext) = &mut self.body else {
            return Err(CryptoError::MalformedRecord(format!(
                "{}/{} is already encrypted",
                self.collection, self.id
            )));
        };

        let bundle = keys
            .into()
            .resolve(&self.collection)
            .ok_or_else(|| CryptoError::MissingKeyBundle {
                collection: self.collection.clone(),
                id: self.id.clone(),
            })?;
        let material = bundle.key_material().ok_or(CryptoError::MissingKey)?;

        cleartext.insert("id".into(), Value::String(self.id.clone()));
        let plaintext = Zeroizing::new(serde_json::to_vec(cleartext)?);

        let iv = primitives::random_iv();
        let ciphertext = STANDARD.encode(primitives::encrypt(&plaintext, material.encryption_key(), &iv));
        let hmac = hex::encode(primitives::hmac_sha256(
            ciphertext.as_bytes(),
            material.hmac_key_object(),
        ));

        tracing::trace!(collection = %self.collection, id = %self.id, "record encrypted");
        self.body = Body::Ciphertext(Envelope {
            ciphertext,
            iv: STANDARD.encode(iv),
            hmac,
        });
        Ok(())
    }

    /// Verify and decrypt the ciphertext in place, returning the cleartext.
    ///
    /// The HMAC is checked before anything is decrypted. On any error the
    /// record keeps its ciphertext.
    pub fn decrypt<'k>(&mut self, keys: impl Into<KeySource<'k>>) -> CryptoResult<&Payload> {
        let envelope = self.envelope().ok_or(CryptoError::NoCiphertext)?;
        let bundle = keys
            .into()
            .resolve(&self.collection)
            .ok_or_else(|| self.missing_bundle())?;
        let material = bundle.key_material().ok_or(CryptoError::MissingKey)?;

        let computed = hex::encode(primitives::hmac_sha256(
            envelope.ciphertext.as_bytes(),
            material.hmac_key_object(),
        ));
        if !bool::from(computed.as_bytes().ct_eq(envelope.hmac.as_bytes())) {
            tracing::debug!(collection = %self.collection, id = %self.id, "record HMAC mismatch");
            return Err(CryptoError::HmacMismatch {
                expected: envelope.hmac.clone(),
                computed,
            });
        }

        let iv: [u8; IV_SIZE] = STANDARD
            .decode(&envelope.iv)
            .ok()
            .and_then(|iv| iv.try_into().ok())
            .ok_or_else(|| CryptoError::MalformedRecord(format!("invalid IV for {}/{}", self.collection, self.id)))?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| CryptoError::MalformedRecord(format!("ciphertext is not base64: {e}")))?;

        let plaintext = Zeroizing::new(primitives::decrypt(&ciphertext, material.encryption_key(), &iv)?);
        let parsed: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::DecryptionFormat(format!("payload is not JSON: {e}")))?;
        let Value::Object(payload) = parsed else {
            return Err(CryptoError::DecryptionFormat(format!(
                "result is <{parsed}>, not an object"
            )));
        };

        let found = payload.get("id").and_then(Value::as_str);
        if found != Some(self.id.as_str()) {
            return Err(CryptoError::IdentityMismatch {
                expected: self.id.clone(),
                found: found.map(str::to_string),
            });
        }

        self.body = Body::Cleartext(payload);
        match &self.body {
            Body::Cleartext(payload) => Ok(payload),
            Body::Ciphertext(_) => Err(CryptoError::NoCiphertext),
        }
    }

    /// The base record carrying this envelope. The record must be encrypted.
    pub fn to_wbo(&self) -> CryptoResult<Wbo> {
        let envelope = self.envelope().ok_or(CryptoError::NoCiphertext)?;
        Ok(Wbo {
            id: self.id.clone(),
            collection: Some(self.collection.clone()),
            sortindex: self.sortindex,
            modified: self.modified,
            payload: serde_json::to_string(envelope)?,
        })
    }

    /// Parse an encrypted record out of a base record.
    pub fn from_wbo(wbo: &Wbo) -> CryptoResult<Self> {
        let collection = wbo
            .collection
            .clone()
            .ok_or_else(|| CryptoError::MalformedRecord(format!("record {} has no collection", wbo.id)))?;
        let envelope: Envelope = serde_json::from_str(&wbo.payload)
            .map_err(|e| CryptoError::MalformedRecord(format!("payload of {collection}/{}: {e}", wbo.id)))?;

        Ok(Self {
            id: wbo.id.clone(),
            collection,
            sortindex: wbo.sortindex,
            modified: wbo.modified,
            body: Body::Ciphertext(envelope),
        })
    }
}

impl std::fmt::Display for EncryptedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let payload = match &self.body {
            _ if self.is_deleted() => "DELETED".to_string(),
            Body::Cleartext(payload) => Value::Object(payload.clone()).to_string(),
            Body::Ciphertext(_) => "<encrypted>".to_string(),
        };
        let opt = |v: Option<String>| v.unwrap_or_else(|| "undefined".into());
        write!(
            f,
            "{{ id: {}\n  index: {}\n  modified: {}\n  payload: {}\n  collection: {} }}",
            self.id,
            opt(self.sortindex.map(|i| i.to_string())),
            opt(self.modified.map(|m| m.to_string())),
            payload,
            self.collection
        )
    }
}
