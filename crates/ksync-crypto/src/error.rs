use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key bundle for {collection}/{id}")]
    MissingKeyBundle { collection: String, id: String },

    #[error("cannot compute HMAC with a missing key")]
    MissingKey,

    #[error("no ciphertext: nothing to decrypt")]
    NoCiphertext,

    #[error("HMAC mismatch: expected {expected}, computed {computed}")]
    HmacMismatch { expected: String, computed: String },

    #[error("decryption failed: {0}")]
    DecryptionFormat(String),

    #[error("record id mismatch: payload has {found:?}, record is {expected:?}")]
    IdentityMismatch { expected: String, found: Option<String> },

    #[error("invalid key pair: {0}")]
    InvalidKeyPair(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no payload in keys record")]
    MissingPayload,

    #[error("no default key in keys record")]
    MissingDefaultKey,

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CryptoError {
    /// Whether the caller can recover by refreshing keys and retrying.
    ///
    /// An HMAC mismatch usually means the local keys are stale, not that the
    /// record is corrupt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CryptoError::HmacMismatch { .. })
    }
}
