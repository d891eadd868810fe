//! ksync-crypto: record encryption and collection key management
//!
//! Envelope: AES-256-CBC (random 128-bit IV) then HMAC-SHA256 over the
//! base64 ciphertext. Decryption verifies the HMAC before touching the
//! cipher, then checks that the embedded id matches the record id.
//!
//! Key hierarchy:
//! ```text
//! Sync Key (128-bit, friendly base32, held by the user)
//!   └── SyncKeyBundle: HKDF-Expand-SHA256(sync_key, "Sync-AES_256_CBC-HMAC256" || username, 64)
//!       │               = encryption key (32) || HMAC key (32)
//!       └── encrypts the keys record (crypto/keys)
//!             ├── default BulkKeyBundle (random)
//!             └── per-collection BulkKeyBundles (random, optional)
//!                   └── encrypt ordinary data records
//! ```

pub mod bundle;
pub mod collection_keys;
pub mod error;
pub mod primitives;
pub mod record;

pub use bundle::{BulkKeyBundle, KeyBundle, KeyMaterial, SyncKeyBundle};
pub use collection_keys::{CollectionComparison, CollectionKeyManager, KeysUpdate};
pub use error::{CryptoError, CryptoResult};
pub use primitives::{decode_key_base32, encode_key_base32, generate_sync_key};
pub use record::{EncryptedRecord, KeySource, Payload};

/// Size of an encryption or HMAC key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-CBC initialization vector (128-bit)
pub const IV_SIZE: usize = 16;

/// Size of a raw sync key in bytes (128-bit, 26 base32 characters)
pub const SYNC_KEY_SIZE: usize = 16;

/// HKDF info prefix for sync key derivation; the username is appended.
pub const HMAC_INPUT: &str = "Sync-AES_256_CBC-HMAC256";

/// Collection name carried by the default bundle of a keyset.
pub const DEFAULT_KEYBUNDLE_NAME: &str = "[default]";

/// Collection holding the keys record.
pub const CRYPTO_COLLECTION: &str = "crypto";

/// Id of the keys record.
pub const KEYS_RECORD_ID: &str = "keys";
