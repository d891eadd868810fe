//! ksync-secrets: where sync keys live between runs
//!
//! A sync key is stored as the secret of an [`Identity`] keyed by
//! (realm, username). The default realm is `ksync-key-bundles`; the
//! username is the account name, which also salts key derivation.

pub mod identity;
pub mod keychain;

pub use identity::{Identity, IdentityStore, MemoryIdentityStore};
pub use keychain::KeychainStore;

use anyhow::{Context, Result};
use ksync_core::config::SecretsConfig;
use ksync_core::KsyncError;
use ksync_crypto::SyncKeyBundle;
use secrecy::{ExposeSecret, SecretString};

/// Open the credential backend named in the configuration.
pub fn open_store(config: &SecretsConfig) -> Result<Box<dyn IdentityStore>> {
    match config.backend.as_str() {
        "keychain" => {
            let store = KeychainStore::new();
            if !store.is_available() {
                tracing::warn!("platform keychain not available");
            }
            Ok(Box::new(store))
        }
        "memory" => Ok(Box::new(MemoryIdentityStore::new())),
        other => Err(KsyncError::Secrets(format!("unknown secrets backend: {other}")).into()),
    }
}

/// Build the sync key bundle for `username` from the stored sync key.
///
/// Returns `None` when no sync key is stored.
pub fn load_sync_key_bundle(
    store: &dyn IdentityStore,
    realm: &str,
    username: &str,
) -> Result<Option<SyncKeyBundle>> {
    let Some(identity) = store
        .get(realm, username)
        .with_context(|| format!("loading sync key for {username}"))?
    else {
        tracing::debug!(realm, username, "no stored sync key");
        return Ok(None);
    };

    let bundle = SyncKeyBundle::with_realm(realm, username, identity.secret)
        .with_context(|| format!("stored sync key for {username} is invalid"))?;
    Ok(Some(bundle))
}

/// Validate `key` as a friendly base32 sync key and store it.
pub fn store_sync_key(store: &dyn IdentityStore, realm: &str, username: &str, key: SecretString) -> Result<()> {
    ksync_crypto::decode_key_base32(key.expose_secret()).context("refusing to store invalid sync key")?;
    store
        .set(&Identity::new(realm, username, key))
        .with_context(|| format!("storing sync key for {username}"))?;
    tracing::info!(realm, username, "sync key stored");
    Ok(())
}
