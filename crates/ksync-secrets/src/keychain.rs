//! Platform keychain backend.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! The realm is the keychain service name, the username the account.

use anyhow::{anyhow, Result};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::identity::{Identity, IdentityStore};

#[derive(Debug, Default, Clone, Copy)]
pub struct KeychainStore;

impl KeychainStore {
    pub fn new() -> Self {
        Self
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new("ksync", "__ksync_probe__").is_ok()
    }
}

fn entry(realm: &str, username: &str) -> Result<keyring::Entry> {
    keyring::Entry::new(realm, username).map_err(|e| anyhow!("keychain entry creation: {e}"))
}

impl IdentityStore for KeychainStore {
    fn get(&self, realm: &str, username: &str) -> Result<Option<Identity>> {
        match entry(realm, username)?.get_password() {
            Ok(mut password) => {
                let secret = SecretString::from(password.clone());
                password.zeroize();
                Ok(Some(Identity::new(realm, username, secret)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("keychain get for '{realm}/{username}': {e}")),
        }
    }

    fn set(&self, identity: &Identity) -> Result<()> {
        entry(&identity.realm, &identity.username)?
            .set_password(identity.secret.expose_secret())
            .map_err(|e| anyhow!("keychain store for '{}/{}': {e}", identity.realm, identity.username))?;
        tracing::debug!(realm = %identity.realm, username = %identity.username, "stored secret in platform keychain");
        Ok(())
    }

    fn delete(&self, realm: &str, username: &str) -> Result<()> {
        match entry(realm, username)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(realm, username, "deleted secret from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(anyhow!("keychain delete for '{realm}/{username}': {e}")),
        }
    }
}
