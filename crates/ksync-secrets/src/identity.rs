//! Stored credentials, keyed by (realm, username)

use anyhow::{anyhow, Result};
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A secret held for one account in one realm.
#[derive(Debug)]
pub struct Identity {
    pub realm: String,
    pub username: String,
    pub secret: SecretString,
}

impl Identity {
    pub fn new(realm: impl Into<String>, username: impl Into<String>, secret: SecretString) -> Self {
        Self {
            realm: realm.into(),
            username: username.into(),
            secret,
        }
    }
}

/// Credential storage backend.
pub trait IdentityStore {
    /// The stored identity, or `None` if nothing is stored for the pair.
    fn get(&self, realm: &str, username: &str) -> Result<Option<Identity>>;

    /// Store `identity`, replacing any previous secret for its realm and username.
    fn set(&self, identity: &Identity) -> Result<()>;

    /// Remove the identity. Removing an absent identity is not an error.
    fn delete(&self, realm: &str, username: &str) -> Result<()>;
}

/// Process-local store, used in tests and with `backend = "memory"`.
#[derive(Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<BTreeMap<(String, String), SecretString>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), SecretString>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory identity store lock poisoned"))
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, realm: &str, username: &str) -> Result<Option<Identity>> {
        let entries = self.entries()?;
        Ok(entries
            .get(&(realm.to_string(), username.to_string()))
            .map(|secret| {
                Identity::new(realm, username, SecretString::from(secret.expose_secret().to_string()))
            }))
    }

    fn set(&self, identity: &Identity) -> Result<()> {
        self.entries()?.insert(
            (identity.realm.clone(), identity.username.clone()),
            SecretString::from(identity.secret.expose_secret().to_string()),
        );
        tracing::debug!(realm = %identity.realm, username = %identity.username, "stored identity in memory");
        Ok(())
    }

    fn delete(&self, realm: &str, username: &str) -> Result<()> {
        self.entries()?
            .remove(&(realm.to_string(), username.to_string()));
        Ok(())
    }
}
