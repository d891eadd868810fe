use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KsyncError, KsyncResult};

/// Default credential-storage realm for sync keys and key bundles
pub const DEFAULT_REALM: &str = "ksync-key-bundles";

/// Top-level configuration (loaded from ksync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KsyncConfig {
    pub logging: LoggingConfig,
    pub keys: KeysConfig,
    pub secrets: SecretsConfig,
}

impl KsyncConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> KsyncResult<Self> {
        match Self::load_optional(path)? {
            Some(config) => Ok(config),
            None => {
                tracing::warn!("config file not found: {}  (using defaults)", path.display());
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a TOML file, or `None` when the file does not
    /// exist. Nothing is logged, so callers can load before logging is set up.
    pub fn load_optional(path: &Path) -> KsyncResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| KsyncError::Config(format!("parsing config {}: {e}", path.display())))
    }

    pub fn to_toml(&self) -> KsyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| KsyncError::Config(format!("serializing config: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Keyset and keys-record settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Credential storage realm holding the sync key
    pub realm: String,
    /// Account username; also the HKDF domain separator for sync key derivation
    pub username: String,
    /// Collection that stores the keys record (default: crypto)
    pub keys_collection: String,
    /// Id of the keys record (default: keys)
    pub keys_id: String,
    /// Collections that get their own bulk key when a keyset is generated
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Credential backend: "keychain" or "memory"
    pub backend: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            realm: DEFAULT_REALM.into(),
            username: String::new(),
            keys_collection: "crypto".into(),
            keys_id: "keys".into(),
            collections: Vec::new(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: "keychain".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[logging]
level = "debug"
format = "json"

[keys]
realm = "custom-realm"
username = "alice@example.com"
keys_collection = "meta"
keys_id = "global-keys"
collections = ["tabs", "passwords"]

[secrets]
backend = "memory"
"#;
        let config: KsyncConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.keys.realm, "custom-realm");
        assert_eq!(config.keys.username, "alice@example.com");
        assert_eq!(config.keys.keys_collection, "meta");
        assert_eq!(config.keys.keys_id, "global-keys");
        assert_eq!(config.keys.collections, vec!["tabs", "passwords"]);
        assert_eq!(config.secrets.backend, "memory");
    }

    #[test]
    fn test_parse_defaults() {
        let config: KsyncConfig = toml::from_str("").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.keys.realm, DEFAULT_REALM);
        assert_eq!(config.keys.keys_collection, "crypto");
        assert_eq!(config.keys.keys_id, "keys");
        assert!(config.keys.collections.is_empty());
        assert_eq!(config.secrets.backend, "keychain");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[keys]
username = "bob"
"#;
        let config: KsyncConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.keys.username, "bob");
        // Defaults
        assert_eq!(config.keys.keys_id, "keys");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = KsyncConfig::load(&tmp.path().join("absent.toml")).unwrap();

        assert_eq!(config.keys.keys_collection, "crypto");
    }

    #[test]
    fn test_load_optional_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(KsyncConfig::load_optional(&tmp.path().join("absent.toml"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_optional_present_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ksync.toml");
        std::fs::write(&path, "[logging]\nformat = \"json\"\n").unwrap();

        let config = KsyncConfig::load_optional(&path).unwrap().unwrap();
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ksync.toml");
        std::fs::write(&path, "[secrets]\nbackend = \"memory\"\n").unwrap();

        let config = KsyncConfig::load(&path).unwrap();
        assert_eq!(config.secrets.backend, "memory");
    }

    #[test]
    fn test_load_invalid_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ksync.toml");
        std::fs::write(&path, "[keys\nbroken").unwrap();

        let err = KsyncConfig::load(&path).unwrap_err();
        assert!(matches!(err, KsyncError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = KsyncConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed: KsyncConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.keys.realm, parsed.keys.realm);
        assert_eq!(config.logging.format, parsed.logging.format);
    }
}
