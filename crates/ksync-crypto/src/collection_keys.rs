//! Collection keys: the default bulk key plus optional per-collection keys
//!
//! The keyset travels as the cleartext of the keys record (`crypto/keys`),
//! encrypted with the sync key bundle:
//! ```text
//! { "default": [enc_b64, hmac_b64], "collections": { name: [enc_b64, hmac_b64] }, "id": .., "collection": .. }
//! ```
//!
//! `last_modified` is a logical clock in seconds with 2-decimal resolution,
//! matching the server's timestamps so that equal snapshots compare equal.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use ksync_core::InfoCollections;

use crate::bundle::{BulkKeyBundle, KeyBundle, SyncKeyBundle};
use crate::error::{CryptoError, CryptoResult};
use crate::record::{EncryptedRecord, Payload};
use crate::{CRYPTO_COLLECTION, DEFAULT_KEYBUNDLE_NAME, KEYS_RECORD_ID};

/// Outcome of installing a keyset snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeysUpdate {
    /// The snapshot matched the installed keys; only the clock moved.
    UpToDate,
    /// The default key changed: treat every collection as rotated.
    DefaultChanged,
    /// The default key is unchanged but these collections were added, removed or rotated.
    CollectionsChanged(Vec<String>),
}

/// Two-way diff of two collection-key maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionComparison {
    pub same: bool,
    /// Sorted, without duplicates
    pub changed: Vec<String>,
}

/// Compare two collection-key maps.
///
/// A collection counts as changed when its bundles differ or when it is
/// present on one side only.
pub fn compare_key_bundle_collections(
    a: &BTreeMap<String, BulkKeyBundle>,
    b: &BTreeMap<String, BulkKeyBundle>,
) -> CollectionComparison {
    let mut changed = BTreeSet::new();
    for (left, right) in [(a, b), (b, a)] {
        for (name, bundle) in left {
            let same = right.get(name).is_some_and(|other| bundle.equals(other));
            if !same {
                changed.insert(name.clone());
            }
        }
    }

    CollectionComparison {
        same: changed.is_empty(),
        changed: changed.into_iter().collect(),
    }
}

/// Current time as a version stamp: seconds, rounded to 2 decimal places.
pub fn version_stamp() -> f64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (millis as f64 / 10.0).round() / 100.0
}

/// JavaScript-style falsiness, used to skip empty keyset entries.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0 || f.is_nan()),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn bundle_from_value(collection: &str, value: &Value) -> CryptoResult<BulkKeyBundle> {
    let Value::Array(items) = value else {
        return Err(CryptoError::InvalidKeyPair(format!(
            "key pair for {collection} is not an array"
        )));
    };
    let pair = items
        .iter()
        .map(|item| {
            item.as_str().ok_or_else(|| {
                CryptoError::InvalidKeyPair(format!("key pair for {collection} holds a non-string"))
            })
        })
        .collect::<CryptoResult<Vec<&str>>>()?;
    BulkKeyBundle::from_key_pair(collection, &pair)
}

/// The default key bundle plus per-collection overrides, with a logical clock.
#[derive(Debug, Clone, Default)]
pub struct CollectionKeyManager {
    last_modified: f64,
    default: Option<BulkKeyBundle>,
    collections: BTreeMap<String, BulkKeyBundle>,
}

impl CollectionKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until a keyset is generated or installed.
    pub fn is_clear(&self) -> bool {
        self.default.is_none()
    }

    pub fn last_modified(&self) -> f64 {
        self.last_modified
    }

    pub fn default_bundle(&self) -> Option<&BulkKeyBundle> {
        self.default.as_ref()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Discard every key and reset the clock.
    pub fn clear(&mut self) {
        tracing::info!("clearing collection keys");
        self.last_modified = 0.0;
        self.collections.clear();
        self.default = None;
    }

    /// The bundle for `collection`, falling back to the default bundle.
    pub fn key_for_collection(&self, collection: &str) -> Option<&BulkKeyBundle> {
        tracing::trace!(
            collection,
            has_default = self.default.is_some(),
            "key for collection"
        );
        self.collections.get(collection).or(self.default.as_ref())
    }

    /// Replace the keyset with a new random default key and a random key for
    /// each of `collections`.
    pub fn generate_new_keys<S: AsRef<str>>(&mut self, collections: &[S]) {
        let default = BulkKeyBundle::random(DEFAULT_KEYBUNDLE_NAME);
        let collections: BTreeMap<String, BulkKeyBundle> = collections
            .iter()
            .map(|c| (c.as_ref().to_string(), BulkKeyBundle::random(c.as_ref())))
            .collect();

        self.default = Some(default);
        self.collections = collections;
        self.last_modified = version_stamp();
        tracing::info!(
            collections = self.collections.len(),
            last_modified = self.last_modified,
            "generated new collection keys"
        );
    }

    /// The keyset as an unencrypted keys record in `collection` (default
    /// `crypto`) with id `id` (default `keys`).
    ///
    /// Encrypt the result with the sync key bundle before uploading it.
    pub fn as_wbo(&self, collection: Option<&str>, id: Option<&str>) -> EncryptedRecord {
        let collection = collection.unwrap_or(CRYPTO_COLLECTION);
        let id = id.unwrap_or(KEYS_RECORD_ID);

        let key_pair = |bundle: &BulkKeyBundle| match bundle.key_pair() {
            Some(pair) => Value::from(pair.to_vec()),
            None => Value::Null,
        };

        let mut payload = Payload::new();
        payload.insert(
            "default".into(),
            self.default.as_ref().map_or(Value::Null, key_pair),
        );
        payload.insert(
            "collections".into(),
            Value::Object(
                self.collections
                    .iter()
                    .map(|(name, bundle)| (name.clone(), key_pair(bundle)))
                    .collect(),
            ),
        );
        payload.insert("collection".into(), Value::String(collection.to_string()));

        let mut record = EncryptedRecord::with_cleartext(collection, id, payload);
        record.modified = Some(self.last_modified);
        record
    }

    /// Whether the server's keys record may be newer than ours.
    pub fn update_needed(&self, info_collections: &InfoCollections) -> bool {
        tracing::info!(last_modified = self.last_modified, "testing for update needed");

        if self.last_modified == 0.0 {
            return true;
        }

        match info_collections.get(CRYPTO_COLLECTION) {
            // No keys on the server: the caller has to upload fresh ones.
            None => true,
            Some(remote) => *remote > self.last_modified,
        }
    }

    /// Install a keyset snapshot, reporting what changed.
    ///
    /// Every candidate bundle is built before any state is touched, so a
    /// malformed snapshot leaves the current keys in place.
    pub fn set_contents(&mut self, payload: Option<&Payload>, modified: Option<f64>) -> CryptoResult<KeysUpdate> {
        tracing::info!(
            last_modified = self.last_modified,
            input_modified = ?modified,
            "setting collection keys contents"
        );

        let payload = payload.ok_or(CryptoError::MissingPayload)?;
        let default_value = match payload.get("default") {
            Some(value) if !is_falsy(value) => value,
            _ => {
                tracing::warn!("no downloaded default key, not clearing local keys");
                return Err(CryptoError::MissingDefaultKey);
            }
        };

        let new_default = bundle_from_value(DEFAULT_KEYBUNDLE_NAME, default_value)?;

        let mut new_collections = BTreeMap::new();
        if let Some(Value::Object(collections)) = payload.get("collections") {
            tracing::debug!(count = collections.len(), "processing downloaded per-collection keys");
            for (name, value) in collections {
                if is_falsy(value) {
                    continue;
                }
                new_collections.insert(name.clone(), bundle_from_value(name, value)?);
            }
        }

        let same_default = self
            .default
            .as_ref()
            .is_some_and(|current| current.equals(&new_default));
        let comparison = compare_key_bundle_collections(&new_collections, &self.collections);

        let bumped = modified
            .filter(|m| *m != 0.0)
            .unwrap_or_else(version_stamp);

        if same_default && comparison.same {
            tracing::info!(last_modified = bumped, "keys unchanged, bumping last modified");
            self.last_modified = bumped;
            return Ok(KeysUpdate::UpToDate);
        }

        self.clear();
        tracing::info!(
            default_changed = !same_default,
            changed = ?comparison.changed,
            "saving downloaded keys"
        );
        self.default = Some(new_default);
        self.collections = new_collections;
        self.last_modified = bumped;

        if same_default {
            Ok(KeysUpdate::CollectionsChanged(comparison.changed))
        } else {
            Ok(KeysUpdate::DefaultChanged)
        }
    }

    /// Decrypt a fetched keys record with the sync key bundle and install it.
    ///
    /// Decryption errors, including HMAC mismatches, are returned unchanged.
    pub fn update_contents(
        &mut self,
        sync_key_bundle: &SyncKeyBundle,
        keys_record: &mut EncryptedRecord,
    ) -> CryptoResult<KeysUpdate> {
        tracing::info!("updating collection keys");

        let modified = keys_record.modified;
        let payload = keys_record.decrypt(sync_key_bundle).map_err(|e| {
            tracing::warn!("decrypting keys record with sync key failed: {e}");
            e
        })?;

        let update = self.set_contents(Some(payload), modified)?;
        tracing::info!(?update, "collection keys updated");
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::encode_key_base32;
    use secrecy::SecretString;
    use serde_json::json;

    fn pair(bundle: &BulkKeyBundle) -> Value {
        Value::from(bundle.key_pair().unwrap().to_vec())
    }

    fn keyset(default: &BulkKeyBundle, collections: &[(&str, &BulkKeyBundle)]) -> Payload {
        let mut colls = serde_json::Map::new();
        for (name, bundle) in collections {
            colls.insert(name.to_string(), pair(bundle));
        }
        let mut payload = Payload::new();
        payload.insert("default".into(), pair(default));
        payload.insert("collections".into(), Value::Object(colls));
        payload
    }

    fn sync_bundle() -> SyncKeyBundle {
        SyncKeyBundle::new("johndoe@example.com", SecretString::from(encode_key_base32(&[7u8; 16]))).unwrap()
    }

    #[test]
    fn test_starts_clear() {
        let keys = CollectionKeyManager::new();
        assert!(keys.is_clear());
        assert_eq!(keys.last_modified(), 0.0);
        assert!(keys.key_for_collection("tabs").is_none());
    }

    #[test]
    fn test_generate_new_keys() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs", "bookmarks"]);

        assert!(!keys.is_clear());
        assert!(keys.last_modified() > 0.0);
        assert_eq!(keys.collections().collect::<Vec<_>>(), vec!["bookmarks", "tabs"]);

        let default = keys.default_bundle().unwrap();
        assert!(!keys.key_for_collection("tabs").unwrap().equals(default));
        assert!(keys.key_for_collection("history").unwrap().equals(default));
    }

    #[test]
    fn test_generate_replaces_existing() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs"]);
        let old_default = keys.default_bundle().unwrap().clone();

        keys.generate_new_keys::<&str>(&[]);

        assert!(!keys.default_bundle().unwrap().equals(&old_default));
        assert_eq!(keys.collections().count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs"]);
        keys.clear();

        assert!(keys.is_clear());
        assert_eq!(keys.last_modified(), 0.0);
        assert_eq!(keys.collections().count(), 0);
    }

    #[test]
    fn test_key_for_collection_fallback() {
        let default = BulkKeyBundle::random("[default]");
        let tabs = BulkKeyBundle::random("tabs");
        let mut keys = CollectionKeyManager::new();

        keys.set_contents(Some(&keyset(&default, &[])), Some(10.0)).unwrap();
        assert!(keys.key_for_collection("tabs").unwrap().equals(&default));

        keys.set_contents(Some(&keyset(&default, &[("tabs", &tabs)])), Some(11.0)).unwrap();
        assert!(keys.key_for_collection("tabs").unwrap().equals(&tabs));
    }

    #[test]
    fn test_version_stamp_resolution() {
        let stamp = version_stamp();
        assert!(stamp > 1_000_000_000.0);
        assert!(((stamp * 100.0).round() - stamp * 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_update_needed() {
        let mut keys = CollectionKeyManager::new();
        let mut info = InfoCollections::new();
        info.insert("crypto".into(), 100.0);

        assert!(keys.update_needed(&info), "never initialized");

        keys.set_contents(Some(&keyset(&BulkKeyBundle::random("d"), &[])), Some(100.0)).unwrap();
        assert!(!keys.update_needed(&info), "equal timestamps");

        info.insert("crypto".into(), 100.01);
        assert!(keys.update_needed(&info), "remote is newer");

        info.insert("crypto".into(), 99.0);
        assert!(!keys.update_needed(&info), "remote is older");

        info.remove("crypto");
        info.insert("tabs".into(), 200.0);
        assert!(keys.update_needed(&info), "no keys on the server");
    }

    #[test]
    fn test_set_contents_idempotent() {
        let default = BulkKeyBundle::random("[default]");
        let tabs = BulkKeyBundle::random("tabs");
        let payload = keyset(&default, &[("tabs", &tabs)]);
        let mut keys = CollectionKeyManager::new();

        assert_eq!(keys.set_contents(Some(&payload), Some(50.0)).unwrap(), KeysUpdate::DefaultChanged);
        let installed = keys.default_bundle().unwrap().clone();

        assert_eq!(keys.set_contents(Some(&payload), Some(60.0)).unwrap(), KeysUpdate::UpToDate);
        assert_eq!(keys.last_modified(), 60.0);
        assert!(keys.default_bundle().unwrap().equals(&installed));
        assert!(keys.key_for_collection("tabs").unwrap().equals(&tabs));
    }

    #[test]
    fn test_set_contents_without_timestamp_uses_clock() {
        let payload = keyset(&BulkKeyBundle::random("d"), &[]);
        let mut keys = CollectionKeyManager::new();

        keys.set_contents(Some(&payload), None).unwrap();
        assert!(keys.last_modified() > 1_000_000_000.0);

        keys.set_contents(Some(&payload), Some(0.0)).unwrap();
        assert!(keys.last_modified() > 1_000_000_000.0, "zero counts as absent");
    }

    #[test]
    fn test_change_detection() {
        let default = BulkKeyBundle::random("[default]");
        let k1 = BulkKeyBundle::random("a");
        let k2 = BulkKeyBundle::random("b");
        let k3 = BulkKeyBundle::random("b");

        let mut keys = CollectionKeyManager::new();
        keys.set_contents(Some(&keyset(&default, &[("a", &k1), ("b", &k2)])), Some(1.0)).unwrap();

        // rotated collection
        let update = keys
            .set_contents(Some(&keyset(&default, &[("a", &k1), ("b", &k3)])), Some(2.0))
            .unwrap();
        assert_eq!(update, KeysUpdate::CollectionsChanged(vec!["b".into()]));
        assert!(keys.key_for_collection("b").unwrap().equals(&k3));

        // removed collection
        let update = keys.set_contents(Some(&keyset(&default, &[("a", &k1)])), Some(3.0)).unwrap();
        assert_eq!(update, KeysUpdate::CollectionsChanged(vec!["b".into()]));
        assert!(keys.key_for_collection("b").unwrap().equals(&default));

        // added collections are reported sorted
        let update = keys
            .set_contents(
                Some(&keyset(&default, &[("z", &k2), ("a", &k1), ("c", &k3)])),
                Some(4.0),
            )
            .unwrap();
        assert_eq!(update, KeysUpdate::CollectionsChanged(vec!["c".into(), "z".into()]));

        // new default
        let update = keys
            .set_contents(Some(&keyset(&BulkKeyBundle::random("d"), &[("a", &k1)])), Some(5.0))
            .unwrap();
        assert_eq!(update, KeysUpdate::DefaultChanged);
        assert_eq!(keys.last_modified(), 5.0);
    }

    #[test]
    fn test_missing_payload_and_default_leave_state() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs"]);
        let before = keys.default_bundle().unwrap().clone();
        let stamp = keys.last_modified();

        assert!(matches!(keys.set_contents(None, Some(1.0)), Err(CryptoError::MissingPayload)));

        let mut no_default = keyset(&BulkKeyBundle::random("d"), &[]);
        no_default.remove("default");
        assert!(matches!(keys.set_contents(Some(&no_default), None), Err(CryptoError::MissingDefaultKey)));

        no_default.insert("default".into(), Value::Null);
        assert!(matches!(keys.set_contents(Some(&no_default), None), Err(CryptoError::MissingDefaultKey)));

        assert!(keys.default_bundle().unwrap().equals(&before));
        assert_eq!(keys.collections().collect::<Vec<_>>(), vec!["tabs"]);
        assert_eq!(keys.last_modified(), stamp);
    }

    #[test]
    fn test_malformed_collection_leaves_state() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs"]);
        let before = keys.default_bundle().unwrap().clone();

        let mut payload = keyset(&BulkKeyBundle::random("d"), &[]);
        payload.insert("collections".into(), json!({"tabs": ["only-one"]}));

        assert!(matches!(
            keys.set_contents(Some(&payload), None),
            Err(CryptoError::InvalidKeyPair(_))
        ));
        assert!(keys.default_bundle().unwrap().equals(&before));
    }

    #[test]
    fn test_falsy_collection_entries_skipped() {
        let default = BulkKeyBundle::random("[default]");
        let mut payload = keyset(&default, &[]);
        payload.insert("collections".into(), json!({"tabs": null, "forms": "", "prefs": false}));

        let mut keys = CollectionKeyManager::new();
        keys.set_contents(Some(&payload), Some(1.0)).unwrap();

        assert_eq!(keys.collections().count(), 0);
    }

    #[test]
    fn test_compare_collections() {
        let k1 = BulkKeyBundle::random("a");
        let k2 = BulkKeyBundle::random("b");
        let k1_copy = BulkKeyBundle::from_key_pair("a", &k1.key_pair().unwrap()).unwrap();

        let left: BTreeMap<_, _> = [("a".to_string(), k1.clone()), ("b".to_string(), k2)].into();
        let right: BTreeMap<_, _> = [("a".to_string(), k1_copy)].into();

        let cmp = compare_key_bundle_collections(&left, &right);
        assert!(!cmp.same);
        assert_eq!(cmp.changed, vec!["b".to_string()]);
        assert_eq!(compare_key_bundle_collections(&right, &left), cmp);
        assert!(compare_key_bundle_collections(&right, &right).same);
        assert!(compare_key_bundle_collections(&BTreeMap::new(), &BTreeMap::new()).same);
    }

    #[test]
    fn test_as_wbo_shape() {
        let mut keys = CollectionKeyManager::new();
        keys.generate_new_keys(&["tabs"]);

        let record = keys.as_wbo(None, None);
        assert_eq!(record.collection(), "crypto");
        assert_eq!(record.id(), "keys");
        assert_eq!(record.modified, Some(keys.last_modified()));

        let cleartext = record.cleartext().unwrap();
        assert_eq!(cleartext.get("id"), Some(&json!("keys")));
        assert_eq!(cleartext.get("collection"), Some(&json!("crypto")));
        assert_eq!(cleartext["default"].as_array().unwrap().len(), 2);
        assert!(cleartext["collections"].get("tabs").is_some());

        let custom = keys.as_wbo(Some("meta"), Some("global"));
        assert_eq!(custom.collection(), "meta");
        assert_eq!(custom.cleartext().unwrap().get("id"), Some(&json!("global")));
    }

    #[test]
    fn test_as_wbo_when_clear() {
        let record = CollectionKeyManager::new().as_wbo(None, None);
        assert_eq!(record.cleartext().unwrap().get("default"), Some(&Value::Null));

        let mut keys = CollectionKeyManager::new();
        assert!(matches!(
            keys.set_contents(record.cleartext(), None),
            Err(CryptoError::MissingDefaultKey)
        ));
    }

    #[test]
    fn test_update_contents_roundtrip() {
        let sync = sync_bundle();
        let mut local = CollectionKeyManager::new();
        local.generate_new_keys(&["tabs"]);

        let mut record = local.as_wbo(None, None);
        record.encrypt(&sync).unwrap();
        record.modified = Some(1234.5);

        let mut remote = CollectionKeyManager::new();
        let update = remote.update_contents(&sync, &mut record.clone()).unwrap();

        assert_eq!(update, KeysUpdate::DefaultChanged);
        assert_eq!(remote.last_modified(), 1234.5);
        assert!(remote.default_bundle().unwrap().equals(local.default_bundle().unwrap()));
        assert!(remote
            .key_for_collection("tabs")
            .unwrap()
            .equals(local.key_for_collection("tabs").unwrap()));

        assert_eq!(remote.update_contents(&sync, &mut record).unwrap(), KeysUpdate::UpToDate);
    }

    #[test]
    fn test_update_contents_wrong_sync_key() {
        let mut local = CollectionKeyManager::new();
        local.generate_new_keys::<&str>(&[]);
        let mut record = local.as_wbo(None, None);
        record.encrypt(&sync_bundle()).unwrap();

        let other = SyncKeyBundle::new("johndoe@example.com", SecretString::from(encode_key_base32(&[8u8; 16]))).unwrap();
        let mut remote = CollectionKeyManager::new();
        let err = remote.update_contents(&other, &mut record).unwrap_err();

        assert!(matches!(err, CryptoError::HmacMismatch { .. }));
        assert!(remote.is_clear());
    }

    #[test]
    fn test_falsy() {
        assert!(is_falsy(&json!(null)));
        assert!(is_falsy(&json!(false)));
        assert!(is_falsy(&json!(0)));
        assert!(is_falsy(&json!("")));
        assert!(!is_falsy(&json!([])));
        assert!(!is_falsy(&json!({})));
        assert!(!is_falsy(&json!("x")));
    }
}
