use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{KsyncError, KsyncResult};

/// Server-side last-modified times per collection (seconds, 2-decimal resolution),
/// as returned by the `info/collections` endpoint.
pub type InfoCollections = BTreeMap<String, f64>;

/// A weave basic object: the generic synchronizable record as it travels on the wire.
///
/// `payload` is an opaque JSON string; encrypted records put their
/// `{ciphertext, IV, hmac}` envelope there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wbo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default)]
    pub payload: String,
}

impl Wbo {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: Some(collection.into()),
            sortindex: None,
            modified: None,
            payload: String::new(),
        }
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> KsyncResult<String> {
        serde_json::to_string(self).map_err(|e| KsyncError::Record(format!("wbo serialization: {e}")))
    }

    /// Deserialize from the JSON wire form
    pub fn from_json(data: &str) -> KsyncResult<Self> {
        serde_json::from_str(data)
            .map_err(|e| KsyncError::Record(format!("wbo deserialization: {e}")))
    }
}
