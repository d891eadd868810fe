//! Base records as a sync server returns them.

use ksync_core::{InfoCollections, Wbo};

#[test]
fn server_record_parses() {
    let body = r#"{"id":"keys","collection":"crypto","modified":1330000000.12,"payload":"{\"ciphertext\":\"abc\",\"IV\":\"def\",\"hmac\":\"00\"}"}"#;
    let wbo = Wbo::from_json(body).unwrap();

    assert_eq!(wbo.id, "keys");
    assert_eq!(wbo.collection.as_deref(), Some("crypto"));
    assert_eq!(wbo.modified, Some(1330000000.12));
    assert!(wbo.sortindex.is_none());

    let envelope: serde_json::Value = serde_json::from_str(&wbo.payload).unwrap();
    assert_eq!(envelope["IV"], "def");
}

#[test]
fn record_without_payload_defaults_to_empty() {
    let wbo = Wbo::from_json(r#"{"id":"x"}"#).unwrap();
    assert_eq!(wbo.payload, "");
    assert!(wbo.collection.is_none());
}

#[test]
fn absent_fields_are_not_serialized() {
    let json = Wbo::new("tabs", "t1").to_json().unwrap();
    assert!(!json.contains("sortindex"));
    assert!(!json.contains("modified"));
}

#[test]
fn info_collections_parses() {
    let info: InfoCollections = serde_json::from_str(r#"{"crypto": 1330000000.12, "tabs": 1330000001}"#).unwrap();
    assert_eq!(info["crypto"], 1330000000.12);
    assert_eq!(info["tabs"], 1330000001.0);
}
