//! Wire payload of a published change event.
//!
//! One self-describing JSON object per event with camelCase field names:
//! `id`, `operationType`, `sourceTimestamp`, `observedTimestamp`,
//! `fullDocument`, `namespace` and `documentKey`. No schema registry; readers
//! must ignore fields they do not know.

use thiserror::Error;

use tuyau_core::ChangeEvent;

use crate::session::BusRecord;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Turns a change event into a bus record.
pub trait EventCodec: Send + Sync {
    fn encode(&self, event: &ChangeEvent) -> Result<BusRecord, WireError>;
}

/// JSON codec. The record key is the serialized document key.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode(&self, event: &ChangeEvent) -> Result<BusRecord, WireError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| WireError::Serialization(e.to_string()))?;
        let key = serde_json::to_vec(event.document_key())
            .map_err(|e| WireError::Serialization(e.to_string()))?;

        Ok(BusRecord {
            key: Some(key),
            payload,
        })
    }
}

/// Decode a payload produced by [`JsonCodec`].
pub fn decode(payload: &[u8]) -> Result<ChangeEvent, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::{json, Value as JsonValue};
    use tuyau_core::{DocumentKey, Namespace, OperationType, ResumeToken};

    fn event() -> ChangeEvent {
        let key = json!({"id": "x"}).as_object().cloned().unwrap();
        ChangeEvent::new(
            ResumeToken::new("1").unwrap(),
            OperationType::Insert,
            Namespace::new("shop", Some("orders".into())),
            DocumentKey::new(key),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
        .with_full_document(Some(json!({"a": 1})))
    }

    #[test]
    fn payload_uses_camel_case_field_names() {
        let record = JsonCodec.encode(&event()).unwrap();
        let value: JsonValue = serde_json::from_slice(&record.payload).unwrap();

        assert_eq!(value["id"], json!("1"));
        assert_eq!(value["operationType"], json!("insert"));
        assert_eq!(value["namespace"], json!({"database": "shop", "collection": "orders"}));
        assert_eq!(value["documentKey"], json!({"id": "x"}));
        assert_eq!(value["fullDocument"], json!({"a": 1}));
        assert_eq!(value["sourceTimestamp"], JsonValue::Null);
        assert!(value["observedTimestamp"].is_string());
    }

    #[test]
    fn key_is_the_document_key() {
        let record = JsonCodec.encode(&event()).unwrap();
        assert_eq!(record.key.unwrap(), br#"{"id":"x"}"#.to_vec());
    }

    #[test]
    fn decoding_tolerates_additional_fields() {
        let record = JsonCodec.encode(&event()).unwrap();
        let mut value: JsonValue = serde_json::from_slice(&record.payload).unwrap();
        value["schemaHint"] = json!("v2");

        let decoded = decode(&serde_json::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded, event());
    }
}
