//! Raw notification → [`ChangeEvent`] mapping.
//!
//! Normalization is a pure function: no I/O, no clock reads (the observation
//! time is passed in), no retries. Malformed input is a data-quality defect and
//! is returned to the caller as [`MalformedNotification`]; it is never dropped
//! here.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use tuyau_core::{
    ChangeEvent, DocumentKey, MalformedNotification, Namespace, OperationType, ResumeToken,
};

use crate::notification::RawNotification;

type Fields = Map<String, JsonValue>;

/// Normalize one raw change notification.
///
/// Required: `_id` (or `id`), `operationType`, `ns` (or `namespace`) and
/// `documentKey`. `clusterTime` (falling back to `wallTime`) and
/// `fullDocument` are optional, but when present they must be well formed.
pub fn normalize(
    raw: &RawNotification,
    observed_at: DateTime<Utc>,
) -> Result<ChangeEvent, MalformedNotification> {
    let fields = raw
        .as_json()
        .as_object()
        .ok_or_else(|| MalformedNotification::wrong_shape("notification", "a JSON object"))?;

    let id = read_id(fields)?;
    let tag = |e: MalformedNotification| e.at(id.clone());

    let operation_type = read_operation_type(fields).map_err(tag)?;
    let namespace = read_namespace(fields).map_err(tag)?;
    let document_key = read_document_key(fields).map_err(tag)?;
    let source_timestamp = read_source_timestamp(fields).map_err(tag)?;
    let full_document = match fields.get("fullDocument") {
        None | Some(JsonValue::Null) => None,
        Some(doc) => Some(doc.clone()),
    };

    Ok(
        ChangeEvent::new(id, operation_type, namespace, document_key, observed_at)
            .with_source_timestamp(source_timestamp)
            .with_full_document(full_document),
    )
}

fn read_id(fields: &Fields) -> Result<ResumeToken, MalformedNotification> {
    let value = fields
        .get("_id")
        .or_else(|| fields.get("id"))
        .ok_or_else(|| MalformedNotification::missing("_id"))?;

    let raw = match value {
        JsonValue::String(s) => s.as_str(),
        JsonValue::Object(inner) => inner
            .get("_data")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| MalformedNotification::wrong_shape("_id", "{\"_data\": string}"))?,
        _ => return Err(MalformedNotification::wrong_shape("_id", "a string token")),
    };

    ResumeToken::new(raw).map_err(|_| MalformedNotification::wrong_shape("_id", "a non-empty token"))
}

fn read_operation_type(fields: &Fields) -> Result<OperationType, MalformedNotification> {
    match fields.get("operationType") {
        None | Some(JsonValue::Null) => Err(MalformedNotification::missing("operationType")),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(OperationType::from(s.clone())),
        Some(_) => Err(MalformedNotification::wrong_shape(
            "operationType",
            "a non-empty string",
        )),
    }
}

fn read_namespace(fields: &Fields) -> Result<Namespace, MalformedNotification> {
    let ns = match fields.get("ns").or_else(|| fields.get("namespace")) {
        None | Some(JsonValue::Null) => return Err(MalformedNotification::missing("ns")),
        Some(JsonValue::Object(ns)) => ns,
        Some(_) => return Err(MalformedNotification::wrong_shape("ns", "an object")),
    };

    let database = match ns.get("db").or_else(|| ns.get("database")) {
        Some(JsonValue::String(db)) if !db.is_empty() => db.clone(),
        None => return Err(MalformedNotification::missing("ns.db")),
        Some(_) => return Err(MalformedNotification::wrong_shape("ns.db", "a non-empty string")),
    };

    let collection = match ns.get("coll").or_else(|| ns.get("collection")) {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(coll)) => Some(coll.clone()),
        Some(_) => return Err(MalformedNotification::wrong_shape("ns.coll", "a string")),
    };

    Ok(Namespace::new(database, collection))
}

fn read_document_key(fields: &Fields) -> Result<DocumentKey, MalformedNotification> {
    match fields.get("documentKey") {
        None | Some(JsonValue::Null) => Err(MalformedNotification::missing("documentKey")),
        Some(JsonValue::Object(key)) if !key.is_empty() => Ok(DocumentKey::new(key.clone())),
        Some(_) => Err(MalformedNotification::wrong_shape(
            "documentKey",
            "a non-empty object",
        )),
    }
}

fn read_source_timestamp(fields: &Fields) -> Result<Option<DateTime<Utc>>, MalformedNotification> {
    if let Some(at) = parse_timestamp("clusterTime", fields.get("clusterTime"))? {
        return Ok(Some(at));
    }
    parse_timestamp("wallTime", fields.get("wallTime"))
}

/// Accepts the shapes change feeds use for time:
/// `{"$timestamp": {"t": secs, "i": inc}}`, `{"$date": ...}`, RFC 3339
/// strings and integer epoch milliseconds.
fn parse_timestamp(
    field: &'static str,
    value: Option<&JsonValue>,
) -> Result<Option<DateTime<Utc>>, MalformedNotification> {
    let wrong = || MalformedNotification::wrong_shape(field, "a timestamp");

    let value = match value {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(v) => v,
    };

    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|_| wrong()),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(wrong),
        JsonValue::Object(obj) => {
            if let Some(ts) = obj.get("$timestamp") {
                let secs = ts.get("t").and_then(JsonValue::as_i64).ok_or_else(wrong)?;
                return DateTime::from_timestamp(secs, 0).map(Some).ok_or_else(wrong);
            }
            if let Some(date) = obj.get("$date") {
                return match date {
                    JsonValue::Object(long) => long
                        .get("$numberLong")
                        .and_then(JsonValue::as_str)
                        .and_then(|s| s.parse::<i64>().ok())
                        .and_then(DateTime::from_timestamp_millis)
                        .map(Some)
                        .ok_or_else(wrong),
                    other => parse_timestamp(field, Some(other)),
                };
            }
            Err(wrong())
        }
        _ => Err(wrong()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn observed() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn insert_notification() -> JsonValue {
        json!({
            "_id": {"_data": "1"},
            "operationType": "insert",
            "clusterTime": {"$timestamp": {"t": 1_699_999_999, "i": 1}},
            "ns": {"db": "shop", "coll": "orders"},
            "documentKey": {"id": "x"},
            "fullDocument": {"a": 1}
        })
    }

    #[test]
    fn insert_is_normalized_with_full_document() {
        let raw = RawNotification::new(insert_notification());
        let event = normalize(&raw, observed()).unwrap();

        assert_eq!(event.id().as_str(), "1");
        assert_eq!(event.operation_type(), &OperationType::Insert);
        assert_eq!(event.full_document(), Some(&json!({"a": 1})));
        assert_eq!(event.namespace(), &Namespace::new("shop", Some("orders".into())));
        assert_eq!(event.document_key().get("id"), Some(&json!("x")));
        assert_eq!(
            event.source_timestamp(),
            DateTime::from_timestamp(1_699_999_999, 0)
        );
        assert_eq!(event.observed_timestamp(), observed());
    }

    #[test]
    fn missing_document_key_is_malformed() {
        let mut value = insert_notification();
        value.as_object_mut().unwrap().remove("documentKey");

        let err = normalize(&RawNotification::new(value), observed()).unwrap_err();
        assert_eq!(err.field(), "documentKey");
        assert_eq!(err.position().map(|p| p.as_str()), Some("1"));
    }

    #[test]
    fn missing_id_is_malformed_without_position() {
        let mut value = insert_notification();
        value.as_object_mut().unwrap().remove("_id");

        let err = normalize(&RawNotification::new(value), observed()).unwrap_err();
        assert_eq!(err.field(), "_id");
        assert!(err.position().is_none());
    }

    #[test]
    fn delete_has_no_full_document() {
        let raw = RawNotification::new(json!({
            "_id": "2",
            "operationType": "delete",
            "ns": {"db": "shop", "coll": "orders"},
            "documentKey": {"_id": {"$oid": "65a1"}},
            "fullDocument": null
        }));

        let event = normalize(&raw, observed()).unwrap();
        assert_eq!(event.operation_type(), &OperationType::Delete);
        assert!(event.full_document().is_none());
        assert!(event.source_timestamp().is_none());
    }

    #[test]
    fn wall_time_is_used_when_cluster_time_is_absent() {
        let mut value = insert_notification();
        let obj = value.as_object_mut().unwrap();
        obj.remove("clusterTime");
        obj.insert("wallTime".into(), json!({"$date": "2024-01-02T03:04:05Z"}));

        let event = normalize(&RawNotification::new(value), observed()).unwrap();
        assert_eq!(
            event.source_timestamp().unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn badly_shaped_optional_timestamp_is_malformed() {
        let mut value = insert_notification();
        value["clusterTime"] = json!(true);

        let err = normalize(&RawNotification::new(value), observed()).unwrap_err();
        assert_eq!(err.field(), "clusterTime");
    }

    #[test]
    fn database_level_events_have_no_collection() {
        let raw = RawNotification::new(json!({
            "_id": "3",
            "operationType": "dropDatabase",
            "ns": {"db": "shop"},
            "documentKey": {"db": "shop"}
        }));

        let event = normalize(&raw, observed()).unwrap();
        assert_eq!(event.operation_type(), &OperationType::DropDatabase);
        assert_eq!(event.namespace().collection, None);
    }

    #[test]
    fn non_object_notification_is_malformed() {
        let err = normalize(&RawNotification::new(json!("{not json")), observed()).unwrap_err();
        assert_eq!(err.field(), "notification");
    }

    fn required_field() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("_id"),
            Just("operationType"),
            Just("ns"),
            Just("documentKey"),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: dropping or corrupting any required field yields the same
        /// error every time, and the input is left untouched.
        #[test]
        fn malformed_input_is_rejected_identically(
            field in required_field(),
            corrupt in any::<bool>(),
            junk in any::<i64>(),
        ) {
            let mut value = insert_notification();
            if corrupt {
                value[field] = json!(junk);
            } else {
                value.as_object_mut().unwrap().remove(field);
            }
            let raw = RawNotification::new(value);
            let before = raw.clone();

            let first = normalize(&raw, observed()).unwrap_err();
            let second = normalize(&raw, observed()).unwrap_err();

            prop_assert_eq!(first, second);
            prop_assert_eq!(raw, before);
        }
    }
}
