use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tuyau_core::ResumeToken;

/// A change notification exactly as the feed delivered it.
///
/// No field is trusted until [`normalize`](crate::normalize) has checked it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawNotification(JsonValue);

impl RawNotification {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_json(self) -> JsonValue {
        self.0
    }

    /// Best-effort read of the position token.
    ///
    /// Accepts `_id` as a plain string or as `{"_data": "..."}`, and `id` as an
    /// alias. Returns `None` when no usable token is present; the normalizer
    /// reports the precise defect.
    pub fn position(&self) -> Option<ResumeToken> {
        let obj = self.0.as_object()?;
        let id = obj.get("_id").or_else(|| obj.get("id"))?;
        let raw = match id {
            JsonValue::String(s) => s.as_str(),
            JsonValue::Object(inner) => inner.get("_data")?.as_str()?,
            _ => return None,
        };
        ResumeToken::new(raw).ok()
    }
}

impl From<JsonValue> for RawNotification {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn position_reads_nested_data_token() {
        let raw = RawNotification::new(json!({"_id": {"_data": "8263"}}));
        assert_eq!(raw.position().unwrap().as_str(), "8263");
    }

    #[test]
    fn position_accepts_plain_id_alias() {
        let raw = RawNotification::new(json!({"id": "1"}));
        assert_eq!(raw.position().unwrap().as_str(), "1");
    }

    #[test]
    fn position_is_none_for_non_objects() {
        assert!(RawNotification::new(json!("garbage")).position().is_none());
        assert!(RawNotification::new(json!({"_id": 7})).position().is_none());
    }
}
