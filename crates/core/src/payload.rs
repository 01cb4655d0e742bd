use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Opaque JSON text carried by a delta.
///
/// The engine only checks that the text is well-formed JSON. It never
/// reinterprets or re-serializes it, so the exact bytes a device pushed are the
/// bytes other devices pull.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaPayload(String);

impl DeltaPayload {
    /// Wrap text without checking it. Use [`DeltaPayload::parse`] for input
    /// that has not been validated yet.
    pub fn from_raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Wrap text, failing unless it is well-formed JSON.
    pub fn parse(text: impl Into<String>) -> Result<Self, CoreError> {
        let payload = Self(text.into());
        payload.validate()?;
        Ok(payload)
    }

    /// Serialize a value as the payload.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, CoreError> {
        serde_json::to_string(value)
            .map(Self)
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn null() -> Self {
        Self("null".into())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        serde_json::from_str::<IgnoredAny>(&self.0)
            .map(|_| ())
            .map_err(|e| CoreError::InvalidData(format!("payload is not well-formed JSON: {e}")))
    }

    pub fn is_well_formed(&self) -> bool {
        self.validate().is_ok()
    }

    /// Decode into a concrete shape. Only callers that own the payload's
    /// schema (direct-write handlers, tests) do this.
    pub fn to_value<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CoreError> {
        serde_json::from_str(&self.0).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DeltaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() > 64 {
            let head: String = self.0.chars().take(64).collect();
            write!(f, "DeltaPayload({head}... {} bytes)", self.0.len())
        } else {
            write!(f, "DeltaPayload({})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_json_and_keeps_text_verbatim() {
        let text = r#"{ "b": 1,  "a": [true, null] }"#;
        let payload = DeltaPayload::parse(text).unwrap();
        assert_eq!(payload.as_str(), text);
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(DeltaPayload::parse("{not json").is_err());
        assert!(DeltaPayload::parse("").is_err());
        assert!(!DeltaPayload::from_raw("[1,").is_well_formed());
    }

    #[test]
    fn value_roundtrip() {
        let payload = DeltaPayload::from_value(&json!({"status": "installed"})).unwrap();
        let value: serde_json::Value = payload.to_value().unwrap();
        assert_eq!(value["status"], "installed");
        assert!(DeltaPayload::null().is_well_formed());
    }
}
