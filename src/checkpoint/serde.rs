//! Type-tagged serialization for stored channel values and writes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// A stored value with its encoding tag. JSON covers every engine value;
/// the bytes form carries payloads that are not valid JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "value", rename_all = "lowercase")]
pub enum TaggedValue {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl TaggedValue {
    pub fn json(value: serde_json::Value) -> Self {
        TaggedValue::Json(value)
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> EngineResult<Self> {
        Ok(TaggedValue::Json(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> EngineResult<T> {
        match self {
            TaggedValue::Json(value) => Ok(serde_json::from_value(value.clone())?),
            TaggedValue::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Storage tag, matching the serde representation.
    pub fn tag(&self) -> &'static str {
        match self {
            TaggedValue::Json(_) => "json",
            TaggedValue::Bytes(_) => "bytes",
        }
    }

    /// Raw payload for storage alongside [`Self::tag`].
    pub fn payload(&self) -> EngineResult<Vec<u8>> {
        match self {
            TaggedValue::Json(value) => Ok(serde_json::to_vec(value)?),
            TaggedValue::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// Rebuilds a value from its stored tag and payload.
    pub fn from_parts(tag: &str, payload: Vec<u8>) -> EngineResult<Self> {
        match tag {
            "json" => Ok(TaggedValue::Json(serde_json::from_slice(&payload)?)),
            "bytes" => Ok(TaggedValue::Bytes(payload)),
            other => Err(EngineError::Store(format!(
                "unknown serialization tag: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaggedValue;

    #[test]
    fn json_round_trip_through_parts() {
        let value = TaggedValue::json(serde_json::json!({"plan": ["a", "b"]}));
        let rebuilt = TaggedValue::from_parts(value.tag(), value.payload().unwrap()).unwrap();
        assert_eq!(rebuilt, value);
    }

    #[test]
    fn bytes_round_trip_through_parts() {
        let value = TaggedValue::Bytes(vec![0, 159, 146, 150]);
        let rebuilt = TaggedValue::from_parts(value.tag(), value.payload().unwrap()).unwrap();
        assert_eq!(rebuilt, value);
    }

    #[test]
    fn decode_recovers_typed_values() {
        let value = TaggedValue::from_serialize(&vec!["x".to_string()]).unwrap();
        let decoded: Vec<String> = value.decode().unwrap();
        assert_eq!(decoded, vec!["x".to_string()]);
    }

    #[test]
    fn unknown_tag_is_a_store_error() {
        assert!(TaggedValue::from_parts("pickle", vec![]).is_err());
    }
}
