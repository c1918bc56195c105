//! Wire envelope codec.
//!
//! Every message on a user channel is a single-line JSON object with exactly
//! two fields, in this order:
//!
//! ```text
//! {"event":"<name>","payload":[<value>, ...]}
//! ```
//!
//! System channel messages are plain text and never pass through here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// A decoded `{event, payload}` unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name (non-empty)
    pub event: String,
    /// Positional arguments
    pub payload: Vec<Value>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Encode as wire text.
    pub fn encode(&self) -> Result<String, CodecError> {
        if self.event.is_empty() {
            return Err(CodecError::EmptyEventName);
        }
        serde_json::to_string(self).map_err(CodecError::SerializationFailure)
    }
}

/// Build an envelope from an event name and payload values and encode it.
pub fn serialize<I, T>(event: &str, payload: I) -> Result<String, CodecError>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    if event.is_empty() {
        return Err(CodecError::EmptyEventName);
    }

    let payload = payload
        .into_iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(CodecError::SerializationFailure)?;

    Envelope::new(event, payload).encode()
}

/// Like [`serialize`], for callers whose event name is itself a dynamic value.
///
/// Anything other than a non-empty JSON string is rejected with
/// [`CodecError::EmptyEventName`].
pub fn serialize_value<I, T>(event: &Value, payload: I) -> Result<String, CodecError>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    match event {
        Value::String(name) => serialize(name, payload),
        _ => Err(CodecError::EmptyEventName),
    }
}

/// Decode wire text into an envelope.
///
/// Unknown extra fields are ignored.
pub fn deserialize(text: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(CodecError::ParseFailure)?;

    let Value::Object(mut fields) = value else {
        return Err(CodecError::NotAnObject);
    };

    let (Some(event), Some(payload)) = (fields.remove("event"), fields.remove("payload")) else {
        return Err(CodecError::MissingFields);
    };

    let Value::String(event) = event else {
        return Err(CodecError::EventNotString);
    };
    let Value::Array(payload) = payload else {
        return Err(CodecError::PayloadNotArray);
    };

    Ok(Envelope { event, payload })
}

/// Decode raw bytes received across the boundary.
pub fn deserialize_bytes(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(CodecError::NotAString)?;
    deserialize(text)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            any::<String>().prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn envelope_survives_the_wire(
            event in "[a-zA-Z_:.-]{1,16}",
            payload in prop::collection::vec(json_value(), 0..6)
        ) {
            let text = serialize(&event, payload.clone()).unwrap();
            prop_assert!(!text.contains('\n'));
            prop_assert!(text.starts_with(r#"{"event":"#), "text does not start with event key: {}", text);

            let envelope = deserialize(&text).unwrap();
            prop_assert_eq!(envelope, Envelope::new(event, payload));
        }
    }
}
