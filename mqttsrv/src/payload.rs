//! Publish payload normalization.
//!
//! Scripts may pass a payload as nothing, a string, a byte buffer or a list
//! of integers. [`PayloadInput`] is that closed set; [`normalize`] turns any
//! of them into the bytes that go on the wire.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::script::ScriptValue;

/// Payload as supplied by a script.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PayloadInput {
    /// No payload; publishes an empty message.
    #[default]
    Absent,
    /// Text, sent as UTF-8.
    Text(String),
    /// Raw bytes, sent unchanged.
    Bytes(Vec<u8>),
    /// Integers, one byte each.
    IntSeq(Vec<i64>),
}

impl TryFrom<ScriptValue> for PayloadInput {
    type Error = Error;

    /// Classify a script value.
    ///
    /// Strings are matched before lists so a string never turns into a byte
    /// list. A list qualifies only if every element is an integer; anything
    /// else fails with [`Error::UnsupportedPayloadType`].
    fn try_from(value: ScriptValue) -> Result<Self> {
        match value {
            ScriptValue::Nil => Ok(PayloadInput::Absent),
            ScriptValue::String(s) => Ok(PayloadInput::Text(s)),
            ScriptValue::Buffer(b) => Ok(PayloadInput::Bytes(b)),
            ScriptValue::Array(items) => {
                let mut ints = Vec::with_capacity(items.len());
                for item in &items {
                    match item.as_integer() {
                        Some(i) => ints.push(i),
                        None => {
                            return Err(Error::UnsupportedPayloadType(format!(
                                "table containing {}",
                                item.type_name()
                            )));
                        }
                    }
                }
                Ok(PayloadInput::IntSeq(ints))
            }
            other => Err(Error::UnsupportedPayloadType(other.type_name().to_string())),
        }
    }
}

/// Convert a payload into its wire bytes.
///
/// Integers outside `0..=255` wrap modulo 256, the same as a narrowing
/// integer cast: `256` becomes `0` and `-1` becomes `255`.
pub fn normalize(input: &PayloadInput) -> Bytes {
    match input {
        PayloadInput::Absent => Bytes::new(),
        PayloadInput::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        PayloadInput::Bytes(b) => Bytes::copy_from_slice(b),
        PayloadInput::IntSeq(ints) => ints.iter().map(|&i| i as u8).collect(),
    }
}

/// Classify and normalize a script value in one step.
pub fn normalize_value(value: ScriptValue) -> Result<Bytes> {
    let input = PayloadInput::try_from(value)?;
    Ok(normalize(&input))
}
