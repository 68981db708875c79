//! Validation of inbound readings.
//!
//! Two encodings describe the same operation: a structured object with `t`
//! and `h` fields, and a compact `"<t>,<h>"` text body. Both must yield two
//! finite numbers before anything is stored.

use serde_json::{Map, Value};

use crate::reading::Sample;

/// Why an inbound reading was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedInput {
    #[error("expected JSON {{t:number, h:number}}")]
    ExpectedFields,

    #[error("expected 't,h' in body")]
    ExpectedPair,

    #[error("t,h must be finite numbers")]
    NotFinite,
}

/// Validates a structured payload.
///
/// Both `t` and `h` must be JSON numbers; strings, nulls and missing fields are rejected.
pub fn parse_fields(fields: &Map<String, Value>) -> Result<Sample, MalformedInput> {
    let number = |name: &str| fields.get(name).and_then(Value::as_f64);
    match (number("t"), number("h")) {
        (Some(t), Some(h)) => Sample::new(t, h).ok_or(MalformedInput::NotFinite),
        _ => Err(MalformedInput::ExpectedFields),
    }
}

/// Validates a compact `"<t>,<h>"` payload. Surrounding whitespace is ignored.
pub fn parse_compact(text: &str) -> Result<Sample, MalformedInput> {
    let parts: Vec<&str> = text.trim().split(',').collect();
    let [t, h] = parts.as_slice() else {
        return Err(MalformedInput::ExpectedPair);
    };
    let t = parse_number(t).ok_or(MalformedInput::NotFinite)?;
    let h = parse_number(h).ok_or(MalformedInput::NotFinite)?;
    Sample::new(t, h).ok_or(MalformedInput::NotFinite)
}

/// Parses one textual number. Empty text is not a number.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}
