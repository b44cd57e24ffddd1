//! Completion envelope codec.
//!
//! Render workers report a finished job by publishing a JSON object on the
//! results queue. Two producer generations are in circulation:
//!
//! - the flat shape `{"job": "..", "filename": "..", "content": ..}`, where
//!   `content` is a string or an array of byte values;
//! - the structured shape `{"job": "..", "filename": "..", "payload": {"data": [..]}}`,
//!   which is how Node serializes a `Buffer`. The oldest renderer sends
//!   `payload` as a bare string.
//!
//! [`decode_envelope`] turns raw message bytes into a [`CompletionEnvelope`]
//! or a classified [`EnvelopeError`]. It has no side effects.
//!
//! Some producers send integer job identifiers; `{"job": 42}` is read as the
//! job `"42"`.

use serde_json::{Map, Value};

/// Key carrying the job identifier.
pub const FIELD_JOB: &str = "job";

/// Key carrying the suggested artifact file name.
pub const FIELD_FILENAME: &str = "filename";

/// Key carrying the artifact bytes in the flat shape.
pub const FIELD_CONTENT: &str = "content";

/// Key carrying the artifact bytes in the structured shape.
pub const FIELD_PAYLOAD: &str = "payload";

/// Nested key inside `payload` holding the byte array.
pub const FIELD_PAYLOAD_DATA: &str = "payload.data";

/// A validated completion message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEnvelope {
    pub job_id: String,
    pub filename: String,
    pub payload: Vec<u8>,
}

/// Why a message could not be turned into a [`CompletionEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The bytes are not a JSON object.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// A required field is absent, null, empty or of the wrong type.
    #[error("Incomplete envelope: missing or unusable field '{missing}'")]
    Incomplete { missing: &'static str },
}

/// Decode and validate a raw completion message.
///
/// Validation order: the bytes must parse as a JSON object (else
/// [`EnvelopeError::Malformed`]), then `job`, `filename` and the content
/// must be present (else [`EnvelopeError::Incomplete`] naming the first
/// missing field). When both `content` and `payload` are present, `content`
/// wins.
pub fn decode_envelope(bytes: &[u8]) -> Result<CompletionEnvelope, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| EnvelopeError::Malformed("envelope is not a JSON object".into()))?;

    let job_id = require_job_id(obj)?;
    let filename = require_text(obj, FIELD_FILENAME)?;
    let payload = extract_content(obj)?;

    Ok(CompletionEnvelope {
        job_id,
        filename,
        payload,
    })
}

/// Require a non-blank string or an integer job identifier.
fn require_job_id(obj: &Map<String, Value>) -> Result<String, EnvelopeError> {
    match obj.get(FIELD_JOB) {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        _ => require_text(obj, FIELD_JOB),
    }
}

/// Require a non-empty string field.
fn require_text(obj: &Map<String, Value>, field: &'static str) -> Result<String, EnvelopeError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(EnvelopeError::Incomplete { missing: field }),
    }
}

fn extract_content(obj: &Map<String, Value>) -> Result<Vec<u8>, EnvelopeError> {
    if let Some(content) = obj.get(FIELD_CONTENT) {
        return match content {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Array(items) => byte_array(items).ok_or(EnvelopeError::Incomplete {
                missing: FIELD_CONTENT,
            }),
            _ => Err(EnvelopeError::Incomplete {
                missing: FIELD_CONTENT,
            }),
        };
    }

    match obj.get(FIELD_PAYLOAD) {
        Some(Value::Object(payload)) => match payload.get("data") {
            Some(Value::Array(items)) => byte_array(items).ok_or(EnvelopeError::Incomplete {
                missing: FIELD_PAYLOAD_DATA,
            }),
            _ => Err(EnvelopeError::Incomplete {
                missing: FIELD_PAYLOAD_DATA,
            }),
        },
        Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
        Some(_) => Err(EnvelopeError::Incomplete {
            missing: FIELD_PAYLOAD,
        }),
        None => Err(EnvelopeError::Incomplete {
            missing: FIELD_CONTENT,
        }),
    }
}

/// Convert a JSON array of integers in `0..=255` into bytes.
fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn encode(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn flat_string_content() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "out.png",
            "content": "hello",
        })))
        .unwrap();
        assert_eq!(env.job_id, "J1");
        assert_eq!(env.filename, "out.png");
        assert_eq!(env.payload, b"hello");
    }

    #[test]
    fn flat_byte_array_content() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "out.png",
            "content": [137, 80, 78, 71, 0, 255],
        })))
        .unwrap();
        assert_eq!(env.payload, vec![137, 80, 78, 71, 0, 255]);
    }

    #[test]
    fn structured_buffer_payload() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "map.pdf",
            "payload": { "type": "Buffer", "data": [1, 2, 3] },
        })))
        .unwrap();
        assert_eq!(env.payload, vec![1, 2, 3]);
    }

    #[test]
    fn bare_string_payload_is_accepted() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "map.txt",
            "payload": "rendered",
        })))
        .unwrap();
        assert_eq!(env.payload, b"rendered");
    }

    #[test]
    fn content_wins_over_payload() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "out.png",
            "content": "flat",
            "payload": { "data": [9] },
        })))
        .unwrap();
        assert_eq!(env.payload, b"flat");
    }

    #[test]
    fn empty_content_is_valid() {
        let env = decode_envelope(&encode(json!({
            "job": "J1",
            "filename": "empty.txt",
            "content": "",
        })))
        .unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn not_json_is_malformed() {
        assert_matches!(
            decode_envelope(b"\x00\x01 not json"),
            Err(EnvelopeError::Malformed(_))
        );
    }

    #[test]
    fn json_array_is_malformed() {
        assert_matches!(
            decode_envelope(b"[1, 2, 3]"),
            Err(EnvelopeError::Malformed(_))
        );
    }

    #[test]
    fn job_only_is_incomplete_on_filename() {
        assert_eq!(
            decode_envelope(br#"{"job": "J1"}"#),
            Err(EnvelopeError::Incomplete {
                missing: FIELD_FILENAME
            })
        );
    }

    #[test]
    fn missing_job_reported_first() {
        assert_eq!(
            decode_envelope(br#"{"filename": "a.png", "content": "x"}"#),
            Err(EnvelopeError::Incomplete { missing: FIELD_JOB })
        );
    }

    #[test]
    fn missing_content_and_payload() {
        assert_eq!(
            decode_envelope(br#"{"job": "J1", "filename": "a.png"}"#),
            Err(EnvelopeError::Incomplete {
                missing: FIELD_CONTENT
            })
        );
    }

    #[test]
    fn payload_without_data() {
        assert_eq!(
            decode_envelope(br#"{"job": "J1", "filename": "a.png", "payload": {"type": "Buffer"}}"#),
            Err(EnvelopeError::Incomplete {
                missing: FIELD_PAYLOAD_DATA
            })
        );
    }

    #[test]
    fn out_of_range_bytes_are_rejected() {
        assert_eq!(
            decode_envelope(br#"{"job": "J1", "filename": "a.png", "content": [1, 256]}"#),
            Err(EnvelopeError::Incomplete {
                missing: FIELD_CONTENT
            })
        );
    }

    #[test]
    fn integer_job_is_read_as_text() {
        let env = decode_envelope(br#"{"job": 42, "filename": "a.png", "content": "x"}"#).unwrap();
        assert_eq!(env.job_id, "42");

        let env = decode_envelope(br#"{"job": -7, "filename": "a.png", "content": "x"}"#).unwrap();
        assert_eq!(env.job_id, "-7");
    }

    #[test]
    fn other_non_string_jobs_are_incomplete() {
        for job in ["4.5", "true", "null", "[1]", "{}"] {
            let body = format!(r#"{{"job": {job}, "filename": "a.png", "content": "x"}}"#);
            assert_eq!(
                decode_envelope(body.as_bytes()),
                Err(EnvelopeError::Incomplete { missing: FIELD_JOB }),
                "job {job}",
            );
        }
    }

    #[test]
    fn blank_filename_is_incomplete() {
        assert_eq!(
            decode_envelope(br#"{"job": "J1", "filename": "  ", "content": "x"}"#),
            Err(EnvelopeError::Incomplete {
                missing: FIELD_FILENAME
            })
        );
    }
}
