//! JSON-RPC 2.0 envelope validation.
//!
//! The bridge never interprets payloads; it only checks that a message has
//! one of the three JSON-RPC 2.0 shapes before letting it through. Reference:
//! <https://www.jsonrpc.org/specification>

use serde_json::Value;

use crate::error::EnvelopeError;

/// Shape of a single validated JSON-RPC message.
///
/// Any present `id` makes a message with a `method` a request; the bridge
/// does not care about the `id` type beyond its presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

/// Classify a single JSON value as a JSON-RPC 2.0 message.
pub fn classify(value: &Value) -> Result<MessageKind, EnvelopeError> {
    let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

    match obj.get("jsonrpc") {
        Some(Value::String(version)) if version == "2.0" => {}
        _ => return Err(EnvelopeError::BadVersion),
    }

    if let Some(method) = obj.get("method") {
        if !method.is_string() {
            return Err(EnvelopeError::BadMethod);
        }
        return Ok(if obj.contains_key("id") {
            MessageKind::Request
        } else {
            MessageKind::Notification
        });
    }

    if !obj.contains_key("id") {
        return Err(EnvelopeError::MissingId);
    }

    match (obj.contains_key("result"), obj.contains_key("error")) {
        (true, false) | (false, true) => Ok(MessageKind::Response),
        (true, true) => Err(EnvelopeError::ResultAndError),
        (false, false) => Err(EnvelopeError::NotAnyShape),
    }
}

/// Validate a whole frame: a single envelope, or a non-empty batch whose
/// elements are all valid envelopes.
pub fn validate_frame(value: &Value) -> Result<(), EnvelopeError> {
    match value {
        Value::Object(_) => classify(value).map(|_| ()),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(EnvelopeError::EmptyBatch);
            }
            for (index, item) in items.iter().enumerate() {
                classify(item).map_err(|source| EnvelopeError::BatchElement {
                    index,
                    source: Box::new(source),
                })?;
            }
            Ok(())
        }
        _ => Err(EnvelopeError::NotObjectOrArray),
    }
}

/// Normalize an ingress body into individual compact frames.
///
/// A single object becomes a one-element list; an array contributes one frame
/// per element, in submission order. Validation is all-or-nothing: one bad
/// batch element rejects the whole body.
pub fn normalize_body(value: &Value) -> Result<Vec<String>, EnvelopeError> {
    validate_frame(value)?;
    let frames = match value {
        Value::Array(items) => items.iter().map(Value::to_string).collect(),
        _ => vec![value.to_string()],
    };
    Ok(frames)
}
