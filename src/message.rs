// Message parts: raw bytes, a lazily parsed structured view, and string
// metadata. This is the surface the runtime consumes from the host.

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::value::Value;

/// Metadata is an ordered mapping of string keys to string values.
pub type Metadata = IndexMap<String, String>;

/// Why a payload could not be interpreted as a structured document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("message is empty")]
    Empty,

    #[error("parse as json: {0}")]
    Json(String),
}

/// A single message within a batch.
///
/// The structured view is parsed from the raw bytes on first use and cached
/// for the remainder of the part's life, parse failures included. Replacing
/// the bytes discards the cache.
#[derive(Debug)]
pub struct Part {
    bytes: Vec<u8>,
    metadata: Metadata,
    structured: OnceCell<Result<Value, PayloadError>>,
}

impl Part {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Part {
            bytes: bytes.into(),
            metadata: Metadata::new(),
            structured: OnceCell::new(),
        }
    }

    /// Compose a part directly from a structured value: the bytes are the
    /// serialized document and the structured view is pre-populated.
    pub fn from_structured(value: Value) -> Self {
        let bytes = value.to_json_vec();
        let cell = OnceCell::new();
        let _ = cell.set(Ok(value));
        Part {
            bytes,
            metadata: Metadata::new(),
            structured: cell,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replace the raw payload, invalidating any cached structured view.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.structured = OnceCell::new();
    }

    /// Replace the payload with a structured value, deriving the raw bytes
    /// from it.
    pub fn set_structured(&mut self, value: Value) {
        self.bytes = value.to_json_vec();
        let cell = OnceCell::new();
        let _ = cell.set(Ok(value));
        self.structured = cell;
    }

    /// The payload interpreted as a JSON document, parsed once and cached.
    pub fn structured(&self) -> Result<&Value, PayloadError> {
        self.structured
            .get_or_init(|| parse_payload(&self.bytes))
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn meta_get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn meta_set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn meta_delete(&mut self, key: &str) {
        self.metadata.shift_remove(key);
    }
}

impl Clone for Part {
    fn clone(&self) -> Self {
        let structured = OnceCell::new();
        if let Some(parsed) = self.structured.get() {
            let _ = structured.set(parsed.clone());
        }
        Part {
            bytes: self.bytes.clone(),
            metadata: self.metadata.clone(),
            structured,
        }
    }
}

fn parse_payload(bytes: &[u8]) -> Result<Value, PayloadError> {
    if bytes.is_empty() {
        return Err(PayloadError::Empty);
    }

    #[cfg(feature = "simd")]
    {
        // simd-json needs a mutable scratch buffer; fall through to
        // serde_json on failure so error messages stay consistent.
        let mut scratch = bytes.to_vec();
        if let Ok(value) = simd_json::serde::from_slice::<Value>(&mut scratch) {
            return Ok(value);
        }
    }

    serde_json::from_slice(bytes).map_err(|e| PayloadError::Json(e.to_string()))
}

/// An ordered batch of message parts.
#[derive(Debug, Clone, Default)]
pub struct MessageBatch {
    parts: Vec<Part>,
}

impl MessageBatch {
    pub fn new() -> Self {
        MessageBatch { parts: Vec::new() }
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn get(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter()
    }
}

impl From<Vec<Part>> for MessageBatch {
    fn from(parts: Vec<Part>) -> Self {
        MessageBatch { parts }
    }
}

impl FromIterator<Part> for MessageBatch {
    fn from_iter<T: IntoIterator<Item = Part>>(iter: T) -> Self {
        MessageBatch {
            parts: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_view_is_cached() {
        let part = Part::new(r#"{"foo":"bar"}"#);
        let first = part.structured().unwrap() as *const Value;
        let second = part.structured().unwrap() as *const Value;
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_payload() {
        let part = Part::new("");
        assert_eq!(part.structured().unwrap_err(), PayloadError::Empty);
    }

    #[test]
    fn test_invalid_payload() {
        let part = Part::new("{@#$ not valid json");
        match part.structured().unwrap_err() {
            PayloadError::Json(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_set_bytes_invalidates_cache() {
        let mut part = Part::new(r#"{"foo":1}"#);
        assert!(part.structured().is_ok());
        part.set_bytes(b"not json".to_vec());
        assert!(part.structured().is_err());
    }

    #[test]
    fn test_from_structured() {
        let part = Part::from_structured(Value::from(json!({"a": 1})));
        assert_eq!(part.bytes(), br#"{"a":1}"#);
        assert_eq!(part.structured().unwrap(), &Value::from(json!({"a": 1})));
    }

    #[test]
    fn test_metadata_ordering() {
        let mut part = Part::new("{}");
        part.meta_set("b", "1");
        part.meta_set("a", "2");
        let keys: Vec<&str> = part.metadata().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);

        part.meta_delete("b");
        assert_eq!(part.meta_get("b"), None);
        assert_eq!(part.meta_get("a"), Some("2"));
    }
}
