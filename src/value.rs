// Value: the dynamically typed value vocabulary shared by every query
// function and assignment in the language.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use thiserror::Error;

/// Object payloads preserve insertion order for iteration and serialization,
/// while comparing equal regardless of key order.
pub type Object = IndexMap<String, Value>;

/// A JSON-like runtime value.
///
/// Numbers keep their integer/float distinction so that arithmetic can follow
/// the integer ladder (two integers stay integer, any float promotes both
/// sides). `Delete` and `Nothing` are first-class sentinels rather than
/// magic null values: they carry assignment semantics ("remove the target"
/// and "leave the target untouched") and serialize as `null` when forced
/// into output.
#[derive(Clone, Debug)]
pub enum Value {
    String(String),
    Bytes(Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Value>),
    Object(Object),
    Null,
    Delete,
    Nothing,
}

/// The discrete type of a value, as reported in type errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Bytes,
    Number,
    Bool,
    Array,
    Object,
    Null,
    Delete,
    Nothing,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
            ValueType::Number => "number",
            ValueType::Bool => "bool",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Null => "null",
            ValueType::Delete => "delete",
            ValueType::Nothing => "nothing",
        };
        write!(f, "{}", name)
    }
}

/// A coercion failure: the operation names the types it accepts and the
/// concrete type it received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub expected: Vec<ValueType>,
    pub actual: ValueType,
}

impl TypeError {
    pub fn new(actual: ValueType, expected: Vec<ValueType>) -> Self {
        TypeError { expected, actual }
    }

    pub fn expected_one(actual: ValueType, expected: ValueType) -> Self {
        TypeError {
            expected: vec![expected],
            actual,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.expected.is_empty() {
            return write!(f, "found unexpected value type {}", self.actual);
        }
        let expected = self
            .expected
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        write!(f, "expected {} value, found {}", expected, self.actual)
    }
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Int(_) | Value::Float(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Bool,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
            Value::Null => ValueType::Null,
            Value::Delete => ValueType::Delete,
            Value::Nothing => ValueType::Nothing,
        }
    }

    /// True for `Null` and for both assignment sentinels, which behave as
    /// null wherever a plain value is demanded.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Delete | Value::Nothing)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }
}

// ── Strict extractors ────────────────────────────────────────────────────────

impl Value {
    /// Extract an integer. Floats truncate; everything else is a type error.
    pub fn get_int(&self) -> Result<i64, TypeError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            other => Err(TypeError::expected_one(
                other.value_type(),
                ValueType::Number,
            )),
        }
    }

    /// Extract a float, widening integers.
    pub fn get_float(&self) -> Result<f64, TypeError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(TypeError::expected_one(
                other.value_type(),
                ValueType::Number,
            )),
        }
    }

    /// Extract a boolean. Numbers count as their zero-ness.
    pub fn get_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            other => Err(TypeError::expected_one(other.value_type(), ValueType::Bool)),
        }
    }

    /// Extract a string. Byte payloads are interchangeable with strings.
    pub fn get_string(&self) -> Result<String, TypeError> {
        match self {
            Value::String(s) => Ok(s.clone()),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Err(TypeError::expected_one(
                other.value_type(),
                ValueType::String,
            )),
        }
    }

    /// Extract a byte sequence. Strings are interchangeable with bytes.
    pub fn get_bytes(&self) -> Result<Vec<u8>, TypeError> {
        match self {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(TypeError::expected_one(
                other.value_type(),
                ValueType::Bytes,
            )),
        }
    }

    /// Coerce into a timestamp: numbers are unix seconds (floats keep their
    /// fractional nanoseconds), strings parse as RFC 3339.
    pub fn get_timestamp(&self) -> Result<DateTime<Utc>, TypeError> {
        let mismatch = || {
            TypeError::new(
                self.value_type(),
                vec![ValueType::Number, ValueType::String],
            )
        };
        match self {
            Value::Int(i) => DateTime::from_timestamp(*i, 0).ok_or_else(mismatch),
            Value::Float(f) => {
                let secs = f.trunc();
                let nanos = ((f - secs) * 1e9) as u32;
                DateTime::from_timestamp(secs as i64, nanos).ok_or_else(mismatch)
            }
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| mismatch()),
            Value::Bytes(b) => DateTime::parse_from_rfc3339(&String::from_utf8_lossy(b))
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        }
    }
}

// ── Lenient conversions ──────────────────────────────────────────────────────

impl Value {
    /// Parse a number out of the value, including numeric strings.
    pub fn to_float(&self) -> Result<f64, TypeError> {
        match self {
            Value::String(s) => s
                .parse::<f64>()
                .map_err(|_| TypeError::expected_one(ValueType::String, ValueType::Number)),
            Value::Bytes(b) => String::from_utf8_lossy(b)
                .parse::<f64>()
                .map_err(|_| TypeError::expected_one(ValueType::Bytes, ValueType::Number)),
            other => other.get_float(),
        }
    }

    /// Parse an integer out of the value, including numeric strings.
    pub fn to_int(&self) -> Result<i64, TypeError> {
        match self {
            Value::String(s) => s
                .parse::<i64>()
                .map_err(|_| TypeError::expected_one(ValueType::String, ValueType::Number)),
            Value::Bytes(b) => String::from_utf8_lossy(b)
                .parse::<i64>()
                .map_err(|_| TypeError::expected_one(ValueType::Bytes, ValueType::Number)),
            other => other.get_int(),
        }
    }

    /// Parse a boolean out of the value, including the usual string spellings.
    pub fn to_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::String(s) => parse_bool_str(s)
                .ok_or_else(|| TypeError::expected_one(ValueType::String, ValueType::Bool)),
            Value::Bytes(b) => parse_bool_str(&String::from_utf8_lossy(b))
                .ok_or_else(|| TypeError::expected_one(ValueType::Bytes, ValueType::Bool)),
            other => other.get_bool(),
        }
    }

    /// Render the value as bytes. Strings and byte payloads pass through
    /// untouched; containers serialize as JSON.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            other => other.to_string().into_bytes(),
        }
    }

    /// Serialize the value as compact JSON bytes. Sentinels render as `null`.
    pub fn to_json_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"null".to_vec())
    }
}

fn parse_bool_str(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

// The lenient string conversion: scalars render bare (no quotes), containers
// render as JSON documents.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(n) => {
                if n.is_finite() {
                    write!(f, "{}", n)
                } else {
                    write!(f, "null")
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null | Value::Delete | Value::Nothing => write!(f, "null"),
            other => {
                let bytes = other.to_json_vec();
                write!(f, "{}", String::from_utf8_lossy(&bytes))
            }
        }
    }
}

// ── Path navigation ──────────────────────────────────────────────────────────

impl Value {
    /// Walk a path of object keys (and numeric array indexes) into the value.
    pub fn query_path(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;
        for seg in path {
            current = match current {
                Value::Object(map) => map.get(seg.as_str())?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a leaf at a path of object keys, creating intermediate objects as
    /// needed. A non-object intermediate is overwritten by a fresh object.
    pub fn set_path(&mut self, path: &[String], value: Value) {
        if path.is_empty() {
            *self = value;
            return;
        }
        if !self.is_object() {
            *self = Value::Object(Object::new());
        }
        let mut current = self;
        for seg in &path[..path.len() - 1] {
            let map = match current {
                Value::Object(map) => map,
                _ => return,
            };
            let entry = map
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Object::new()));
            if !entry.is_object() {
                *entry = Value::Object(Object::new());
            }
            current = entry;
        }
        if let Value::Object(map) = current {
            if let Some(leaf) = path.last() {
                map.insert(leaf.clone(), value);
            }
        }
    }

    /// Remove the leaf at a path of object keys. Missing paths are a no-op.
    pub fn delete_path(&mut self, path: &[String]) {
        let Some((leaf, parents)) = path.split_last() else {
            return;
        };
        let mut current = self;
        for seg in parents {
            current = match current {
                Value::Object(map) => match map.get_mut(seg.as_str()) {
                    Some(v) => v,
                    None => return,
                },
                _ => return,
            };
        }
        if let Value::Object(map) = current {
            map.shift_remove(leaf.as_str());
        }
    }
}

// ── Equality ─────────────────────────────────────────────────────────────────

// Structural equality: objects compare regardless of key order, integers and
// floats cross-compare numerically, NaN is never equal to anything.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Delete, Value::Delete) => true,
            (Value::Nothing, Value::Nothing) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::String(a), Value::Bytes(b)) | (Value::Bytes(b), Value::String(a)) => {
                a.as_bytes() == b.as_slice()
            }
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Object> for Value {
    fn from(m: Object) -> Self {
        Value::Object(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

// ── Serialization ────────────────────────────────────────────────────────────

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null | Value::Delete | Value::Nothing => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => {
                if f.is_finite() {
                    serializer.serialize_f64(*f)
                } else {
                    serializer.serialize_unit()
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        // Out-of-range unsigned values degrade to float rather than failing.
        Ok(i64::try_from(v)
            .map(Value::Int)
            .unwrap_or(Value::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element()? {
            items.push(elem);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut m = Object::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry()? {
            m.insert(k, v);
        }
        Ok(Value::Object(m))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Render a timestamp the way timestamps travel through payloads.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ── Tests ────────────────────────────────────────────────────────────────────
