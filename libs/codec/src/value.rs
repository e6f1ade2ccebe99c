//! Structured values
//!
//! The value model messages carry between nodes. It is a superset of JSON:
//! raw byte arrays, reference objects ([`Blob`]) and opaque host objects can
//! appear anywhere a JSON value can. Host objects have no native encoding and
//! only survive a send through their JSON rendition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::blob::Blob;

/// An object owned by the embedding runtime that the native codec cannot copy
///
/// The only way such an object crosses a transport boundary is through the
/// JSON text fallback, so it must describe itself as JSON. Returning `None`
/// means the object has no JSON form at all (the equivalent of a function or
/// an `undefined` in a scripting runtime).
pub trait HostObject: Send + Sync + fmt::Debug {
    fn to_json(&self) -> Option<Value>;
}

/// A message payload before serialization
#[derive(Clone, Debug, Default)]
pub enum StructuredValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<StructuredValue>),
    Object(BTreeMap<String, StructuredValue>),
    Blob(Arc<Blob>),
    Host(Arc<dyn HostObject>),
}

impl PartialEq for StructuredValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => Arc::ptr_eq(a, b),
            (Self::Host(a), Self::Host(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

impl StructuredValue {
    /// Build an object value from key/value pairs
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, StructuredValue)>,
    {
        StructuredValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Render the value the way a JSON stringifier would
    ///
    /// Values with no JSON form yield `None`. Inside an object such members
    /// are omitted; inside an array they become `null`. Blobs render as an
    /// empty object and non-finite numbers as `null`.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            StructuredValue::Null => Some(Value::Null),
            StructuredValue::Bool(b) => Some(Value::Bool(*b)),
            StructuredValue::Number(n) => Some(number_to_json(*n)),
            StructuredValue::String(s) => Some(Value::String(s.clone())),
            StructuredValue::Bytes(bytes) => Some(Value::Array(
                bytes.iter().map(|b| Value::Number(Number::from(*b))).collect(),
            )),
            StructuredValue::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json().unwrap_or(Value::Null))
                    .collect(),
            )),
            StructuredValue::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    if let Some(json) = value.to_json() {
                        map.insert(key.clone(), json);
                    }
                }
                Some(Value::Object(map))
            }
            StructuredValue::Blob(_) => Some(Value::Object(Map::new())),
            StructuredValue::Host(host) => host.to_json(),
        }
    }

    /// Lift a parsed JSON document into a structured value
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => StructuredValue::Null,
            Value::Bool(b) => StructuredValue::Bool(*b),
            Value::Number(n) => StructuredValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => StructuredValue::String(s.clone()),
            Value::Array(items) => {
                StructuredValue::Array(items.iter().map(StructuredValue::from_json).collect())
            }
            Value::Object(map) => StructuredValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), StructuredValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Collect every blob reachable from this value, in visit order
    pub fn blobs(&self) -> Vec<Arc<Blob>> {
        let mut out = Vec::new();
        self.collect_blobs(&mut out);
        out
    }

    fn collect_blobs(&self, out: &mut Vec<Arc<Blob>>) {
        match self {
            StructuredValue::Blob(blob) => out.push(Arc::clone(blob)),
            StructuredValue::Array(items) => items.iter().for_each(|v| v.collect_blobs(out)),
            StructuredValue::Object(entries) => {
                entries.values().for_each(|v| v.collect_blobs(out))
            }
            _ => {}
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StructuredValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StructuredValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StructuredValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        match self {
            StructuredValue::Object(entries) => entries.get(key),
            _ => None,
        }
    }
}

fn number_to_json(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    // Integral values keep an integer rendition so "1" does not become "1.0"
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

impl From<Value> for StructuredValue {
    fn from(value: Value) -> Self {
        StructuredValue::from_json(&value)
    }
}

impl From<&str> for StructuredValue {
    fn from(value: &str) -> Self {
        StructuredValue::String(value.to_string())
    }
}

impl From<String> for StructuredValue {
    fn from(value: String) -> Self {
        StructuredValue::String(value)
    }
}

impl From<bool> for StructuredValue {
    fn from(value: bool) -> Self {
        StructuredValue::Bool(value)
    }
}

impl From<f64> for StructuredValue {
    fn from(value: f64) -> Self {
        StructuredValue::Number(value)
    }
}

impl From<i64> for StructuredValue {
    fn from(value: i64) -> Self {
        StructuredValue::Number(value as f64)
    }
}

impl From<Vec<u8>> for StructuredValue {
    fn from(value: Vec<u8>) -> Self {
        StructuredValue::Bytes(value)
    }
}

impl From<Arc<Blob>> for StructuredValue {
    fn from(value: Arc<Blob>) -> Self {
        StructuredValue::Blob(value)
    }
}

impl From<Vec<StructuredValue>> for StructuredValue {
    fn from(value: Vec<StructuredValue>) -> Self {
        StructuredValue::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Opaque;

    impl HostObject for Opaque {
        fn to_json(&self) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_json_rendering_rules() {
        let value = StructuredValue::object([
            ("a", StructuredValue::Number(1.0)),
            ("skip", StructuredValue::Host(Arc::new(Opaque))),
            (
                "list",
                StructuredValue::Array(vec![
                    StructuredValue::Host(Arc::new(Opaque)),
                    StructuredValue::Number(f64::INFINITY),
                ]),
            ),
            ("blob", StructuredValue::Blob(Blob::from_bytes(vec![1, 2], "text/plain"))),
        ]);

        assert_eq!(
            value.to_json(),
            Some(json!({"a": 1, "list": [null, null], "blob": {}}))
        );
    }

    #[test]
    fn test_from_json_roundtrip() {
        let doc = json!({"x": [1, 2.5, "s", true, null]});
        let value = StructuredValue::from(doc.clone());
        assert_eq!(value.to_json(), Some(doc));
    }

    #[test]
    fn test_blob_collection_order() {
        let first = Blob::from_bytes(vec![1], "");
        let second = Blob::from_bytes(vec![2], "");
        let value = StructuredValue::Array(vec![
            StructuredValue::Blob(Arc::clone(&first)),
            StructuredValue::object([("b", StructuredValue::Blob(Arc::clone(&second)))]),
        ]);

        let blobs = value.blobs();
        assert_eq!(blobs.len(), 2);
        assert!(Arc::ptr_eq(&blobs[0], &first));
        assert!(Arc::ptr_eq(&blobs[1], &second));
    }
}
