//! Payload codecs
//!
//! [`PayloadCodec`] is the seam between the message manager and whatever
//! structured-clone format the embedder uses. The provided `serialize` adds
//! the JSON text fallback on top of a codec's native writer: when the native
//! writer reports a data clone failure the value is stringified, parsed back,
//! and the parsed document is written natively instead.
//!
//! [`BincodeCodec`] is the default native format: a format version byte
//! followed by a bincode-encoded value tree whose blobs are replaced by
//! indices into the payload's blob list.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::blob::Blob;
use crate::clone_data::StructuredCloneData;
use crate::error::{CodecError, CodecResult};
use crate::value::StructuredValue;

/// Version byte leading every native buffer
pub const NATIVE_FORMAT_VERSION: u8 = 1;

/// Serialize/deserialize structured values to an opaque buffer
pub trait PayloadCodec: Send + Sync {
    /// Native serialization only
    fn write_native(&self, value: &StructuredValue) -> CodecResult<StructuredCloneData>;

    fn deserialize(&self, data: &StructuredCloneData) -> CodecResult<StructuredValue>;

    /// Native serialization with JSON text fallback
    fn serialize(&self, value: &StructuredValue) -> CodecResult<StructuredCloneData> {
        match self.write_native(value) {
            Ok(data) => Ok(data),
            Err(err) if err.is_data_clone() => {
                debug!(error = %err, "Native serialization failed, retrying through JSON text");
                let text = json_text(value)?;
                let parsed: Value = serde_json::from_str(&text)
                    .map_err(|e| CodecError::data_clone(format!("JSON text did not parse: {}", e)))?;
                self.write_native(&StructuredValue::from_json(&parsed))
            }
            Err(err) => Err(err),
        }
    }
}

fn json_text(value: &StructuredValue) -> CodecResult<String> {
    let json = value
        .to_json()
        .ok_or_else(|| CodecError::data_clone("value has no JSON representation"))?;
    let text = serde_json::to_string(&json).map_err(|e| CodecError::encode(e.to_string()))?;
    if text.is_empty() {
        return Err(CodecError::data_clone("JSON representation is empty"));
    }
    Ok(text)
}

#[derive(Debug, Serialize, Deserialize)]
enum WireValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
    Object(Vec<(String, WireValue)>),
    Blob(u32),
}

/// Default codec: bincode value tree behind a version byte
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

struct BlobTable {
    blobs: Vec<Arc<Blob>>,
    index: HashMap<*const Blob, u32>,
}

impl BlobTable {
    fn slot(&mut self, blob: &Arc<Blob>) -> CodecResult<u32> {
        let key = Arc::as_ptr(blob);
        if let Some(&slot) = self.index.get(&key) {
            return Ok(slot);
        }
        let slot = u32::try_from(self.blobs.len())
            .map_err(|_| CodecError::encode("too many blobs in one payload"))?;
        self.blobs.push(Arc::clone(blob));
        self.index.insert(key, slot);
        Ok(slot)
    }
}

fn to_wire(value: &StructuredValue, table: &mut BlobTable) -> CodecResult<WireValue> {
    Ok(match value {
        StructuredValue::Null => WireValue::Null,
        StructuredValue::Bool(b) => WireValue::Bool(*b),
        StructuredValue::Number(n) => WireValue::Number(*n),
        StructuredValue::String(s) => WireValue::String(s.clone()),
        StructuredValue::Bytes(b) => WireValue::Bytes(b.clone()),
        StructuredValue::Array(items) => WireValue::Array(
            items
                .iter()
                .map(|item| to_wire(item, table))
                .collect::<CodecResult<_>>()?,
        ),
        StructuredValue::Object(entries) => WireValue::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_wire(v, table)?)))
                .collect::<CodecResult<_>>()?,
        ),
        StructuredValue::Blob(blob) => WireValue::Blob(table.slot(blob)?),
        StructuredValue::Host(host) => {
            return Err(CodecError::data_clone(format!(
                "host object {:?} cannot be cloned",
                host
            )))
        }
    })
}

fn from_wire(wire: WireValue, blobs: &[Arc<Blob>]) -> CodecResult<StructuredValue> {
    Ok(match wire {
        WireValue::Null => StructuredValue::Null,
        WireValue::Bool(b) => StructuredValue::Bool(b),
        WireValue::Number(n) => StructuredValue::Number(n),
        WireValue::String(s) => StructuredValue::String(s),
        WireValue::Bytes(b) => StructuredValue::Bytes(b),
        WireValue::Array(items) => StructuredValue::Array(
            items
                .into_iter()
                .map(|item| from_wire(item, blobs))
                .collect::<CodecResult<_>>()?,
        ),
        WireValue::Object(entries) => StructuredValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, from_wire(v, blobs)?)))
                .collect::<CodecResult<_>>()?,
        ),
        WireValue::Blob(index) => {
            let blob = blobs
                .get(index as usize)
                .ok_or(CodecError::MissingBlob {
                    index,
                    available: blobs.len(),
                })?;
            StructuredValue::Blob(Arc::clone(blob))
        }
    })
}

impl PayloadCodec for BincodeCodec {
    fn write_native(&self, value: &StructuredValue) -> CodecResult<StructuredCloneData> {
        let mut table = BlobTable {
            blobs: Vec::new(),
            index: HashMap::new(),
        };
        let wire = to_wire(value, &mut table)?;

        let mut buffer = vec![NATIVE_FORMAT_VERSION];
        bincode::serialize_into(&mut buffer, &wire).map_err(|e| CodecError::encode(e.to_string()))?;

        trace!(
            bytes = buffer.len(),
            blobs = table.blobs.len(),
            "Serialized structured value"
        );
        Ok(StructuredCloneData::new(buffer, table.blobs))
    }

    fn deserialize(&self, data: &StructuredCloneData) -> CodecResult<StructuredValue> {
        let buffer = data.bytes();
        let Some((&version, body)) = buffer.split_first() else {
            return Ok(StructuredValue::Null);
        };
        if version != NATIVE_FORMAT_VERSION {
            return Err(CodecError::malformed(
                format!("unsupported format version {}", version),
                buffer.len(),
            ));
        }
        let wire: WireValue = bincode::deserialize(body)
            .map_err(|e| CodecError::malformed(e.to_string(), buffer.len()))?;
        from_wire(wire, data.blobs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Described(Value);

    impl crate::value::HostObject for Described {
        fn to_json(&self) -> Option<Value> {
            Some(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct Opaque;

    impl crate::value::HostObject for Opaque {
        fn to_json(&self) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_native_roundtrip_with_blobs() {
        let codec = BincodeCodec::new();
        let blob = Blob::from_bytes(vec![9u8, 9], "application/octet-stream");
        let value = StructuredValue::object([
            ("first", StructuredValue::Blob(Arc::clone(&blob))),
            ("again", StructuredValue::Blob(Arc::clone(&blob))),
            ("raw", StructuredValue::Bytes(vec![1, 2, 3])),
        ]);

        let data = codec.serialize(&value).unwrap();
        assert_eq!(data.blobs().len(), 1, "same blob is shipped once");
        assert_eq!(data.bytes()[0], NATIVE_FORMAT_VERSION);

        let decoded = codec.deserialize(&data).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_host_object_falls_back_to_json() {
        let codec = BincodeCodec::new();
        let value = StructuredValue::object([
            ("host", StructuredValue::Host(Arc::new(Described(json!({"k": [1, 2]}))))),
            ("n", StructuredValue::Number(2.0)),
        ]);

        assert!(codec.write_native(&value).unwrap_err().is_data_clone());

        let data = codec.serialize(&value).unwrap();
        let decoded = codec.deserialize(&data).unwrap();
        assert_eq!(decoded.to_json(), Some(json!({"host": {"k": [1, 2]}, "n": 2})));
    }

    #[test]
    fn test_value_without_json_form_is_data_clone_error() {
        let codec = BincodeCodec::new();
        let err = codec
            .serialize(&StructuredValue::Host(Arc::new(Opaque)))
            .unwrap_err();
        assert!(err.is_data_clone());
    }

    #[test]
    fn test_empty_buffer_reads_as_null() {
        let codec = BincodeCodec::new();
        assert!(codec
            .deserialize(&StructuredCloneData::empty())
            .unwrap()
            .is_null());
    }

    #[test]
    fn test_bad_version_and_missing_blob() {
        let codec = BincodeCodec::new();
        let err = codec
            .deserialize(&StructuredCloneData::new(vec![42u8, 0], Vec::new()))
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));

        let with_blob = codec
            .serialize(&StructuredValue::Blob(Blob::from_bytes(vec![1u8], "")))
            .unwrap();
        let stripped = StructuredCloneData::new(with_blob.bytes().clone(), Vec::new());
        assert!(matches!(
            codec.deserialize(&stripped),
            Err(CodecError::MissingBlob { index: 0, available: 0 })
        ));
    }
}
