//! SafeTensors header parser: u64 LE length prefix + JSON object.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cursor::{ByteCursor, Endian};
use crate::error::SafeTensorsError;

/// Reserved top-level key holding free-form string metadata.
pub const METADATA_KEY: &str = "__metadata__";

#[derive(Debug, Clone, PartialEq)]
pub struct SafeTensorsTensor {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u64>,
    /// `[begin, end)` relative to `data_start`.
    pub data_offsets: (u64, u64),
}

#[derive(Debug, Clone)]
pub struct SafeTensorsModel {
    pub header_size: u64,
    pub header_json: Map<String, Value>,
    pub tensors: Vec<SafeTensorsTensor>,
    /// String-valued entries of `__metadata__`; other values are skipped.
    pub metadata: BTreeMap<String, String>,
    pub data_start: u64,
    pub file_size: u64,
}

pub fn parse(buf: &[u8], file_size: u64) -> Result<SafeTensorsModel, SafeTensorsError> {
    if file_size < 8 || buf.len() < 8 {
        return Err(SafeTensorsError::TooSmall(file_size.min(buf.len() as u64)));
    }
    let mut c = ByteCursor::new(buf);
    let header_size = c
        .read_u64(Endian::Little)
        .map_err(|_| SafeTensorsError::TooSmall(buf.len() as u64))?;

    let beyond = SafeTensorsError::HeaderBeyondEof {
        header_size,
        file_size,
    };
    let data_start = match header_size.checked_add(8) {
        Some(end) if end <= file_size => end,
        _ => return Err(beyond),
    };
    let raw = c.read_bytes(header_size).map_err(|_| beyond)?;

    let raw = raw.trim_ascii_start();
    if raw.first() != Some(&b'{') {
        return Err(SafeTensorsError::NotAnObject);
    }
    let header: Value =
        serde_json::from_slice(raw).map_err(|e| SafeTensorsError::InvalidJson(e.to_string()))?;
    let Value::Object(header_json) = header else {
        return Err(SafeTensorsError::NotAnObject);
    };

    let mut tensors = Vec::with_capacity(header_json.len());
    let mut metadata = BTreeMap::new();
    for (name, meta) in &header_json {
        if name == METADATA_KEY {
            if let Value::Object(m) = meta {
                for (k, v) in m {
                    if let Value::String(s) = v {
                        metadata.insert(k.clone(), s.clone());
                    }
                }
            }
            continue;
        }
        tensors.push(tensor_from_json(name, meta)?);
    }

    debug!(header_size, tensors = tensors.len(), "safetensors header parsed");
    Ok(SafeTensorsModel {
        header_size,
        header_json,
        tensors,
        metadata,
        data_start,
        file_size,
    })
}

fn tensor_from_json(name: &str, meta: &Value) -> Result<SafeTensorsTensor, SafeTensorsError> {
    let invalid = |reason: &str| SafeTensorsError::InvalidTensor {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let meta = meta.as_object().ok_or_else(|| invalid("not an object"))?;

    let dtype = meta
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing or non-string dtype"))?;

    let shape = meta
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing or non-array shape"))?
        .iter()
        .map(Value::as_u64)
        .collect::<Option<Vec<u64>>>()
        .ok_or_else(|| invalid("shape must hold non-negative integers"))?;

    let offsets = meta
        .get("data_offsets")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing or non-array data_offsets"))?;
    let (begin, end) = match offsets.as_slice() {
        [b, e] => match (b.as_u64(), e.as_u64()) {
            (Some(b), Some(e)) => (b, e),
            _ => return Err(invalid("data_offsets must hold non-negative integers")),
        },
        _ => return Err(invalid("data_offsets must hold exactly two values")),
    };

    Ok(SafeTensorsTensor {
        name: name.to_string(),
        dtype: dtype.to_string(),
        shape,
        data_offsets: (begin, end),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(header: &str, data_len: usize) -> Vec<u8> {
        let mut buf = (header.len() as u64).to_le_bytes().to_vec();
        buf.extend_from_slice(header.as_bytes());
        buf.resize(buf.len() + data_len, 0);
        buf
    }

    #[test]
    fn parses_tensors_and_metadata() {
        let header = r#"  {"__metadata__":{"format":"pt","n":1},"w":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let buf = file(header, 16);
        let m = parse(&buf, buf.len() as u64).unwrap();
        assert_eq!(m.header_size, header.len() as u64);
        assert_eq!(m.data_start, 8 + header.len() as u64);
        assert_eq!(m.tensors.len(), 1);
        assert_eq!(m.tensors[0].shape, vec![2, 2]);
        assert_eq!(m.tensors[0].data_offsets, (0, 16));
        assert_eq!(m.metadata.get("format").map(String::as_str), Some("pt"));
        assert!(!m.metadata.contains_key("n"));
    }

    #[test]
    fn header_beyond_eof() {
        let mut buf = 100u64.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = parse(&buf, buf.len() as u64).unwrap_err();
        assert!(matches!(err, SafeTensorsError::HeaderBeyondEof { header_size: 100, .. }));

        let buf = u64::MAX.to_le_bytes();
        assert!(matches!(
            parse(&buf, 8),
            Err(SafeTensorsError::HeaderBeyondEof { .. })
        ));
    }

    #[test]
    fn rejects_non_object_and_bad_json() {
        let buf = file("[1,2]", 0);
        assert_eq!(parse(&buf, buf.len() as u64).unwrap_err(), SafeTensorsError::NotAnObject);
        let buf = file("{\"a\":", 0);
        assert!(matches!(
            parse(&buf, buf.len() as u64),
            Err(SafeTensorsError::InvalidJson(_))
        ));
    }

    #[test]
    fn invalid_fields_name_the_tensor() {
        let buf = file(r#"{"bad":{"dtype":"F32","shape":[-1],"data_offsets":[0,4]}}"#, 4);
        let err = parse(&buf, buf.len() as u64).unwrap_err();
        assert!(err.to_string().contains("'bad'"));

        let buf = file(r#"{"t":{"dtype":"F32","shape":[1],"data_offsets":[0]}}"#, 4);
        assert!(matches!(
            parse(&buf, buf.len() as u64),
            Err(SafeTensorsError::InvalidTensor { .. })
        ));

        let buf = file(r#"{"t":{"shape":[1],"data_offsets":[0,4]}}"#, 4);
        assert!(parse(&buf, buf.len() as u64).is_err());
    }

    #[test]
    fn too_small() {
        assert_eq!(parse(b"\x01\x02", 2).unwrap_err(), SafeTensorsError::TooSmall(2));
    }

    proptest::proptest! {
        #[test]
        fn never_panics(data in proptest::collection::vec(0u8..=255, 0..128)) {
            let _ = parse(&data, data.len() as u64);
        }
    }
}
