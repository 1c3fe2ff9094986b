//! Speculative GGUF reader: tries every plausible version/endianness.
//!
//! The version field is read both ways. Each plausible `(version, endian)`
//! pair gets a full, stateless decode; the first one that succeeds wins and
//! every rejection is kept as a [`ReasonEntry`].

use std::collections::HashMap;

use tracing::debug;

use super::types::*;
use crate::cursor::{ByteCursor, Endian, LengthWidth};
use crate::error::{GgufError, Result};
use crate::report::ReasonEntry;

/// Arrays of arrays deeper than this are rejected.
const MAX_ARRAY_DEPTH: usize = 8;

/// Parse `buf` as GGUF.
///
/// Errors only when the buffer is not GGUF at all (too small, wrong magic).
/// Everything else ends up in `GGUFParsed::mismatches`.
pub fn parse(buf: &[u8], file_size: u64) -> Result<GGUFParsed<'_>> {
    if buf.len() < 8 {
        return Err(GgufError::TooSmall(buf.len()));
    }
    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let raw = [buf[4], buf[5], buf[6], buf[7]];
    let version_le = u32::from_le_bytes(raw);
    let version_be = u32::from_be_bytes(raw);

    let mut mismatches = Vec::new();
    let mut tried = false;
    for (endian, version) in [(Endian::Little, version_le), (Endian::Big, version_be)] {
        if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
            continue;
        }
        tried = true;
        match parse_hypothesis(buf, file_size, version, endian) {
            Ok(model) => {
                debug!(version, %endian, tensors = model.tensors.len(), kv = model.kv_entries.len(), "GGUF hypothesis accepted");
                return Ok(GGUFParsed {
                    model: Some(model),
                    mismatches,
                });
            }
            Err(e) => {
                debug!(version, %endian, error = %e, "GGUF hypothesis rejected");
                mismatches.push(ReasonEntry::new(
                    format!("gguf v{version}-{endian}"),
                    e.to_string(),
                ));
            }
        }
    }

    if !tried {
        mismatches.push(ReasonEntry::new(
            format!("gguf LE={version_le}/BE={version_be}"),
            "unsupported version field; not in {1,2,3}",
        ));
    }
    Ok(GGUFParsed {
        model: None,
        mismatches,
    })
}

/// Decode the whole header assuming `version` and `endian`.
pub fn parse_hypothesis(
    buf: &[u8],
    file_size: u64,
    version: u32,
    endian: Endian,
) -> Result<GGUFModel<'_>> {
    let width = if version == 1 {
        LengthWidth::U32
    } else {
        LengthWidth::U64
    };
    let mut c = ByteCursor::at(buf, 8);

    //  Counts: n_tensors, then n_kv
    let (n_tensors, n_kv) = match width {
        LengthWidth::U32 => (
            u64::from(c.read_u32(endian)?),
            u64::from(c.read_u32(endian)?),
        ),
        LengthWidth::U64 => {
            let t = c.read_i64(endian)?;
            let k = c.read_i64(endian)?;
            (non_negative("n_tensors", t)?, non_negative("n_kv", k)?)
        }
    };
    let header_end_offset = c.position() as u64;

    //  KV store
    let mut kv_entries = Vec::with_capacity(capped(n_kv, c.remaining()));
    let mut kv = HashMap::new();
    for _ in 0..n_kv {
        let entry = read_kv(&mut c, endian, width)?;
        kv.insert(entry.key, kv_entries.len());
        kv_entries.push(entry);
    }
    let kv_end_offset = c.position() as u64;

    let alignment = kv
        .get(ALIGNMENT_KEY)
        .and_then(|&i| declared_alignment(&kv_entries[i], endian))
        .unwrap_or(DEFAULT_ALIGNMENT);

    //  Tensor infos
    let mut tensors = Vec::with_capacity(capped(n_tensors, c.remaining()));
    for _ in 0..n_tensors {
        tensors.push(read_tensor_info(&mut c, endian, width)?);
    }
    let tensor_info_end_offset = c.position() as u64;

    let data_offset = align_up(tensor_info_end_offset, alignment)
        .ok_or(GgufError::Overflow("data section offset"))?;
    if data_offset > file_size {
        return Err(GgufError::DataOffsetBeyondEof {
            data_offset,
            file_size,
        });
    }

    Ok(GGUFModel {
        version,
        endian,
        alignment,
        n_kv,
        n_tensors,
        kv_entries,
        kv,
        tensors,
        header_end_offset,
        kv_end_offset,
        tensor_info_end_offset,
        data_offset,
        file_size,
    })
}

//  Internal helpers

fn non_negative(field: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| GgufError::NegativeCount { field, value })
}

/// Pre-allocation bound: never trust a declared count beyond the bytes left.
fn capped(count: u64, remaining: usize) -> usize {
    count.min(remaining as u64).min(4096) as usize
}

fn read_str<'a>(
    c: &mut ByteCursor<'a>,
    endian: Endian,
    width: LengthWidth,
    what: &'static str,
) -> Result<&'a str> {
    let offset = c.position();
    let bytes = c.read_length_prefixed(width, endian)?;
    std::str::from_utf8(bytes).map_err(|_| GgufError::InvalidUtf8 { what, offset })
}

fn read_type(c: &mut ByteCursor<'_>, endian: Endian) -> Result<GGUFValueType> {
    let code = c.read_i32(endian)?;
    GGUFValueType::from_i32(code).ok_or(GgufError::InvalidValueType(code))
}

fn read_kv<'a>(
    c: &mut ByteCursor<'a>,
    endian: Endian,
    width: LengthWidth,
) -> Result<GGUFMetadataKV<'a>> {
    let start = c.position() as u64;
    let key = read_str(c, endian, width, "key")?;
    let value_type = read_type(c, endian)?;
    let value = read_value(c, value_type, endian, width, 0)?;
    Ok(GGUFMetadataKV {
        key,
        value_type,
        value,
        start,
        end: c.position() as u64,
    })
}

fn read_value<'a>(
    c: &mut ByteCursor<'a>,
    vtype: GGUFValueType,
    endian: Endian,
    width: LengthWidth,
    depth: usize,
) -> Result<KvValue<'a>> {
    match vtype {
        GGUFValueType::Uint8
        | GGUFValueType::Int8
        | GGUFValueType::Uint16
        | GGUFValueType::Int16
        | GGUFValueType::Uint32
        | GGUFValueType::Int32
        | GGUFValueType::Float32
        | GGUFValueType::Uint64
        | GGUFValueType::Int64
        | GGUFValueType::Float64 => {
            let n = vtype.numeric_width().unwrap_or(0);
            Ok(KvValue::Numeric(c.read_bytes(n)?))
        }
        GGUFValueType::Bool => Ok(KvValue::Bool(c.read_u8()? != 0)),
        GGUFValueType::String => Ok(KvValue::Str(c.read_length_prefixed(width, endian)?)),
        GGUFValueType::Array => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(GgufError::NestingTooDeep(MAX_ARRAY_DEPTH));
            }
            let element_type = read_type(c, endian)?;
            let count = c.read_len(width, endian)?;
            if let Some(w) = element_type.numeric_width() {
                let n = count
                    .checked_mul(w)
                    .ok_or(GgufError::Overflow("array byte length"))?;
                return Ok(KvValue::NumericArray {
                    element_type,
                    raw: c.read_bytes(n)?,
                });
            }
            if element_type == GGUFValueType::Bool {
                return Ok(KvValue::BoolArray(c.read_bytes(count)?));
            }
            // Every element consumes at least one byte.
            let mut items = Vec::with_capacity(capped(count, c.remaining()));
            for _ in 0..count {
                items.push(read_value(c, element_type, endian, width, depth + 1)?);
            }
            Ok(KvValue::Array {
                element_type,
                items,
            })
        }
    }
}

/// `general.alignment` counts only when it is a 4- or 8-byte integer scalar.
fn declared_alignment(entry: &GGUFMetadataKV<'_>, endian: Endian) -> Option<u64> {
    if !entry.value_type.is_integer() {
        return None;
    }
    match entry.value {
        KvValue::Numeric(b) if b.len() == 4 => {
            let raw = [b[0], b[1], b[2], b[3]];
            Some(u64::from(match endian {
                Endian::Little => u32::from_le_bytes(raw),
                Endian::Big => u32::from_be_bytes(raw),
            }))
        }
        KvValue::Numeric(b) if b.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Some(match endian {
                Endian::Little => u64::from_le_bytes(raw),
                Endian::Big => u64::from_be_bytes(raw),
            })
        }
        _ => None,
    }
}

fn read_tensor_info<'a>(
    c: &mut ByteCursor<'a>,
    endian: Endian,
    width: LengthWidth,
) -> Result<GGUFTensorInfo<'a>> {
    let name = read_str(c, endian, width, "tensor name")?;
    let n_dims = c.read_u32(endian)?;
    let mut dims = Vec::with_capacity(capped(u64::from(n_dims), c.remaining() / 8));
    for _ in 0..n_dims {
        // 64-bit dims regardless of header version.
        dims.push(c.read_u64(endian)?);
    }
    let ggml_type = c.read_i32(endian)?;
    let relative_offset = c.read_u64(endian)?;
    Ok(GGUFTensorInfo {
        name,
        dims,
        ggml_type,
        relative_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal GGUF writer for tests.
    struct Writer {
        buf: Vec<u8>,
        endian: Endian,
        wide: bool,
    }

    impl Writer {
        fn new(version: u32, endian: Endian) -> Self {
            let mut w = Self {
                buf: b"GGUF".to_vec(),
                endian,
                wide: version != 1,
            };
            w.u32(version);
            w
        }
        fn u32(&mut self, v: u32) {
            match self.endian {
                Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
                Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            }
        }
        fn u64(&mut self, v: u64) {
            match self.endian {
                Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
                Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            }
        }
        fn count(&mut self, v: u64) {
            if self.wide { self.u64(v) } else { self.u32(v as u32) }
        }
        fn str(&mut self, s: &[u8]) {
            self.count(s.len() as u64);
            self.buf.extend_from_slice(s);
        }
        fn kv_u32(&mut self, key: &str, v: u32) {
            self.str(key.as_bytes());
            self.u32(4);
            self.u32(v);
        }
        fn tensor(&mut self, name: &str, dims: &[u64], ty: u32, off: u64) {
            self.str(name.as_bytes());
            self.u32(dims.len() as u32);
            for &d in dims {
                self.u64(d);
            }
            self.u32(ty);
            self.u64(off);
        }
    }

    #[test]
    fn empty_v1_le() {
        let mut w = Writer::new(1, Endian::Little);
        w.count(0);
        w.count(0);
        w.buf.resize(64, 0);
        let parsed = parse(&w.buf, 64).unwrap();
        let m = parsed.model.unwrap();
        assert_eq!(m.version, 1);
        assert_eq!(m.endian, Endian::Little);
        assert_eq!(m.header_end_offset, 16);
        assert_eq!(m.tensor_info_end_offset, 16);
        assert_eq!(m.data_offset, 32);
        assert!(parsed.mismatches.is_empty());
    }

    #[test]
    fn big_endian_v3_with_alignment_and_tensor() {
        let mut w = Writer::new(3, Endian::Big);
        w.count(1);
        w.count(1);
        w.kv_u32("general.alignment", 64);
        w.tensor("w", &[32], 0, 0);
        let end = w.buf.len();
        w.buf.resize(end.div_ceil(64) * 64 + 128, 0);
        let size = w.buf.len() as u64;
        let m = parse(&w.buf, size).unwrap().model.unwrap();
        assert_eq!(m.endian, Endian::Big);
        assert_eq!(m.alignment, 64);
        assert_eq!(m.data_offset % 64, 0);
        assert_eq!(m.tensors[0].dims, vec![32]);
        assert_eq!(m.get("general.alignment").unwrap().start, 24);
    }

    #[test]
    fn bad_magic_is_hard_error() {
        let err = parse(b"GGML\x01\x00\x00\x00", 8).unwrap_err();
        assert!(matches!(err, GgufError::InvalidMagic(_)));
        assert!(matches!(parse(b"GGUF", 4), Err(GgufError::TooSmall(4))));
    }

    #[test]
    fn implausible_version_reports_both_readings() {
        let mut buf = b"GGUF".to_vec();
        buf.extend_from_slice(&7u32.to_le_bytes());
        let parsed = parse(&buf, 8).unwrap();
        assert!(parsed.model.is_none());
        assert_eq!(parsed.mismatches.len(), 1);
        assert_eq!(parsed.mismatches[0].candidate_spec, "gguf LE=7/BE=117440512");
        assert!(parsed.mismatches[0].reason.contains("not in {1,2,3}"));
    }

    #[test]
    fn truncated_kv_is_a_mismatch() {
        let mut w = Writer::new(2, Endian::Little);
        w.count(0);
        w.count(3);
        w.kv_u32("a.b", 1);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert!(parsed.model.is_none());
        assert_eq!(parsed.mismatches[0].candidate_spec, "gguf v2-LE");
        assert!(parsed.mismatches[0].reason.starts_with("truncated"));
    }

    #[test]
    fn negative_count_rejected() {
        let mut w = Writer::new(3, Endian::Little);
        w.u64(u64::MAX);
        w.count(0);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert!(parsed.mismatches[0].reason.contains("negative count"));
    }

    #[test]
    fn unknown_value_type_rejected() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(1);
        w.str(b"x");
        w.u32(99);
        w.u32(0);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert_eq!(parsed.mismatches[0].reason, "unknown GGUF value type 99");
    }

    #[test]
    fn data_offset_beyond_eof() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(0);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert!(parsed.model.is_none());
        assert!(parsed.mismatches[0].reason.contains("beyond end of file"));
    }

    #[test]
    fn arrays_and_duplicates_preserved_in_order() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(3);
        w.kv_u32("k", 1);
        // array of two strings
        w.str(b"tokenizer.ggml.tokens");
        w.u32(9);
        w.u32(8);
        w.count(2);
        w.str(b"a");
        w.str(b"bc");
        w.kv_u32("k", 2);
        w.buf.resize(w.buf.len() + 64, 0);
        let size = w.buf.len() as u64;
        let m = parse(&w.buf, size).unwrap().model.unwrap();
        assert_eq!(m.kv_entries.len(), 3);
        assert_eq!(m.kv.len(), 2);
        assert_eq!(m.get("k").unwrap().value, KvValue::Numeric(&2u32.to_le_bytes()));
        let tokens = m.get("tokenizer.ggml.tokens").unwrap();
        assert!(tokens.is_array());
        assert_eq!(tokens.element_type(), GGUFValueType::String);
        match &tokens.value {
            KvValue::Array { items, .. } => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixed_width_arrays_stay_borrowed() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(2);
        w.str(b"ids");
        w.u32(9);
        w.u32(4);
        w.count(3);
        for v in [7u32, 8, 9] {
            w.u32(v);
        }
        w.str(b"flags");
        w.u32(9);
        w.u32(7);
        w.count(2);
        w.buf.extend_from_slice(&[1, 0]);
        w.buf.resize(w.buf.len() + 64, 0);
        let size = w.buf.len() as u64;
        let m = parse(&w.buf, size).unwrap().model.unwrap();

        let ids = m.get("ids").unwrap();
        assert_eq!(ids.element_type(), GGUFValueType::Uint32);
        match ids.value {
            KvValue::NumericArray { raw, .. } => assert_eq!(raw.len(), 12),
            ref other => panic!("unexpected {other:?}"),
        }
        let flags = m.get("flags").unwrap();
        assert_eq!(flags.value, KvValue::BoolArray(&[1, 0]));
        assert_eq!(flags.element_type(), GGUFValueType::Bool);
    }

    #[test]
    fn oversized_numeric_array_is_rejected_without_allocating() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(1);
        w.str(b"big");
        w.u32(9);
        w.u32(12);
        w.count(u64::MAX / 4);
        w.buf.resize(w.buf.len() + 64, 0);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert!(parsed.model.is_none());
        assert!(parsed.mismatches[0].reason.contains("overflow"), "{}", parsed.mismatches[0].reason);
    }

    #[test]
    fn tensor_type_code_is_signed() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(1);
        w.count(0);
        w.tensor("t", &[4], u32::MAX, 0);
        w.buf.resize(w.buf.len() + 64, 0);
        let size = w.buf.len() as u64;
        let m = parse(&w.buf, size).unwrap().model.unwrap();
        assert_eq!(m.tensors[0].ggml_type, -1);
        assert_eq!(crate::quant::type_label(m.tensors[0].ggml_type), "UNKNOWN(-1)");
    }

    #[test]
    fn deep_array_nesting_rejected() {
        let mut w = Writer::new(3, Endian::Little);
        w.count(0);
        w.count(1);
        w.str(b"nest");
        w.u32(9);
        for _ in 0..MAX_ARRAY_DEPTH + 1 {
            w.u32(9);
            w.count(1);
        }
        w.buf.resize(w.buf.len() + 64, 0);
        let size = w.buf.len() as u64;
        let parsed = parse(&w.buf, size).unwrap();
        assert!(parsed.mismatches[0].reason.contains("nesting"));
    }

    proptest::proptest! {
        #[test]
        fn never_panics(tail in proptest::collection::vec(0u8..=255, 0..256), version in 0u32..5) {
            let mut buf = b"GGUF".to_vec();
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&tail);
            let size = buf.len() as u64;
            let _ = parse(&buf, size);
        }

        #[test]
        fn non_gguf_magic_is_hard_error(data in proptest::collection::vec(0u8..=255, 8..64)) {
            if &data[0..4] != b"GGUF" {
                proptest::prop_assert!(parse(&data, data.len() as u64).is_err());
            }
        }
    }
}
