//! GGUF format types and constants.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cursor::Endian;
use crate::report::ReasonEntry;

/// Magic bytes at offset 0.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

pub const GGUF_VERSION_MIN: u32 = 1;
pub const GGUF_VERSION_MAX: u32 = 3;

/// Alignment used when `general.alignment` is absent.
pub const DEFAULT_ALIGNMENT: u64 = 32;

pub const ALIGNMENT_KEY: &str = "general.alignment";

//  Value type tag

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum GGUFValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GGUFValueType {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Uint8,
            1 => Self::Int8,
            2 => Self::Uint16,
            3 => Self::Int16,
            4 => Self::Uint32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::Uint64,
            11 => Self::Int64,
            12 => Self::Float64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "UInt8",
            Self::Int8 => "Int8",
            Self::Uint16 => "UInt16",
            Self::Int16 => "Int16",
            Self::Uint32 => "UInt32",
            Self::Int32 => "Int32",
            Self::Float32 => "Float32",
            Self::Bool => "Bool",
            Self::String => "String",
            Self::Array => "Array",
            Self::Uint64 => "UInt64",
            Self::Int64 => "Int64",
            Self::Float64 => "Float64",
        }
    }

    /// Width in bytes of fixed-size numeric types.
    pub fn numeric_width(self) -> Option<u64> {
        match self {
            Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::Bool | Self::String | Self::Array => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Int8
                | Self::Uint16
                | Self::Int16
                | Self::Uint32
                | Self::Int32
                | Self::Uint64
                | Self::Int64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }
}

impl std::fmt::Display for GGUFValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

//  Metadata KV

/// Undecoded KV payload borrowed from the mapped file.
///
/// Numbers stay raw so the validator can decode them with the file's
/// endianness; strings stay raw so invalid UTF-8 is reported, not rejected.
/// Arrays of fixed-width elements are kept as one slice.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue<'a> {
    Numeric(&'a [u8]),
    Str(&'a [u8]),
    Bool(bool),
    /// `raw.len()` is a multiple of the element width.
    NumericArray {
        element_type: GGUFValueType,
        raw: &'a [u8],
    },
    /// One byte per element; nonzero is true.
    BoolArray(&'a [u8]),
    /// Strings and nested arrays.
    Array {
        element_type: GGUFValueType,
        items: Vec<KvValue<'a>>,
    },
}

impl KvValue<'_> {
    /// Same value, given both sides share a declared type and endianness.
    /// Numbers compare bitwise; bools compare by truth.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::BoolArray(a), Self::BoolArray(b)) => {
                a.len() == b.len() && a.iter().zip(*b).all(|(x, y)| (*x != 0) == (*y != 0))
            }
            (
                Self::Array {
                    element_type: ta,
                    items: a,
                },
                Self::Array {
                    element_type: tb,
                    items: b,
                },
            ) => ta == tb && a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y)),
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GGUFMetadataKV<'a> {
    pub key: &'a str,
    /// Declared type; `Array` for arrays.
    pub value_type: GGUFValueType,
    pub value: KvValue<'a>,
    /// Absolute `[start, end)` of the whole record.
    pub start: u64,
    pub end: u64,
}

impl GGUFMetadataKV<'_> {
    pub fn is_array(&self) -> bool {
        self.value_type == GGUFValueType::Array
    }

    pub fn element_type(&self) -> GGUFValueType {
        match &self.value {
            KvValue::Array { element_type, .. } | KvValue::NumericArray { element_type, .. } => {
                *element_type
            }
            KvValue::BoolArray(_) => GGUFValueType::Bool,
            _ => self.value_type,
        }
    }
}

//  Tensor info

#[derive(Debug, Clone)]
pub struct GGUFTensorInfo<'a> {
    pub name: &'a str,
    pub dims: Vec<u64>,
    /// Raw GGML type code as stored on disk (signed on the wire).
    pub ggml_type: i32,
    /// Offset relative to the start of the data section.
    pub relative_offset: u64,
}

impl GGUFTensorInfo<'_> {
    /// Product of the dimensions; 0 for a dimensionless tensor, `None` on overflow.
    pub fn n_elements(&self) -> Option<u64> {
        if self.dims.is_empty() {
            return Some(0);
        }
        self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }
}

//  Model

#[derive(Debug, Clone)]
pub struct GGUFModel<'a> {
    pub version: u32,
    pub endian: Endian,
    /// Declared alignment; validity is checked by the verifier.
    pub alignment: u64,
    pub n_kv: u64,
    pub n_tensors: u64,
    /// KV records in file order, duplicates included.
    pub kv_entries: Vec<GGUFMetadataKV<'a>>,
    /// Key -> index of the last record with that key.
    pub kv: HashMap<&'a str, usize>,
    pub tensors: Vec<GGUFTensorInfo<'a>>,
    pub header_end_offset: u64,
    pub kv_end_offset: u64,
    pub tensor_info_end_offset: u64,
    pub data_offset: u64,
    pub file_size: u64,
}

impl<'a> GGUFModel<'a> {
    /// The authoritative entry for `key` (last one wins).
    pub fn get(&self, key: &str) -> Option<&GGUFMetadataKV<'a>> {
        self.kv.get(key).and_then(|&i| self.kv_entries.get(i))
    }
}

/// Outcome of the speculative version/endianness trials.
#[derive(Debug, Clone)]
pub struct GGUFParsed<'a> {
    pub model: Option<GGUFModel<'a>>,
    pub mismatches: Vec<ReasonEntry>,
}

/// Round `offset` up to a multiple of `alignment`. Zero alignment is a no-op.
pub fn align_up(offset: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(offset);
    }
    offset.div_ceil(alignment).checked_mul(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_codes() {
        for n in 0..=12 {
            assert!(GGUFValueType::from_i32(n).is_some(), "missing variant for {n}");
        }
        assert!(GGUFValueType::from_i32(13).is_none());
        assert!(GGUFValueType::from_i32(-1).is_none());
    }

    #[test]
    fn array_values_compare_by_content() {
        fn pairs(raw: &'static [u8]) -> KvValue<'static> {
            KvValue::NumericArray {
                element_type: GGUFValueType::Uint16,
                raw,
            }
        }
        assert!(pairs(&[1, 0, 2, 0]).same_as(&pairs(&[1, 0, 2, 0])));
        assert!(!pairs(&[1, 0, 2, 0]).same_as(&pairs(&[1, 0, 3, 0])));

        assert!(KvValue::BoolArray(&[1, 0]).same_as(&KvValue::BoolArray(&[7, 0])));
        assert!(!KvValue::BoolArray(&[1, 0]).same_as(&KvValue::BoolArray(&[1])));

        fn nested(s: &'static [u8]) -> KvValue<'static> {
            KvValue::Array {
                element_type: GGUFValueType::Array,
                items: vec![KvValue::BoolArray(s)],
            }
        }
        assert!(nested(&[1]).same_as(&nested(&[2])));
        assert!(!nested(&[1]).same_as(&nested(&[0])));
        assert!(!KvValue::Str(b"a").same_as(&KvValue::Numeric(b"a")));
    }

    #[test]
    fn align_up_cases() {
        assert_eq!(align_up(16, 32), Some(32));
        assert_eq!(align_up(32, 32), Some(32));
        assert_eq!(align_up(0, 32), Some(0));
        assert_eq!(align_up(10, 0), Some(10));
        assert_eq!(align_up(10, 3), Some(12));
        assert_eq!(align_up(u64::MAX - 1, 32), None);
    }

    #[test]
    fn n_elements_edge_cases() {
        let mut t = GGUFTensorInfo {
            name: "t",
            dims: vec![],
            ggml_type: 0,
            relative_offset: 0,
        };
        assert_eq!(t.n_elements(), Some(0));
        t.dims = vec![4, 8];
        assert_eq!(t.n_elements(), Some(32));
        t.dims = vec![u64::MAX, 2];
        assert_eq!(t.n_elements(), None);
    }
}
