//! KV metadata decoding, registry conformance and content scanning.
//!
//! Every record is checked in file order, duplicates included, and yields one
//! finding whose status is the worst of its sub-checks.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use thiserror::Error;
use tracing::debug;

use crate::cursor::Endian;
use crate::gguf::{GGUFMetadataKV, GGUFModel, GGUFValueType, KvValue};
use crate::kv_rules::{self, ExpectedType, KeyRule};
use crate::quant;
use crate::report::{CheckGroup, Finding, FindingContext, Status, SubCheck};

/// Case-insensitive substrings that flag prompt injection or template code execution.
pub const INJECTION_INDICATORS: &[&str] = &[
    "ignore all previous",
    "ignore previous instructions",
    "disregard all previous",
    "disregard previous instructions",
    "override instructions",
    "forget your instructions",
    "developer mode",
    "__globals__",
    "__builtins__",
    "__import__",
    "__subclasses__",
    "__mro__",
    "os.system",
    "os.popen",
    "subprocess",
    "eval(",
    "exec(",
];

pub const FILE_TYPE_KEY: &str = "general.file_type";
pub const ARCH_KEY: &str = "general.architecture";

/// Display cap for decoded strings.
const PREVIEW_CHARS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid UTF-8 after {valid_up_to} bytes")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("{ty} needs {expected} bytes, record holds {found}")]
    Width {
        ty: GGUFValueType,
        expected: u64,
        found: usize,
    },

    #[error("value of type {0} cannot hold raw numeric bytes")]
    NotNumeric(GGUFValueType),
}

/// A KV value decoded with the file's endianness.
#[derive(Debug, Clone)]
pub enum Decoded {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Elements are checked while decoding but not kept.
    Array {
        element_type: GGUFValueType,
        len: usize,
    },
}

impl PartialEq for Decoded {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unsigned(a), Self::Unsigned(b)) => a == b,
            (Self::Signed(a), Self::Signed(b)) => a == b,
            // Bitwise so that identical NaNs count as identical duplicates.
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (
                Self::Array {
                    element_type: ta,
                    len: la,
                },
                Self::Array {
                    element_type: tb,
                    len: lb,
                },
            ) => ta == tb && la == lb,
            _ => false,
        }
    }
}

impl Decoded {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Unsigned(v) => Some(v as f64),
            Self::Signed(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match *self {
            Self::Unsigned(v) => Some(v),
            Self::Signed(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Short, single-line rendering for report details.
    pub fn preview(&self) -> String {
        match self {
            Self::Unsigned(v) => v.to_string(),
            Self::Signed(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Str(s) => {
                let mut out: String = s.chars().take(PREVIEW_CHARS).collect();
                if s.chars().nth(PREVIEW_CHARS).is_some() {
                    out.push('…');
                }
                format!("{out:?}")
            }
            Self::Array { len, .. } => format!("array of {len} items"),
        }
    }
}

fn numeric(bytes: &[u8], ty: GGUFValueType, endian: Endian) -> Result<Decoded, DecodeError> {
    let width = ty.numeric_width().ok_or(DecodeError::NotNumeric(ty))?;
    if bytes.len() as u64 != width {
        return Err(DecodeError::Width {
            ty,
            expected: width,
            found: bytes.len(),
        });
    }
    let mut raw = [0u8; 8];
    // Place the value so that from_{le,be}_bytes on the full 8 bytes sees it
    // at the right significance, then narrow.
    let wide = match endian {
        Endian::Little => {
            raw[..bytes.len()].copy_from_slice(bytes);
            u64::from_le_bytes(raw)
        }
        Endian::Big => {
            raw[8 - bytes.len()..].copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        }
    };
    Ok(match ty {
        GGUFValueType::Uint8 | GGUFValueType::Uint16 | GGUFValueType::Uint32 | GGUFValueType::Uint64 => {
            Decoded::Unsigned(wide)
        }
        GGUFValueType::Int8 => Decoded::Signed(i64::from(wide as u8 as i8)),
        GGUFValueType::Int16 => Decoded::Signed(i64::from(wide as u16 as i16)),
        GGUFValueType::Int32 => Decoded::Signed(i64::from(wide as u32 as i32)),
        GGUFValueType::Int64 => Decoded::Signed(wide as i64),
        GGUFValueType::Float32 => Decoded::Float(f64::from(f32::from_bits(wide as u32))),
        GGUFValueType::Float64 => Decoded::Float(f64::from_bits(wide)),
        GGUFValueType::Bool | GGUFValueType::String | GGUFValueType::Array => {
            return Err(DecodeError::NotNumeric(ty));
        }
    })
}

fn utf8(bytes: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })
}

/// Decode `value`, whose scalar (or element) type is `ty`.
///
/// Array elements are validated one at a time and dropped.
pub fn decode(value: &KvValue<'_>, ty: GGUFValueType, endian: Endian) -> Result<Decoded, DecodeError> {
    match value {
        KvValue::Numeric(bytes) => numeric(bytes, ty, endian),
        KvValue::Bool(b) => Ok(Decoded::Bool(*b)),
        KvValue::Str(bytes) => utf8(bytes).map(|s| Decoded::Str(s.to_string())),
        KvValue::NumericArray { element_type, raw } => {
            let width = element_type
                .numeric_width()
                .ok_or(DecodeError::NotNumeric(*element_type))?;
            if raw.len() as u64 % width != 0 {
                return Err(DecodeError::Width {
                    ty: *element_type,
                    expected: width,
                    found: raw.len(),
                });
            }
            Ok(Decoded::Array {
                element_type: *element_type,
                len: raw.len() / width as usize,
            })
        }
        KvValue::BoolArray(raw) => Ok(Decoded::Array {
            element_type: GGUFValueType::Bool,
            len: raw.len(),
        }),
        KvValue::Array {
            element_type,
            items,
        } => {
            for item in items {
                match item {
                    KvValue::Str(bytes) => {
                        utf8(bytes)?;
                    }
                    other => {
                        decode(other, *element_type, endian)?;
                    }
                }
            }
            Ok(Decoded::Array {
                element_type: *element_type,
                len: items.len(),
            })
        }
    }
}

pub fn decode_entry(entry: &GGUFMetadataKV<'_>, endian: Endian) -> Result<Decoded, DecodeError> {
    decode(&entry.value, entry.value_type, endian)
}

/// Keys whose string values are rendered as prompt templates.
pub fn is_template_key(key: &str) -> bool {
    key.contains("chat_template") || key.ends_with(".template")
}

/// Indicators found in `text`, compared case-insensitively.
pub fn scan_text<'i>(text: &str, indicators: impl IntoIterator<Item = &'i str>) -> Vec<&'i str> {
    let haystack = text.to_lowercase();
    indicators
        .into_iter()
        .filter(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
        .collect()
}

/// Raw string payloads of a value, lossily decoded for scanning.
fn raw_texts(value: &KvValue<'_>) -> Vec<String> {
    match value {
        KvValue::Str(bytes) => vec![String::from_utf8_lossy(bytes).into_owned()],
        KvValue::Array { items, .. } => items.iter().flat_map(raw_texts).collect(),
        KvValue::Numeric(_)
        | KvValue::Bool(_)
        | KvValue::NumericArray { .. }
        | KvValue::BoolArray(_) => Vec::new(),
    }
}

/// Pretty-print `text` when it holds a JSON object; `None` otherwise.
fn pretty_json(text: &str) -> Option<String> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
}

/// Duplicate bookkeeping for one key: its first record, how many records
/// were seen, and whether all of them decoded and matched the first.
struct Seen<'m, 'a> {
    first: &'m GGUFMetadataKV<'a>,
    count: usize,
    consistent: bool,
}

/// Same declared type and same value.
fn same_value(a: &GGUFMetadataKV<'_>, b: &GGUFMetadataKV<'_>) -> bool {
    a.value_type == b.value_type
        && a.element_type() == b.element_type()
        && a.value.same_as(&b.value)
}

/// Runs the per-key checks over a model's KV store.
#[derive(Debug, Clone, Default)]
pub struct KvValidator {
    extra_indicators: Vec<String>,
}

impl KvValidator {
    pub fn new(extra_indicators: Vec<String>) -> Self {
        Self { extra_indicators }
    }

    fn indicators(&self) -> impl Iterator<Item = &str> {
        INJECTION_INDICATORS
            .iter()
            .copied()
            .chain(self.extra_indicators.iter().map(String::as_str))
    }

    pub fn validate(&self, model: &GGUFModel<'_>) -> Vec<Finding> {
        let arch = model
            .get(ARCH_KEY)
            .and_then(|e| match decode_entry(e, model.endian) {
                Ok(Decoded::Str(s)) => Some(s),
                _ => None,
            })
            .unwrap_or_else(|| kv_rules::DEFAULT_ARCH.to_string());

        let mut out = Vec::with_capacity(model.kv_entries.len() + 1);
        let mut seen: HashMap<&str, Seen<'_, '_>> = HashMap::new();

        for entry in &model.kv_entries {
            let decoded = decode_entry(entry, model.endian);
            let mut subs = Vec::new();

            subs.push(self.check_key_name(entry.key));
            subs.push(match &decoded {
                Ok(v) => SubCheck::new("decode", Status::Pass, format!("value: {}", v.preview())),
                Err(e) => SubCheck::new("decode", Status::Fail, format!("decode error: {e}")),
            });

            match kv_rules::lookup(entry.key, &arch) {
                Some(rule) => subs.extend(conformance(rule, entry, &decoded)),
                None => subs.push(SubCheck::new(
                    "registry",
                    Status::Warn,
                    "key not in known-key registry",
                )),
            }

            match seen.entry(entry.key) {
                Entry::Occupied(mut slot) => {
                    let prev = slot.get_mut();
                    let identical = prev.consistent && decoded.is_ok() && same_value(prev.first, entry);
                    subs.push(duplicate_check(prev.count, identical));
                    prev.consistent = identical;
                    prev.count += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(Seen {
                        first: entry,
                        count: 1,
                        consistent: decoded.is_ok(),
                    });
                }
            }

            let mut rendered = None;
            if is_template_key(entry.key) {
                let texts = raw_texts(&entry.value);
                rendered = texts.iter().find_map(|t| pretty_json(t));
                subs.push(self.content_scan(&texts));
            }

            if entry.key == FILE_TYPE_KEY {
                subs.push(file_type_check(&decoded));
            }

            out.push(kv_finding(entry, subs, rendered));
        }

        for rule in kv_rules::required_keys() {
            if model.get(rule.key).is_none() {
                out.push(Finding::new(
                    CheckGroup::KvAnalysis,
                    format!("required_key:{}", rule.key),
                    Status::Warn,
                    "required key is missing",
                ));
            }
        }

        debug!(entries = model.kv_entries.len(), arch = %arch, "KV validation complete");
        out
    }

    fn check_key_name(&self, key: &str) -> SubCheck {
        if kv_rules::key_name_regex().is_match(key) {
            SubCheck::new("key_name", Status::Pass, "well-formed key name")
        } else {
            SubCheck::new(
                "key_name",
                Status::Warn,
                format!("key name does not match {}", kv_rules::KEY_NAME_PATTERN),
            )
        }
    }

    fn content_scan(&self, texts: &[String]) -> SubCheck {
        let mut hits: Vec<&str> = Vec::new();
        for text in texts {
            for hit in scan_text(text, self.indicators()) {
                if !hits.contains(&hit) {
                    hits.push(hit);
                }
            }
        }
        if hits.is_empty() {
            SubCheck::new("content_scan", Status::Pass, "no injection indicators")
        } else {
            let named = hits
                .iter()
                .map(|h| format!("'{h}'"))
                .collect::<Vec<_>>()
                .join(", ");
            SubCheck::new(
                "content_scan",
                Status::Fail,
                format!("suspicious content: {named}"),
            )
        }
    }
}

/// Registry type, range, multiple-of and pattern checks.
fn conformance(
    rule: &KeyRule,
    entry: &GGUFMetadataKV<'_>,
    decoded: &Result<Decoded, DecodeError>,
) -> Vec<SubCheck> {
    let type_ok = match rule.expected {
        ExpectedType::Array => entry.is_array(),
        ExpectedType::Scalar(t) => !entry.is_array() && entry.value_type == t,
    };
    let found = if entry.is_array() {
        format!("{} array", entry.element_type())
    } else {
        entry.value_type.to_string()
    };
    if !type_ok {
        return vec![SubCheck::new(
            "registry_type",
            Status::Fail,
            format!("expected {}, found {found}", rule.expected),
        )];
    }
    let mut subs = vec![SubCheck::new(
        "registry_type",
        Status::Pass,
        format!("type {found} matches registry"),
    )];

    let Ok(value) = decoded else {
        return subs;
    };

    if let Some(v) = value.as_f64() {
        let mut problems = Vec::new();
        if let Some(min) = rule.min {
            if v < min {
                problems.push(format!("{v} < min {min}"));
            }
        }
        if let Some(max) = rule.max {
            if v > max {
                problems.push(format!("{v} > max {max}"));
            }
        }
        if let Some(m) = rule.multiple_of {
            match value.as_unsigned() {
                Some(u) if m != 0 && u % m == 0 => {}
                _ => problems.push(format!("{v} is not a multiple of {m}")),
            }
        }
        if rule.min.is_some() || rule.max.is_some() || rule.multiple_of.is_some() {
            subs.push(if problems.is_empty() {
                SubCheck::new("registry_range", Status::Pass, "within registry range")
            } else {
                SubCheck::new("registry_range", Status::Fail, problems.join("; "))
            });
        }
    }

    if let (Some(re), Decoded::Str(s)) = (rule.regex(), value) {
        subs.push(if re.is_match(s) {
            SubCheck::new("registry_pattern", Status::Pass, format!("matches {re}"))
        } else {
            SubCheck::new(
                "registry_pattern",
                Status::Fail,
                format!("{} does not match {re}", value.preview()),
            )
        });
    }
    subs
}

/// `identical` holds when every earlier record has this one's type and value.
fn duplicate_check(earlier: usize, identical: bool) -> SubCheck {
    if identical {
        SubCheck::new(
            "duplicate",
            Status::Warn,
            format!("redundant duplicate ({earlier} earlier, same value)"),
        )
    } else {
        SubCheck::new(
            "duplicate",
            Status::Fail,
            format!(
                "conflicting duplicate ({earlier} earlier, values differ); authoritative value is ambiguous"
            ),
        )
    }
}

fn file_type_check(decoded: &Result<Decoded, DecodeError>) -> SubCheck {
    match decoded.as_ref().ok().and_then(Decoded::as_unsigned) {
        Some(code) => match quant::file_type_name(code) {
            Some(name) => SubCheck::new("file_type", Status::Pass, format!("{code} ({name})")),
            None => SubCheck::new(
                "file_type",
                Status::Fail,
                format!("unknown file_type code {code}"),
            ),
        },
        None => SubCheck::new(
            "file_type",
            Status::Fail,
            "general.file_type is not a non-negative integer",
        ),
    }
}

fn kv_finding(entry: &GGUFMetadataKV<'_>, subs: Vec<SubCheck>, rendered: Option<String>) -> Finding {
    let status = subs
        .iter()
        .map(|s| s.status)
        .max()
        .unwrap_or(Status::Pass);
    let details = if status == Status::Pass {
        "all sub-checks passed".to_string()
    } else {
        subs.iter()
            .filter(|s| s.status == status)
            .map(|s| format!("{}: {}", s.name, s.details))
            .collect::<Vec<_>>()
            .join("; ")
    };
    Finding::new(CheckGroup::KvAnalysis, entry.key, status, details).with_context(
        FindingContext::KvEntry {
            key: entry.key.to_string(),
            value_type: entry.value_type.to_string(),
            is_array: entry.is_array(),
            start: entry.start,
            end: entry.end,
            sub_checks: subs,
            rendered,
        },
    )
}
