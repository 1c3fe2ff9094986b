//! Registry of well-known GGUF metadata keys and their constraints.
//!
//! Keys of the architecture family are written as `{arch}.<suffix>` and match
//! whatever `general.architecture` declares (`llama` when it is absent).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::gguf::GGUFValueType;

/// Key names must match this.
pub const KEY_NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9._-]*$";

pub const ARCH_PLACEHOLDER: &str = "{arch}.";

/// Architecture assumed when `general.architecture` is missing or unreadable.
pub const DEFAULT_ARCH: &str = "llama";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedType {
    Scalar(GGUFValueType),
    Array,
}

impl std::fmt::Display for ExpectedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(t) => write!(f, "{t}"),
            Self::Array => f.write_str("Array"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyRule {
    pub key: &'static str,
    pub expected: ExpectedType,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub multiple_of: Option<u64>,
    pub pattern: Option<&'static str>,
    pub required: bool,
}

impl KeyRule {
    const fn new(key: &'static str, expected: ExpectedType) -> Self {
        Self {
            key,
            expected,
            min: None,
            max: None,
            multiple_of: None,
            pattern: None,
            required: false,
        }
    }

    const fn min(mut self, v: f64) -> Self {
        self.min = Some(v);
        self
    }

    const fn max(mut self, v: f64) -> Self {
        self.max = Some(v);
        self
    }

    const fn multiple_of(mut self, v: u64) -> Self {
        self.multiple_of = Some(v);
        self
    }

    const fn pattern(mut self, p: &'static str) -> Self {
        self.pattern = Some(p);
        self
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Compiled form of `pattern`, cached for the process lifetime.
    pub fn regex(&self) -> Option<&'static Regex> {
        let p = self.pattern?;
        rule_regexes().get(p)
    }
}

const U32: ExpectedType = ExpectedType::Scalar(GGUFValueType::Uint32);
const F32: ExpectedType = ExpectedType::Scalar(GGUFValueType::Float32);
const STR: ExpectedType = ExpectedType::Scalar(GGUFValueType::String);
const ARR: ExpectedType = ExpectedType::Array;

pub static KNOWN_KEYS: &[KeyRule] = &[
    // General
    KeyRule::new("general.architecture", STR)
        .pattern(r"^[a-z0-9]+$")
        .required(),
    KeyRule::new("general.alignment", U32).min(8.0).multiple_of(8),
    KeyRule::new("general.quantization_version", U32).min(1.0),
    KeyRule::new("general.file_type", U32),
    KeyRule::new("general.name", STR),
    // Architecture family
    KeyRule::new("{arch}.context_length", U32).min(1.0),
    KeyRule::new("{arch}.embedding_length", U32).min(1.0),
    KeyRule::new("{arch}.block_count", U32).min(1.0),
    KeyRule::new("{arch}.feed_forward_length", U32).min(1.0),
    KeyRule::new("{arch}.attention.head_count", U32).min(1.0),
    KeyRule::new("{arch}.attention.head_count_kv", U32).min(1.0),
    KeyRule::new("{arch}.rope.dimension_count", U32).min(1.0),
    KeyRule::new("{arch}.attention.layer_norm_rms_epsilon", F32)
        .min(1e-9)
        .max(1e-2),
    KeyRule::new("{arch}.rope.scale", F32).min(1e-9),
    KeyRule::new("{arch}.expert_count", U32).min(1.0),
    KeyRule::new("{arch}.expert_used_count", U32).min(1.0),
    // Tokenizer
    KeyRule::new("tokenizer.ggml.model", STR),
    KeyRule::new("tokenizer.ggml.tokens", ARR),
    KeyRule::new("tokenizer.ggml.scores", ARR),
    KeyRule::new("tokenizer.ggml.merges", ARR),
    KeyRule::new("tokenizer.ggml.bos_token_id", U32),
    KeyRule::new("tokenizer.ggml.eos_token_id", U32),
    KeyRule::new("tokenizer.chat_template", STR),
];

/// Find the rule for `key`, resolving `{arch}.` against the declared architecture.
pub fn lookup(key: &str, arch: &str) -> Option<&'static KeyRule> {
    if let Some(rule) = KNOWN_KEYS.iter().find(|r| r.key == key) {
        return Some(rule);
    }
    let suffix = key.strip_prefix(arch)?.strip_prefix('.')?;
    KNOWN_KEYS
        .iter()
        .find(|r| r.key.strip_prefix(ARCH_PLACEHOLDER) == Some(suffix))
}

pub fn required_keys() -> impl Iterator<Item = &'static KeyRule> {
    KNOWN_KEYS.iter().filter(|r| r.required)
}

fn re(s: &str) -> Regex {
    Regex::new(s).expect("internal built-in regex must compile")
}

pub fn key_name_regex() -> &'static Regex {
    static KEY_NAME: OnceLock<Regex> = OnceLock::new();
    KEY_NAME.get_or_init(|| re(KEY_NAME_PATTERN))
}

fn rule_regexes() -> &'static HashMap<&'static str, Regex> {
    static RULES: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        KNOWN_KEYS
            .iter()
            .filter_map(|r| r.pattern)
            .map(|p| (p, re(p)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_arch_relative_lookup() {
        assert_eq!(
            lookup("general.alignment", "llama").map(|r| r.multiple_of),
            Some(Some(8))
        );
        let rule = lookup("qwen2.context_length", "qwen2").unwrap();
        assert_eq!(rule.key, "{arch}.context_length");
        assert!(lookup("qwen2.context_length", "llama").is_none());
        assert!(lookup("llama.attention.layer_norm_rms_epsilon", "llama").is_some());
        assert!(lookup("general.unknown_thing", "llama").is_none());
        assert!(lookup("llamax.context_length", "llama").is_none());
    }

    #[test]
    fn key_name_pattern() {
        let re = key_name_regex();
        assert!(re.is_match("general.name"));
        assert!(re.is_match("0a_b-c"));
        assert!(!re.is_match("General.name"));
        assert!(!re.is_match(".hidden"));
        assert!(!re.is_match(""));
    }

    #[test]
    fn registry_patterns_compile() {
        let arch = lookup("general.architecture", "llama").unwrap();
        assert!(arch.required);
        let re = arch.regex().unwrap();
        assert!(re.is_match("llama"));
        assert!(!re.is_match("Llama 2"));
        assert_eq!(required_keys().count(), 1);
    }
}
