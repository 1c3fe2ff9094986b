//! Forensic inspection of GGUF and SafeTensors model files.
//!
//! Nothing in the input is trusted. The parsers work over a borrowed,
//! read-only buffer plus the real file size, and every declared region is
//! checked against both before it is used:
//!
//! * **gguf**: speculative parse over every plausible version/endianness,
//!   keeping a reason for each rejected hypothesis.
//! * **safetensors**: length-prefixed JSON header decode.
//! * **verify**: tensor bounds, ordering, overlap, quantization-aware size
//!   consistency and full-file coverage.
//! * **validate**: KV decoding, known-key conformance, duplicate detection
//!   and template content scanning.
//!
//! The crate never opens files or prints; [`analyzer::Analyzer`] turns a
//! buffer into an [`report::AnalysisReport`] and the caller renders it.

pub mod analyzer;
pub mod cursor;
pub mod error;
pub mod gguf;
pub mod kv_rules;
pub mod quant;
pub mod report;
pub mod safetensors;
pub mod validate;
pub mod verify;

pub use analyzer::{
    AnalysisOptions, Analyzer, FormatAnalyzer, GgufAnalyzer, ModelFormat, SafeTensorsAnalyzer,
    Stage,
};
pub use error::{CursorError, GgufError, SafeTensorsError};
pub use report::{
    AnalysisReport, CheckGroup, Finding, FindingContext, FormatMetadata, ReasonEntry,
    ReportBuilder, Status, SubCheck,
};
