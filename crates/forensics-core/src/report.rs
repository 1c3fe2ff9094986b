//! Findings, the reason matrix and the per-file report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analyzer::{ModelFormat, Stage};
use crate::cursor::Endian;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Warn,
    Fail,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }
}

/// Report sections; declaration order is the canonical output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckGroup {
    Parse,
    FileLayout,
    StructuralIntegrity,
    KvAnalysis,
    TensorLayout,
    OverallResult,
}

impl CheckGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::FileLayout => "file_layout",
            Self::StructuralIntegrity => "structural_integrity",
            Self::KvAnalysis => "kv_analysis",
            Self::TensorLayout => "tensor_layout",
            Self::OverallResult => "overall_result",
        }
    }
}

/// One sub-check folded into a KV finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCheck {
    pub name: String,
    pub status: Status,
    pub details: String,
}

impl SubCheck {
    pub fn new(name: &str, status: Status, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: details.into(),
        }
    }
}

/// Structured extras attached to a finding, one shape per kind of check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingContext {
    None,
    Region {
        start: u64,
        end: u64,
    },
    TensorBounds {
        start: u64,
        end: u64,
        dtype: String,
        dims: Vec<u64>,
    },
    TensorSize {
        start: u64,
        end: u64,
        on_disk: u64,
        expected: Option<u64>,
        ggml_type: String,
        dims: Vec<u64>,
    },
    KvEntry {
        key: String,
        value_type: String,
        is_array: bool,
        start: u64,
        end: u64,
        sub_checks: Vec<SubCheck>,
        /// Pretty-printed value when a template held structured data.
        rendered: Option<String>,
    },
    Coverage {
        covered_end: u64,
        file_size: u64,
        /// `file_size - covered_end`, saturated; negative when tensors run past EOF.
        delta: i64,
    },
}

impl FindingContext {
    /// Byte offset used for canonical ordering.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Region { start, .. }
            | Self::TensorBounds { start, .. }
            | Self::TensorSize { start, .. }
            | Self::KvEntry { start, .. } => *start,
            Self::None | Self::Coverage { .. } => 0,
        }
    }
}

/// Atomic verification result. `ok` is false only for `Status::Fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub check_name: String,
    pub group: CheckGroup,
    pub status: Status,
    pub ok: bool,
    pub details: String,
    pub context: FindingContext,
}

impl Finding {
    pub fn new(
        group: CheckGroup,
        check_name: impl Into<String>,
        status: Status,
        details: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            group,
            status,
            ok: status != Status::Fail,
            details: details.into(),
            context: FindingContext::None,
        }
    }

    /// Pass/fail finding.
    pub fn check(
        group: CheckGroup,
        check_name: impl Into<String>,
        ok: bool,
        details: impl Into<String>,
    ) -> Self {
        let status = if ok { Status::Pass } else { Status::Fail };
        Self::new(group, check_name, status, details)
    }

    pub fn with_context(mut self, context: FindingContext) -> Self {
        self.context = context;
        self
    }

    /// `group:check_name`, as shown to users.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.group.as_str(), self.check_name)
    }
}

/// Why one speculative parse hypothesis was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonEntry {
    pub candidate_spec: String,
    pub reason: String,
}

impl ReasonEntry {
    pub fn new(candidate_spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            candidate_spec: candidate_spec.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum FormatMetadata {
    Gguf {
        version: u32,
        endian: Endian,
        alignment: u64,
        n_kv: u64,
        n_tensors: u64,
        header_end_offset: u64,
        kv_end_offset: u64,
        tensor_info_end_offset: u64,
        data_offset: u64,
    },
    SafeTensors {
        header_size: u64,
        n_tensors: usize,
        data_start: u64,
        /// String entries of `__metadata__`.
        metadata: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub file_path: String,
    pub file_size: u64,
    /// `None` when the sha256 stage did not run.
    pub sha256_hex: Option<String>,
    pub format: ModelFormat,
    pub ok: bool,
    pub metadata: Option<FormatMetadata>,
    /// GGML type name -> tensor count.
    pub quantization_mix: BTreeMap<String, u64>,
    pub findings: Vec<Finding>,
    pub reason_matrix: Vec<ReasonEntry>,
    pub stages_run: Vec<Stage>,
    pub timings_ms: BTreeMap<String, f64>,
}

impl AnalysisReport {
    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.ok)
    }

    pub fn findings_in(&self, group: CheckGroup) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.group == group)
    }

    pub fn finding(&self, check_name: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.check_name == check_name)
    }
}

/// Append-only accumulator handed to format analyzers.
#[derive(Debug)]
pub struct ReportBuilder {
    report: AnalysisReport,
}

impl ReportBuilder {
    pub fn new(file_path: impl Into<String>, file_size: u64, format: ModelFormat) -> Self {
        Self {
            report: AnalysisReport {
                file_path: file_path.into(),
                file_size,
                sha256_hex: None,
                format,
                ok: true,
                metadata: None,
                quantization_mix: BTreeMap::new(),
                findings: Vec::new(),
                reason_matrix: Vec::new(),
                stages_run: Vec::new(),
                timings_ms: BTreeMap::new(),
            },
        }
    }

    pub fn file_size(&self) -> u64 {
        self.report.file_size
    }

    pub fn add(&mut self, finding: Finding) {
        self.report.findings.push(finding);
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.report.findings.extend(findings);
    }

    pub fn add_reason(&mut self, entry: ReasonEntry) {
        self.report.reason_matrix.push(entry);
    }

    pub fn set_metadata(&mut self, metadata: FormatMetadata) {
        self.report.metadata = Some(metadata);
    }

    pub fn set_quantization_mix(&mut self, mix: BTreeMap<String, u64>) {
        self.report.quantization_mix = mix;
    }

    pub fn set_sha256(&mut self, hex: String) {
        self.report.sha256_hex = Some(hex);
    }

    pub fn stage_done(&mut self, stage: Stage, millis: f64) {
        self.report.stages_run.push(stage);
        self.report.timings_ms.insert(stage.as_str().to_string(), millis);
    }

    /// Restore canonical order and compute the overall verdict.
    pub fn finish(mut self) -> AnalysisReport {
        self.report
            .findings
            .sort_by_key(|f| (f.group, f.context.offset()));
        self.report.ok = self.report.findings.iter().all(|f| f.ok);
        self.report
    }
}
