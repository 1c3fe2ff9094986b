//! Format selection and the per-file analysis pipeline.
//!
//! [`Analyzer`] is a thin wrapper: it hashes the buffer, times each stage and
//! hands the structure stage to the [`FormatAnalyzer`] for the file's format.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::gguf::{self, GGUF_MAGIC};
use crate::report::{AnalysisReport, CheckGroup, Finding, FormatMetadata, ReasonEntry, ReportBuilder};
use crate::validate::KvValidator;
use crate::{safetensors, verify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Gguf,
    SafeTensors,
}

impl ModelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gguf => "gguf",
            Self::SafeTensors => "safetensors",
        }
    }

    /// Format implied by a file name's extension, case-insensitively.
    pub fn from_extension(path: &str) -> Option<Self> {
        let (_, ext) = path.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "gguf" => Some(Self::Gguf),
            "safetensors" | "safetensor" => Some(Self::SafeTensors),
            _ => None,
        }
    }

    /// Guess the format from leading bytes.
    pub fn sniff(buf: &[u8]) -> Option<Self> {
        if buf.starts_with(&GGUF_MAGIC) {
            return Some(Self::Gguf);
        }
        let prefix: [u8; 8] = buf.get(..8)?.try_into().ok()?;
        let header_len = usize::try_from(u64::from_le_bytes(prefix)).ok()?;
        let header = buf.get(8..8usize.checked_add(header_len)?)?;
        match header.trim_ascii_start().first() {
            Some(b'{') => Some(Self::SafeTensors),
            _ => None,
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gguf" => Ok(Self::Gguf),
            "safetensors" | "safetensor" => Ok(Self::SafeTensors),
            other => Err(format!("unknown format '{other}' (expected gguf or safetensors)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sha256,
    Structure,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Sha256, Stage::Structure];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Structure => "structure",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "structure" => Ok(Self::Structure),
            other => Err(format!("unknown stage '{other}' (expected sha256 or structure)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub stages: Vec<Stage>,
    /// Appended to the built-in template indicator list.
    pub extra_indicators: Vec<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
            extra_indicators: Vec::new(),
        }
    }
}

/// Structural analysis for one container format.
pub trait FormatAnalyzer: Send + Sync {
    fn format(&self) -> ModelFormat;

    /// Parse `buf` and append everything learned to `report`.
    fn analyze(&self, buf: &[u8], report: &mut ReportBuilder);
}

fn parse_failure(details: impl Into<String>) -> Finding {
    Finding::check(CheckGroup::Parse, "parse", false, details)
}

#[derive(Debug, Clone, Default)]
pub struct GgufAnalyzer {
    validator: KvValidator,
}

impl GgufAnalyzer {
    pub fn new(extra_indicators: Vec<String>) -> Self {
        Self {
            validator: KvValidator::new(extra_indicators),
        }
    }
}

impl FormatAnalyzer for GgufAnalyzer {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn analyze(&self, buf: &[u8], report: &mut ReportBuilder) {
        let file_size = report.file_size();
        let parsed = match gguf::parse(buf, file_size) {
            Ok(p) => p,
            Err(e) => {
                report.add(parse_failure(format!("not a GGUF file: {e}")));
                return;
            }
        };
        for reason in parsed.mismatches {
            report.add_reason(reason);
        }
        let Some(model) = parsed.model else {
            report.add(parse_failure("No version parser accepted this file"));
            return;
        };

        report.add(Finding::check(
            CheckGroup::Parse,
            "parse",
            true,
            format!("parsed as gguf v{}-{}", model.version, model.endian),
        ));
        report.set_metadata(FormatMetadata::Gguf {
            version: model.version,
            endian: model.endian,
            alignment: model.alignment,
            n_kv: model.n_kv,
            n_tensors: model.n_tensors,
            header_end_offset: model.header_end_offset,
            kv_end_offset: model.kv_end_offset,
            tensor_info_end_offset: model.tensor_info_end_offset,
            data_offset: model.data_offset,
        });
        report.set_quantization_mix(verify::quantization_mix(&model));
        report.extend(verify::verify_gguf(&model, file_size));
        report.extend(self.validator.validate(&model));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafeTensorsAnalyzer;

impl FormatAnalyzer for SafeTensorsAnalyzer {
    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn analyze(&self, buf: &[u8], report: &mut ReportBuilder) {
        let file_size = report.file_size();
        let model = match safetensors::parse(buf, file_size) {
            Ok(m) => m,
            Err(e) => {
                report.add_reason(ReasonEntry::new("safetensors v1", e.to_string()));
                report.add(parse_failure(e.to_string()));
                return;
            }
        };
        report.add(Finding::check(
            CheckGroup::Parse,
            "parse",
            true,
            format!("parsed safetensors header ({} tensors)", model.tensors.len()),
        ));
        report.set_metadata(FormatMetadata::SafeTensors {
            header_size: model.header_size,
            n_tensors: model.tensors.len(),
            data_start: model.data_start,
            metadata: model.metadata.clone(),
        });
        report.extend(verify::verify_safetensors(&model, file_size));
    }
}

/// Runs the selected stages over one file's bytes.
pub struct Analyzer {
    format: Box<dyn FormatAnalyzer>,
    stages: Vec<Stage>,
}

impl Analyzer {
    pub fn new(format: ModelFormat, options: AnalysisOptions) -> Self {
        let format: Box<dyn FormatAnalyzer> = match format {
            ModelFormat::Gguf => Box::new(GgufAnalyzer::new(options.extra_indicators)),
            ModelFormat::SafeTensors => Box::new(SafeTensorsAnalyzer),
        };
        Self {
            format,
            stages: options.stages,
        }
    }

    pub fn with_analyzer(format: Box<dyn FormatAnalyzer>, stages: Vec<Stage>) -> Self {
        Self { format, stages }
    }

    pub fn format(&self) -> ModelFormat {
        self.format.format()
    }

    /// Analyze `buf`, the contents of `path`. `file_size` is authoritative
    /// for every bounds check.
    pub fn run(&self, path: &str, buf: &[u8], file_size: u64) -> AnalysisReport {
        let mut report = ReportBuilder::new(path, file_size, self.format());

        // Stages run in canonical order whatever order they were requested in.
        for stage in Stage::ALL {
            if !self.stages.contains(&stage) {
                continue;
            }
            let started = Instant::now();
            match stage {
                Stage::Sha256 => report.set_sha256(sha256_hex(buf)),
                Stage::Structure => self.format.analyze(buf, &mut report),
            }
            let millis = started.elapsed().as_secs_f64() * 1000.0;
            debug!(path, stage = %stage, millis, "stage finished");
            report.stage_done(stage, millis);
        }

        let report = report.finish();
        info!(
            path,
            format = %report.format,
            ok = report.ok,
            findings = report.findings.len(),
            failures = report.failures().count(),
            "analysis complete"
        );
        report
    }
}

pub fn sha256_hex(buf: &[u8]) -> String {
    format!("{:x}", Sha256::digest(buf))
}
