use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use forensics_core::{AnalysisOptions, AnalysisReport, Analyzer, ModelFormat};
use serde::Serialize;
use tracing::{error, info};

use crate::cli::ScanArgs;
use crate::config::AppConfig;
use crate::render;
use crate::source::MappedFile;

/// Top-level shape of `--json-out`.
#[derive(Serialize)]
struct JsonExport<'a> {
    generated_at: String,
    reports: &'a [AnalysisReport],
}

pub async fn execute(args: ScanArgs) -> anyhow::Result<ExitCode> {
    let cfg = AppConfig::load_or_default()?;
    let options = AnalysisOptions {
        stages: if args.stages.is_empty() {
            cfg.default_stages.clone()
        } else {
            args.stages.clone()
        },
        extra_indicators: cfg
            .extra_indicators
            .iter()
            .chain(&args.extra_indicators)
            .cloned()
            .collect(),
    };

    // Analyze concurrently, report in argument order.
    let tasks: Vec<_> = args
        .paths
        .iter()
        .map(|path| {
            let path = path.clone();
            let options = options.clone();
            let format = args.format;
            tokio::task::spawn_blocking(move || analyze_path(&path, format, options))
        })
        .collect();

    let mut reports = Vec::with_capacity(tasks.len());
    let mut failed = false;
    for (path, task) in args.paths.iter().zip(tasks) {
        match task.await? {
            Ok(report) => {
                render::write_report(&mut std::io::stdout().lock(), &report)?;
                failed |= !report.ok;
                reports.push(report);
            }
            Err(e) => {
                error!(path = %path.display(), "{e:#}");
                failed = true;
            }
        }
    }
    if args.paths.len() > 1 {
        render::write_verdicts(&mut std::io::stdout().lock(), &reports)?;
    }

    if let Some(out) = &args.json_out {
        write_json(out, &reports)?;
        info!(path = %out.display(), reports = reports.len(), "JSON report written");
    }

    Ok(if failed && cfg.fail_exit_code {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Pick the format: forced, then extension, then content sniffing.
pub fn detect_format(
    path: &Path,
    forced: Option<ModelFormat>,
    bytes: &[u8],
) -> anyhow::Result<ModelFormat> {
    forced
        .or_else(|| ModelFormat::from_extension(&path.to_string_lossy()))
        .or_else(|| ModelFormat::sniff(bytes))
        .with_context(|| {
            format!(
                "cannot determine the model format of {}; pass --format",
                path.display()
            )
        })
}

pub fn analyze_path(
    path: &Path,
    forced: Option<ModelFormat>,
    options: AnalysisOptions,
) -> anyhow::Result<AnalysisReport> {
    let file = MappedFile::open(path)?;
    let format = detect_format(file.path(), forced, file.bytes())?;
    info!(path = %path.display(), %format, size = file.len(), "analyzing");
    let analyzer = Analyzer::new(format, options);
    Ok(analyzer.run(&path.display().to_string(), file.bytes(), file.len()))
}

pub fn write_json(path: &Path, reports: &[AnalysisReport]) -> anyhow::Result<()> {
    let export = JsonExport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        reports,
    };
    let data = serde_json::to_string_pretty(&export)?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forensics_core::Stage;

    fn empty_gguf() -> Vec<u8> {
        let mut buf = b"GGUF".to_vec();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.resize(32, 0);
        buf
    }

    #[test]
    fn format_detection_order() {
        let gguf = empty_gguf();
        let p = Path::new("model.bin");
        assert_eq!(detect_format(p, None, &gguf).unwrap(), ModelFormat::Gguf);
        assert_eq!(
            detect_format(Path::new("m.safetensors"), None, &gguf).unwrap(),
            ModelFormat::SafeTensors
        );
        assert_eq!(
            detect_format(Path::new("m.safetensors"), Some(ModelFormat::Gguf), &gguf).unwrap(),
            ModelFormat::Gguf
        );
        let err = detect_format(p, None, b"\0\0").unwrap_err();
        assert!(err.to_string().contains("--format"));
    }

    #[test]
    fn analyzes_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gguf");
        std::fs::write(&path, empty_gguf()).unwrap();

        let report = analyze_path(&path, None, AnalysisOptions::default()).unwrap();
        assert!(report.ok);
        assert_eq!(report.file_size, 32);
        assert_eq!(report.sha256_hex.as_deref().map(str::len), Some(64));

        let hash_only = AnalysisOptions {
            stages: vec![Stage::Sha256],
            extra_indicators: Vec::new(),
        };
        let report = analyze_path(&path, None, hash_only).unwrap();
        assert!(report.findings.is_empty());
    }

    #[test]
    fn empty_file_is_analyzed_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.safetensors");
        std::fs::write(&path, b"").unwrap();
        let report = analyze_path(&path, None, AnalysisOptions::default()).unwrap();
        assert!(!report.ok);
        assert_eq!(report.reason_matrix.len(), 1);
    }

    #[test]
    fn json_export_shape() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("empty.gguf");
        std::fs::write(&model, empty_gguf()).unwrap();
        let report = analyze_path(&model, None, AnalysisOptions::default()).unwrap();

        let out = dir.path().join("report.json");
        write_json(&out, &[report]).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(value["generated_at"].as_str().unwrap().contains('T'));
        let first = &value["reports"][0];
        assert_eq!(first["format"], "gguf");
        assert_eq!(first["ok"], true);
        assert_eq!(first["metadata"]["format"], "gguf");
        assert_eq!(first["findings"][0]["status"], "PASS");
        assert_eq!(first["findings"][0]["group"], "parse");
    }
}
