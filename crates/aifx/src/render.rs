//! Console rendering of analysis reports.

use std::io::{self, Write};

use forensics_core::{
    AnalysisReport, CheckGroup, Finding, FindingContext, FormatMetadata, Status,
};

pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

fn range(start: u64, end: u64) -> String {
    format!("[{start}, {end})")
}

fn dims(d: &[u64]) -> String {
    let parts: Vec<String> = d.iter().map(u64::to_string).collect();
    format!("[{}]", parts.join(", "))
}

pub fn write_report(out: &mut impl Write, report: &AnalysisReport) -> io::Result<()> {
    write_summary(out, report)?;
    write_structural(out, report)?;
    write_kv_grid(out, report)?;
    write_tensor_table(out, report)?;
    write_reason_matrix(out, report)?;

    let failures = report.failures().count();
    if report.ok {
        writeln!(out, "Result: OK")?;
    } else {
        writeln!(out, "Result: FAILED ({failures} failing checks)")?;
    }
    writeln!(out)
}

fn write_summary(out: &mut impl Write, r: &AnalysisReport) -> io::Result<()> {
    writeln!(out, "== {} ==", r.file_path)?;
    let mut rows: Vec<(&str, String)> = vec![
        ("Format", r.format.to_string()),
        ("Size", format!("{} ({} bytes)", human_size(r.file_size), r.file_size)),
        ("SHA-256", r.sha256_hex.clone().unwrap_or_else(|| "-".into())),
    ];
    match &r.metadata {
        Some(FormatMetadata::Gguf {
            version,
            endian,
            alignment,
            n_kv,
            n_tensors,
            data_offset,
            ..
        }) => {
            rows.push(("Version", format!("v{version} ({endian})")));
            rows.push(("Alignment", alignment.to_string()));
            rows.push(("KV entries", n_kv.to_string()));
            rows.push(("Tensors", n_tensors.to_string()));
            rows.push(("Data offset", data_offset.to_string()));
        }
        Some(FormatMetadata::SafeTensors {
            header_size,
            n_tensors,
            data_start,
            metadata,
        }) => {
            rows.push(("Header size", header_size.to_string()));
            rows.push(("Tensors", n_tensors.to_string()));
            rows.push(("Data start", data_start.to_string()));
            for (k, v) in metadata {
                rows.push(("Metadata", format!("{k}={v}")));
            }
        }
        None => {}
    }
    if !r.quantization_mix.is_empty() {
        let mix: Vec<String> = r
            .quantization_mix
            .iter()
            .map(|(k, v)| format!("{k}×{v}"))
            .collect();
        rows.push(("Quantization", mix.join(", ")));
    }
    let timings: Vec<String> = r
        .timings_ms
        .iter()
        .map(|(stage, ms)| format!("{stage} {ms:.2} ms"))
        .collect();
    rows.push(("Stages", timings.join(", ")));

    for (label, value) in rows {
        writeln!(out, "  {label:<14} {value}")?;
    }
    writeln!(out)
}

fn status_row(out: &mut impl Write, f: &Finding) -> io::Result<()> {
    let span = match &f.context {
        FindingContext::Region { start, end } => range(*start, *end),
        _ => String::new(),
    };
    writeln!(
        out,
        "  {:<5} {:<50} {:<22} {}",
        f.status.label(),
        f.qualified_name(),
        span,
        f.details
    )
}

fn write_structural(out: &mut impl Write, r: &AnalysisReport) -> io::Result<()> {
    writeln!(out, "Structural checks")?;
    writeln!(out, "  {:<5} {:<50} {:<22} {}", "", "Check", "Range", "Details")?;
    writeln!(out, "  {}", "-".repeat(100))?;
    for group in [
        CheckGroup::Parse,
        CheckGroup::FileLayout,
        CheckGroup::StructuralIntegrity,
        CheckGroup::OverallResult,
    ] {
        for f in r.findings_in(group) {
            status_row(out, f)?;
        }
    }
    writeln!(out)
}

fn write_kv_grid(out: &mut impl Write, r: &AnalysisReport) -> io::Result<()> {
    let mut kv = r.findings_in(CheckGroup::KvAnalysis).peekable();
    if kv.peek().is_none() {
        return Ok(());
    }
    writeln!(out, "KV forensics")?;
    writeln!(out, "  {:<5} {:<44} {:<16} {:<22}", "", "Key", "Type", "Range")?;
    writeln!(out, "  {}", "-".repeat(90))?;
    for f in kv {
        match &f.context {
            FindingContext::KvEntry {
                key,
                value_type,
                is_array,
                start,
                end,
                sub_checks,
                rendered,
            } => {
                let ty = if *is_array {
                    format!("{value_type}[]")
                } else {
                    value_type.clone()
                };
                writeln!(
                    out,
                    "  {:<5} {:<44} {:<16} {:<22}",
                    f.status.label(),
                    key,
                    ty,
                    range(*start, *end)
                )?;
                for sub in sub_checks {
                    writeln!(
                        out,
                        "        - {:<18} {:<5} {}",
                        sub.name,
                        sub.status.label(),
                        sub.details
                    )?;
                }
                if let Some(json) = rendered {
                    for line in json.lines() {
                        writeln!(out, "          | {line}")?;
                    }
                }
            }
            _ => status_row(out, f)?,
        }
    }
    writeln!(out)
}

fn write_tensor_table(out: &mut impl Write, r: &AnalysisReport) -> io::Result<()> {
    let mut tensors = r.findings_in(CheckGroup::TensorLayout).peekable();
    if tensors.peek().is_none() {
        return Ok(());
    }
    writeln!(out, "Tensor layout")?;
    writeln!(
        out,
        "  {:<5} {:<48} {:<10} {:<18} {:<26} {}",
        "", "Check", "Type", "Dims", "Range", "Details"
    )?;
    writeln!(out, "  {}", "-".repeat(120))?;
    for f in tensors {
        let (ty, shape, span) = match &f.context {
            FindingContext::TensorBounds {
                start,
                end,
                dtype,
                dims: d,
            } => (dtype.as_str(), dims(d), range(*start, *end)),
            FindingContext::TensorSize {
                start,
                end,
                ggml_type,
                dims: d,
                ..
            } => (ggml_type.as_str(), dims(d), range(*start, *end)),
            _ => ("", String::new(), String::new()),
        };
        writeln!(
            out,
            "  {:<5} {:<48} {:<10} {:<18} {:<26} {}",
            f.status.label(),
            f.check_name,
            ty,
            shape,
            span,
            f.details
        )?;
    }
    writeln!(out)
}

fn write_reason_matrix(out: &mut impl Write, r: &AnalysisReport) -> io::Result<()> {
    if r.reason_matrix.is_empty() {
        return Ok(());
    }
    writeln!(out, "Reason matrix")?;
    writeln!(out, "  {:<24} {}", "Candidate", "Reason")?;
    writeln!(out, "  {}", "-".repeat(80))?;
    for entry in &r.reason_matrix {
        writeln!(out, "  {:<24} {}", entry.candidate_spec, entry.reason)?;
    }
    writeln!(out)
}

/// One-line verdict per report, for multi-file runs.
pub fn write_verdicts(out: &mut impl Write, reports: &[AnalysisReport]) -> io::Result<()> {
    for r in reports {
        let (fail, warn) = r.findings.iter().fold((0, 0), |(f, w), x| match x.status {
            Status::Fail => (f + 1, w),
            Status::Warn => (f, w + 1),
            Status::Pass => (f, w),
        });
        let verdict = if r.ok { "OK" } else { "FAILED" };
        writeln!(out, "{verdict:<7} {} ({fail} failed, {warn} warnings)", r.file_path)?;
    }
    Ok(())
}
