//! Structural verification of a parsed model against the file it came from.
//!
//! Pure functions: same model and file size in, same findings out. A check
//! that does not hold becomes a failing [`Finding`], never an error.
//!
//! Offsets are widened to `u128` so `data_offset + relative_offset` cannot
//! wrap on adversarial input; they are clamped back to `u64` for reporting.

use std::collections::BTreeMap;

use crate::gguf::{GGUFModel, align_up};
use crate::quant::{self, SizeError};
use crate::report::{CheckGroup, Finding, FindingContext};
use crate::safetensors::SafeTensorsModel;

fn clamp(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

fn region(name: &str, start: u64, end: u64, details: impl Into<String>) -> Finding {
    Finding::check(CheckGroup::FileLayout, name, start <= end, details)
        .with_context(FindingContext::Region { start, end })
}

fn coverage(covered_end: u128, file_size: u64, padded: bool) -> Finding {
    let wide = file_size as i128 - covered_end as i128;
    let delta = i64::try_from(wide).unwrap_or(if wide < 0 { i64::MIN } else { i64::MAX });
    let ok = delta == 0 || padded;
    let details = if delta == 0 {
        "the end of the last tensor aligns exactly with the end of the file".to_string()
    } else if padded {
        format!("last tensor is followed by {delta} bytes of alignment padding")
    } else if delta > 0 {
        format!("{delta} bytes of unaccounted-for data at the end of the file")
    } else {
        format!("tensor data runs {} bytes past the end of the file", delta.unsigned_abs())
    };
    Finding::check(CheckGroup::OverallResult, "file_coverage", ok, details).with_context(
        FindingContext::Coverage {
            covered_end: clamp(covered_end),
            file_size,
            delta,
        },
    )
}

//  GGUF

/// Why a tensor has no expected size.
enum Expected {
    Bytes(u64),
    UnknownType,
    Incomputable(String),
}

struct Span<'m> {
    name: &'m str,
    ggml_type: i32,
    dims: &'m [u64],
    start: u128,
    /// Inferred from the next tensor's start (or the file size for the last).
    end: u128,
    expected: Expected,
}

impl Span<'_> {
    /// End of the bytes this tensor actually needs, when that is known.
    fn footprint_end(&self) -> u128 {
        match self.expected {
            Expected::Bytes(n) => self.start + u128::from(n),
            _ => self.end,
        }
    }

    fn on_disk(&self) -> u64 {
        clamp(self.end.saturating_sub(self.start))
    }
}

fn expected_for(ggml_type: i32, dims: &[u64], n_elements: Option<u64>) -> Expected {
    let Some(info) = quant::lookup(ggml_type) else {
        return Expected::UnknownType;
    };
    let Some(n) = n_elements else {
        return Expected::Incomputable(format!("element count of dims {dims:?} overflows u64"));
    };
    match info.expected_size(n) {
        Ok(bytes) => Expected::Bytes(bytes),
        Err(e @ SizeError::NotBlockMultiple { .. }) => {
            Expected::Incomputable(format!("incomputable expected size: {e}"))
        }
        Err(SizeError::Overflow) => {
            Expected::Incomputable("incomputable expected size: overflows u64".to_string())
        }
    }
}

/// Tensors sorted by relative offset with absolute ranges resolved.
fn gguf_spans<'m>(model: &'m GGUFModel<'_>, file_size: u64) -> Vec<Span<'m>> {
    let mut order: Vec<_> = model.tensors.iter().collect();
    order.sort_by_key(|t| t.relative_offset);

    let base = u128::from(model.data_offset);
    let starts: Vec<u128> = order
        .iter()
        .map(|t| base + u128::from(t.relative_offset))
        .collect();

    order
        .iter()
        .enumerate()
        .map(|(i, t)| Span {
            name: t.name,
            ggml_type: t.ggml_type,
            dims: &t.dims,
            start: starts[i],
            end: starts
                .get(i + 1)
                .copied()
                .unwrap_or(u128::from(file_size)),
            expected: expected_for(t.ggml_type, &t.dims, t.n_elements()),
        })
        .collect()
}

/// Histogram of GGML type names over all tensors.
pub fn quantization_mix(model: &GGUFModel<'_>) -> BTreeMap<String, u64> {
    let mut mix = BTreeMap::new();
    for t in &model.tensors {
        *mix.entry(quant::type_label(t.ggml_type)).or_insert(0) += 1;
    }
    mix
}

pub fn verify_gguf(model: &GGUFModel<'_>, file_size: u64) -> Vec<Finding> {
    let mut out = Vec::new();
    let alignment_ok = model.alignment.is_power_of_two();

    //  Section boundaries
    out.push(region("magic_bytes", 0, 4, "GGUF magic"));
    out.push(region(
        "gguf_header",
        0,
        model.header_end_offset,
        format!("v{} header: magic, version, tensor and KV counts", model.version),
    ));
    out.push(region(
        "kv_store",
        model.header_end_offset,
        model.kv_end_offset,
        format!("{} KV records", model.n_kv),
    ));
    out.push(region(
        "tensor_info",
        model.kv_end_offset,
        model.tensor_info_end_offset,
        format!("{} tensor-info records", model.n_tensors),
    ));
    out.push(region(
        "alignment_padding",
        model.tensor_info_end_offset,
        model.data_offset,
        format!("padding to {}-byte alignment", model.alignment),
    ));
    out.push(region(
        "tensor_data",
        model.data_offset,
        file_size,
        "tensor data section",
    ));

    //  Header-level integrity
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "magic_version",
        true,
        format!("GGUF v{} ({})", model.version, model.endian),
    ));
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "alignment_power_of_two",
        alignment_ok,
        format!("alignment={}", model.alignment),
    ));
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "data_offset_bounds",
        model.data_offset <= file_size,
        format!("data_start={}, file_size={file_size}", model.data_offset),
    ));

    let unsorted_at = model
        .tensors
        .windows(2)
        .position(|w| w[0].relative_offset > w[1].relative_offset);
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "tensor_offsets_sorted",
        unsorted_at.is_none(),
        match unsorted_at {
            None => "declared tensor offsets are non-decreasing".to_string(),
            Some(i) => format!(
                "'{}' is declared after '{}' but starts earlier",
                model.tensors[i + 1].name,
                model.tensors[i].name
            ),
        },
    ));

    //  Per-tensor bounds and sizes
    let spans = gguf_spans(model, file_size);
    let fsize = u128::from(file_size);
    for s in &spans {
        let in_file = s.start <= s.end && s.end <= fsize;
        let type_name = quant::type_label(s.ggml_type);
        out.push(
            Finding::check(
                CheckGroup::TensorLayout,
                format!("tensor_bounds:{}", s.name),
                in_file,
                format!("[{},{}) type={type_name} dims={:?}", s.start, s.end, s.dims),
            )
            .with_context(FindingContext::TensorBounds {
                start: clamp(s.start),
                end: clamp(s.end),
                dtype: type_name.clone(),
                dims: s.dims.to_vec(),
            }),
        );

        let on_disk = s.on_disk();
        let size_ctx = |expected: Option<u64>| FindingContext::TensorSize {
            start: clamp(s.start),
            end: clamp(s.end),
            on_disk,
            expected,
            ggml_type: type_name.clone(),
            dims: s.dims.to_vec(),
        };
        match &s.expected {
            Expected::UnknownType => out.push(
                Finding::check(
                    CheckGroup::TensorLayout,
                    format!("quantization_known:{}", s.name),
                    false,
                    format!("unknown/unsupported GGML type {}", s.ggml_type),
                )
                .with_context(size_ctx(None)),
            ),
            Expected::Incomputable(reason) => out.push(
                Finding::check(
                    CheckGroup::TensorLayout,
                    format!("tensor_size_consistency:{}", s.name),
                    false,
                    reason.clone(),
                )
                .with_context(size_ctx(None)),
            ),
            Expected::Bytes(expected) => {
                let padded = alignment_ok
                    && on_disk > *expected
                    && align_up(*expected, model.alignment) == Some(on_disk);
                let ok = on_disk == *expected || padded;
                let mut details = format!("On-disk size: {on_disk}, Expected: {expected}");
                if padded {
                    details.push_str(&format!(" (+{} alignment padding)", on_disk - expected));
                }
                out.push(
                    Finding::check(
                        CheckGroup::TensorLayout,
                        format!("tensor_size_consistency:{}", s.name),
                        ok,
                        details,
                    )
                    .with_context(size_ctx(Some(*expected))),
                );
            }
        }
    }

    let overlap = spans
        .windows(2)
        .find(|w| w[0].footprint_end() > w[1].start);
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "tensor_non_overlap",
        overlap.is_none(),
        match overlap {
            None => "no overlapping tensor regions".to_string(),
            Some(w) => format!(
                "'{}' needs bytes up to {} but '{}' starts at {}",
                w[0].name,
                w[0].footprint_end(),
                w[1].name,
                w[1].start
            ),
        },
    ));

    let mix = quantization_mix(model);
    if !mix.is_empty() {
        let profile = mix
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        out.push(Finding::check(
            CheckGroup::StructuralIntegrity,
            "quantization_profile",
            true,
            profile,
        ));
    }

    //  Coverage: the last tensor's own bytes (plus alignment padding) must reach EOF.
    let covered_end = spans
        .last()
        .map(Span::footprint_end)
        .unwrap_or(u128::from(model.data_offset));
    let padded = alignment_ok
        && !spans.is_empty()
        && covered_end < fsize
        && u64::try_from(covered_end)
            .ok()
            .and_then(|end| align_up(end, model.alignment))
            == Some(file_size);
    out.push(coverage(covered_end, file_size, padded));

    out
}

//  SafeTensors

pub fn verify_safetensors(model: &SafeTensorsModel, file_size: u64) -> Vec<Finding> {
    let mut out = Vec::new();
    let fsize = u128::from(file_size);

    out.push(region(
        "header_and_metadata",
        0,
        model.data_start,
        "SafeTensors header (JSON)",
    ));
    out.push(region(
        "tensor_data",
        model.data_start,
        file_size,
        "tensor data section",
    ));
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "header_basic",
        true,
        format!("header_size={}", model.header_size),
    ));
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "metadata_offset_bounds",
        model.data_start <= file_size,
        format!("metadata region: [0, {})", model.data_start),
    ));

    let mut order: Vec<_> = model.tensors.iter().collect();
    order.sort_by_key(|t| t.data_offsets.0);

    let base = u128::from(model.data_start);
    let mut prev_end = base;
    let mut order_ok = true;
    let mut first_overlap = None;
    let mut bounds_ok = true;
    for t in order {
        let (b, e) = t.data_offsets;
        let start = base + u128::from(b);
        let end = base + u128::from(e);
        let in_file = start <= end && end <= fsize;
        bounds_ok &= in_file;
        if start < prev_end {
            order_ok = false;
            first_overlap.get_or_insert_with(|| t.name.clone());
        }
        out.push(
            Finding::check(
                CheckGroup::TensorLayout,
                format!("tensor_bounds:{}", t.name),
                in_file,
                format!("[{start},{end})"),
            )
            .with_context(FindingContext::TensorBounds {
                start: clamp(start),
                end: clamp(end),
                dtype: t.dtype.clone(),
                dims: t.shape.clone(),
            }),
        );
        prev_end = prev_end.max(end);
    }

    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "tensor_order_non_overlapping",
        order_ok,
        match &first_overlap {
            None => "non-overlapping, increasing offsets".to_string(),
            Some(name) => format!("'{name}' starts before the previous tensor ends"),
        },
    ));
    out.push(Finding::check(
        CheckGroup::StructuralIntegrity,
        "tensor_bounds_all_valid",
        bounds_ok,
        "all tensor extents lie within the file",
    ));
    out.push(coverage(prev_end, file_size, false));

    out
}
