//! Artifact and tensor loading

use super::format::ArtifactFormat;
use super::save::{
    LayerHeader, TensorFile, CALIBRATION_KEY, FORMAT_KEY, FORMAT_NAME, LAYERS_KEY, SKIPPED_KEY,
};
use crate::driver::{CalibrationReport, LayerArtifacts, QuantizationReport};
use crate::{Error, Result};
use bytemuck::Pod;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

fn detect_format(path: &Path) -> Result<ArtifactFormat> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Serialization("File has no extension".to_string()))?;

    ArtifactFormat::from_extension(ext)
        .ok_or_else(|| Error::Serialization(format!("Unsupported file extension: {ext}")))
}

/// Load a quantization report
///
/// The format is automatically detected from the file extension.
///
/// # Example
///
/// ```no_run
/// use cuantizar::io::load_artifacts;
///
/// let report = load_artifacts("model.safetensors").unwrap();
/// println!("{} quantized layers", report.layers.len());
/// ```
pub fn load_artifacts(path: impl AsRef<Path>) -> Result<QuantizationReport> {
    let path = path.as_ref();
    match detect_format(path)? {
        ArtifactFormat::SafeTensors => load_artifacts_safetensors(path),
        ArtifactFormat::Json => serde_json::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {e}"))),
        ArtifactFormat::Yaml => serde_yaml::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| Error::Serialization(format!("YAML deserialization failed: {e}"))),
    }
}

/// Load named tensors as `f32`, ordered by name with numeric segments
/// compared as numbers (`layers.2` before `layers.10`).
///
/// SafeTensors files may hold F32, F64, F16 or BF16 tensors.
pub fn load_tensors(path: impl AsRef<Path>) -> Result<Vec<(String, ArrayD<f32>)>> {
    let path = path.as_ref();
    let mut tensors = match detect_format(path)? {
        ArtifactFormat::SafeTensors => load_tensors_safetensors(path)?,
        format => {
            let content = std::fs::read_to_string(path)?;
            let file: TensorFile = if format == ArtifactFormat::Yaml {
                serde_yaml::from_str(&content)
                    .map_err(|e| Error::Serialization(format!("YAML deserialization failed: {e}")))?
            } else {
                serde_json::from_str(&content)
                    .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {e}")))?
            };
            file.tensors
                .into_iter()
                .map(|record| {
                    let name = record.name;
                    ArrayD::from_shape_vec(IxDyn(&record.shape), record.data)
                        .map(|array| (name.clone(), array))
                        .map_err(|e| Error::Serialization(format!("Tensor {name}: {e}")))
                })
                .collect::<Result<Vec<_>>>()?
        }
    };
    tensors.sort_by(|a, b| natural_cmp(&a.0, &b.0));
    Ok(tensors)
}

/// Compare dotted names segment by segment, numerically where both parse
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(i), Ok(j)) => i.cmp(&j),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Decode little-endian elements; tensor data carries no alignment guarantee
fn read_pod<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect()
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Serialization(format!("Failed to read file: {e}")))
}

fn parse_safetensors(data: &[u8]) -> Result<SafeTensors<'_>> {
    SafeTensors::deserialize(data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))
}

fn load_tensors_safetensors(path: &Path) -> Result<Vec<(String, ArrayD<f32>)>> {
    let data = read_file(path)?;
    let safetensors = parse_safetensors(&data)?;

    safetensors
        .names()
        .into_iter()
        .map(|name| {
            let view = safetensors
                .tensor(name)
                .map_err(|e| Error::Serialization(format!("Tensor {name}: {e}")))?;
            let values: Vec<f32> = match view.dtype() {
                Dtype::F32 => read_pod::<f32>(view.data()),
                Dtype::F64 => read_pod::<f64>(view.data()).into_iter().map(|v| v as f32).collect(),
                Dtype::F16 => read_pod::<half::f16>(view.data())
                    .into_iter()
                    .map(half::f16::to_f32)
                    .collect(),
                Dtype::BF16 => read_pod::<half::bf16>(view.data())
                    .into_iter()
                    .map(half::bf16::to_f32)
                    .collect(),
                other => {
                    return Err(Error::Serialization(format!(
                        "Tensor {name} has unsupported dtype {other:?}"
                    )))
                }
            };
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
                .map_err(|e| Error::Serialization(format!("Tensor {name}: {e}")))?;
            Ok((name.to_string(), array))
        })
        .collect()
}

/// Load artifacts from SafeTensors format
fn load_artifacts_safetensors(path: &Path) -> Result<QuantizationReport> {
    let data = read_file(path)?;

    let (_, st_metadata) = SafeTensors::read_metadata(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let custom_meta = st_metadata.metadata().clone().unwrap_or_default();
    if custom_meta.get(FORMAT_KEY).map(String::as_str) != Some(FORMAT_NAME) {
        return Err(Error::Serialization(
            "SafeTensors file does not hold quantized artifacts".to_string(),
        ));
    }

    let parse = |key: &str| -> Option<Result<serde_json::Value>> {
        custom_meta.get(key).map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| Error::Serialization(format!("Invalid {key} metadata: {e}")))
        })
    };
    let headers: BTreeMap<String, LayerHeader> = match parse(LAYERS_KEY) {
        Some(value) => serde_json::from_value(value?)
            .map_err(|e| Error::Serialization(format!("Invalid layer metadata: {e}")))?,
        None => BTreeMap::new(),
    };
    let skipped: Vec<String> = match parse(SKIPPED_KEY) {
        Some(value) => serde_json::from_value(value?)
            .map_err(|e| Error::Serialization(format!("Invalid skipped metadata: {e}")))?,
        None => Vec::new(),
    };
    let calibration: Option<CalibrationReport> = match parse(CALIBRATION_KEY) {
        Some(value) => Some(
            serde_json::from_value(value?)
                .map_err(|e| Error::Serialization(format!("Invalid calibration metadata: {e}")))?,
        ),
        None => None,
    };

    let safetensors = parse_safetensors(&data)?;
    let mut layers = BTreeMap::new();
    for (name, header) in headers {
        let qweight = read_matrix::<u32>(&safetensors, &format!("{name}.qweight"), Dtype::U32)?
            .ok_or_else(|| Error::Serialization(format!("Missing {name}.qweight")))?;
        let scale = read_matrix::<f64>(&safetensors, &format!("{name}.scales"), Dtype::F64)?
            .ok_or_else(|| Error::Serialization(format!("Missing {name}.scales")))?;
        let zero = read_matrix::<f64>(&safetensors, &format!("{name}.qzeros"), Dtype::F64)?;
        let perm = read_indices(&safetensors, &format!("{name}.perm"))?;
        let g_idx = read_indices(&safetensors, &format!("{name}.g_idx"))?
            .ok_or_else(|| Error::Serialization(format!("Missing {name}.g_idx")))?;

        layers.insert(
            name,
            LayerArtifacts {
                shape: header.shape,
                bits: header.bits,
                maxq: header.maxq,
                group_size: header.group_size,
                symmetric: header.symmetric,
                qweight,
                scale,
                zero,
                perm,
                g_idx,
                loss: header.loss,
                weight_error: header.weight_error,
            },
        );
    }

    Ok(QuantizationReport {
        layers,
        skipped,
        calibration,
    })
}

fn read_matrix<T: Pod>(st: &SafeTensors<'_>, name: &str, dtype: Dtype) -> Result<Option<Array2<T>>> {
    let Ok(view) = st.tensor(name) else {
        return Ok(None);
    };
    if view.dtype() != dtype || view.shape().len() != 2 {
        return Err(Error::Serialization(format!(
            "Tensor {name}: expected 2-D {dtype:?}, got {:?} {:?}",
            view.shape(),
            view.dtype()
        )));
    }
    let (rows, cols) = (view.shape()[0], view.shape()[1]);
    Array2::from_shape_vec((rows, cols), read_pod::<T>(view.data()))
        .map(Some)
        .map_err(|e| Error::Serialization(format!("Tensor {name}: {e}")))
}

fn read_indices(st: &SafeTensors<'_>, name: &str) -> Result<Option<Array1<usize>>> {
    let Ok(view) = st.tensor(name) else {
        return Ok(None);
    };
    if view.dtype() != Dtype::I64 {
        return Err(Error::Serialization(format!(
            "Tensor {name}: expected I64, got {:?}",
            view.dtype()
        )));
    }
    read_pod::<i64>(view.data())
        .into_iter()
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| Error::Serialization(format!("Tensor {name}: negative index {v}")))
        })
        .collect::<Result<Vec<_>>>()
        .map(|v| Some(Array1::from(v)))
}
