//! Artifact and tensor saving

use super::format::{ArtifactFormat, SaveConfig};
use crate::driver::{LayerArtifacts, QuantizationReport};
use crate::gptq::GroupSize;
use crate::quant::{Maxq, QuantErrorStats};
use crate::{Error, Result};
use ndarray::ArrayD;
use safetensors::tensor::{Dtype, TensorView};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// SafeTensors metadata keys
pub(super) const FORMAT_KEY: &str = "format";
pub(super) const FORMAT_NAME: &str = "cuantizar";
pub(super) const LAYERS_KEY: &str = "layers";
pub(super) const SKIPPED_KEY: &str = "skipped";
pub(super) const CALIBRATION_KEY: &str = "calibration";

/// Per-layer scalars stored in SafeTensors metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct LayerHeader {
    pub shape: Vec<usize>,
    pub bits: u8,
    pub maxq: Maxq,
    pub group_size: GroupSize,
    pub symmetric: bool,
    pub loss: f64,
    #[serde(default)]
    pub weight_error: QuantErrorStats,
}

impl From<&LayerArtifacts> for LayerHeader {
    fn from(layer: &LayerArtifacts) -> Self {
        Self {
            shape: layer.shape.clone(),
            bits: layer.bits,
            maxq: layer.maxq,
            group_size: layer.group_size,
            symmetric: layer.symmetric,
            loss: layer.loss,
            weight_error: layer.weight_error.clone(),
        }
    }
}

/// Named tensors in the text formats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct TensorFile {
    pub tensors: Vec<TensorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Save a quantization report
///
/// # Arguments
///
/// * `report` - Artifacts of a quantization run
/// * `path` - Output file path
/// * `config` - Save configuration (format, options)
///
/// # Example
///
/// ```no_run
/// use cuantizar::driver::QuantizationReport;
/// use cuantizar::io::{save_artifacts, ArtifactFormat, SaveConfig};
///
/// let report = QuantizationReport::default();
/// let config = SaveConfig::new(ArtifactFormat::SafeTensors);
/// save_artifacts(&report, "model.safetensors", &config).unwrap();
/// ```
pub fn save_artifacts(
    report: &QuantizationReport,
    path: impl AsRef<Path>,
    config: &SaveConfig,
) -> Result<()> {
    let path = path.as_ref();
    match config.format {
        ArtifactFormat::SafeTensors => save_artifacts_safetensors(report, path),
        ArtifactFormat::Json => write_text(path, &to_json(report, config.pretty)?),
        ArtifactFormat::Yaml => write_text(path, &to_yaml(report)?),
    }
}

/// Save named f32 tensors, e.g. weights or calibration samples
pub fn save_tensors(
    tensors: &[(String, ArrayD<f32>)],
    path: impl AsRef<Path>,
    config: &SaveConfig,
) -> Result<()> {
    let path = path.as_ref();
    if config.format == ArtifactFormat::SafeTensors {
        let buffers: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = tensors
            .iter()
            .map(|(name, t)| {
                let bytes = t.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.as_str(), Dtype::F32, t.shape().to_vec(), bytes)
            })
            .collect();
        return write_safetensors(path, &buffers, None);
    }

    let file = TensorFile {
        tensors: tensors
            .iter()
            .map(|(name, t)| TensorRecord {
                name: name.clone(),
                shape: t.shape().to_vec(),
                data: t.iter().copied().collect(),
            })
            .collect(),
    };
    let data = match config.format {
        ArtifactFormat::Yaml => serde_yaml::to_string(&file)
            .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?,
        _ => to_json(&file, config.pretty)?,
    };
    write_text(path, &data)
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    let data = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    data.map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))
}

fn write_text(path: &Path, data: &str) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data.as_bytes())?;
    Ok(())
}

/// Save artifacts in SafeTensors format (HuggingFace compatible)
fn save_artifacts_safetensors(report: &QuantizationReport, path: &Path) -> Result<()> {
    let mut buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
    let mut headers = BTreeMap::new();

    for (name, layer) in &report.layers {
        let dims = |d: (usize, usize)| vec![d.0, d.1];
        buffers.push((
            format!("{name}.qweight"),
            Dtype::U32,
            dims(layer.qweight.dim()),
            layer.qweight.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ));
        buffers.push((
            format!("{name}.scales"),
            Dtype::F64,
            dims(layer.scale.dim()),
            layer.scale.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ));
        if let Some(zero) = &layer.zero {
            buffers.push((
                format!("{name}.qzeros"),
                Dtype::F64,
                dims(zero.dim()),
                zero.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ));
        }
        if let Some(perm) = &layer.perm {
            buffers.push((
                format!("{name}.perm"),
                Dtype::I64,
                vec![perm.len()],
                perm.iter().flat_map(|&v| (v as i64).to_le_bytes()).collect(),
            ));
        }
        buffers.push((
            format!("{name}.g_idx"),
            Dtype::I64,
            vec![layer.g_idx.len()],
            layer.g_idx.iter().flat_map(|&v| (v as i64).to_le_bytes()).collect(),
        ));
        headers.insert(name.clone(), LayerHeader::from(layer));
    }

    // Create metadata with the per-layer scalars
    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT_NAME.to_string());
    metadata.insert(LAYERS_KEY.to_string(), to_json(&headers, false)?);
    if !report.skipped.is_empty() {
        metadata.insert(SKIPPED_KEY.to_string(), to_json(&report.skipped, false)?);
    }
    if let Some(calibration) = &report.calibration {
        metadata.insert(CALIBRATION_KEY.to_string(), to_json(calibration, false)?);
    }

    write_safetensors(path, &buffers, Some(metadata))
}

fn write_safetensors<N: AsRef<str>>(
    path: &Path,
    buffers: &[(N, Dtype, Vec<usize>, Vec<u8>)],
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let views = buffers
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            let name = name.as_ref();
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (name, view))
                .map_err(|e| Error::Serialization(format!("Invalid tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, metadata)
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}
