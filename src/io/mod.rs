//! Artifact I/O - saving and loading quantization results
//!
//! Quantized layers are stored as JSON, YAML or SafeTensors. Plain named
//! tensors (weights, calibration samples) use the same formats.

mod format;
mod load;
mod save;

pub use format::{ArtifactFormat, SaveConfig};
pub use load::{load_artifacts, load_tensors, natural_cmp};
pub use save::{save_artifacts, save_tensors};
