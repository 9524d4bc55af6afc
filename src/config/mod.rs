//! Declarative YAML configuration
//!
//! # Example
//!
//! ```yaml
//! defaults:
//!   bits: 4
//!   group_size: 128
//!   act_order: false
//!
//! layers:
//!   "layers.0.up_proj": { bits: 8 }
//!   "layers\\.\\d+\\.down_proj": { act_order: true }
//!
//! exclude: ["lm_head"]
//!
//! calibration:
//!   nsamples: 128
//!   pad_max_length: 2048
//! ```

mod cli;
mod load;
mod quantize;
mod schema;
mod validate;

pub use cli::{
    apply_overrides, parse_args, Cli, Command, InfoArgs, OutputFormat, QuantizeArgs, ValidateArgs,
};
pub use load::{load_config, parse_config, LayerResolver};
pub use quantize::quantize_from_args;
pub use schema::{CalibrationConfig, GptqConfig, LayerOverride, LayerQuantConfig};
pub use validate::{validate_config, ValidationError};
