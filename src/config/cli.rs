//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! cuantizar quantize weights.safetensors --calibration calib.safetensors --output out.safetensors
//! cuantizar quantize weights.json -c calib.json --config gptq.yaml -o out.json --bits 3 --act-order
//! cuantizar validate gptq.yaml
//! cuantizar info out.safetensors
//! ```

use super::schema::GptqConfig;
use crate::gptq::GroupSize;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cuantizar: GPTQ post-training weight quantization
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cuantizar")]
#[command(author = "PAIML")]
#[command(version)]
#[command(about = "GPTQ post-training weight quantization with Hessian-based error compensation")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Quantize a chain of linear layers
    Quantize(QuantizeArgs),

    /// Validate a configuration file
    Validate(ValidateArgs),

    /// Display information about quantized artifacts
    Info(InfoArgs),
}

/// Arguments for the quantize command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct QuantizeArgs {
    /// Weights file (SafeTensors, JSON or YAML), one `[out, in]` tensor per block named `{prefix}.{block}.{sub_layer}`
    #[arg(value_name = "WEIGHTS")]
    pub weights: PathBuf,

    /// Calibration inputs (SafeTensors or JSON), one `[tokens, features]` tensor per sample
    #[arg(short, long)]
    pub calibration: PathBuf,

    /// YAML quantization config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output path for quantized artifacts (.safetensors, .json or .yaml)
    #[arg(short, long)]
    pub output: PathBuf,

    /// Override bit width
    #[arg(short, long)]
    pub bits: Option<u8>,

    /// Override group size (-1 = whole row)
    #[arg(short, long, allow_hyphen_values = true, value_parser = parse_group_size)]
    pub group_size: Option<GroupSize>,

    /// Quantize columns in descending Hessian-diagonal order
    #[arg(long)]
    pub act_order: bool,

    /// Symmetric quantization
    #[arg(long, conflicts_with = "asym")]
    pub sym: bool,

    /// Asymmetric quantization
    #[arg(long)]
    pub asym: bool,

    /// Override the number of calibration samples
    #[arg(long)]
    pub nsamples: Option<usize>,

    /// Override the calibration crop seed
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Print the resolved configuration
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to quantized artifacts
    #[arg(value_name = "ARTIFACTS")]
    pub artifacts: PathBuf,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for info command
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!(
                "Unknown output format: {s}. Valid formats: text, json, yaml"
            )),
        }
    }
}

fn parse_group_size(s: &str) -> Result<GroupSize, String> {
    let value: i64 = s
        .parse()
        .map_err(|e| format!("invalid group size {s:?}: {e}"))?;
    GroupSize::try_from(value)
}

/// Parse command line arguments
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to the config defaults
pub fn apply_overrides(config: &mut GptqConfig, args: &QuantizeArgs) {
    if let Some(bits) = args.bits {
        config.defaults.bits = bits;
    }
    if let Some(group_size) = args.group_size {
        config.defaults.group_size = group_size;
    }
    if args.act_order {
        config.defaults.act_order = true;
    }
    if args.sym {
        config.defaults.symmetric = true;
    }
    if args.asym {
        config.defaults.symmetric = false;
    }
    if let Some(nsamples) = args.nsamples {
        config.calibration.nsamples = nsamples;
    }
    if let Some(seed) = args.seed {
        config.calibration.seed = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantize_command() {
        let cli = parse_args([
            "cuantizar",
            "quantize",
            "w.safetensors",
            "--calibration",
            "c.safetensors",
            "--output",
            "out.safetensors",
        ])
        .unwrap();
        match cli.command {
            Command::Quantize(args) => {
                assert_eq!(args.weights, PathBuf::from("w.safetensors"));
                assert_eq!(args.calibration, PathBuf::from("c.safetensors"));
                assert!(args.config.is_none());
                assert!(!args.act_order);
            }
            _ => panic!("Expected Quantize command"),
        }
    }

    #[test]
    fn test_parse_quantize_with_overrides() {
        let cli = parse_args([
            "cuantizar",
            "quantize",
            "w.json",
            "-c",
            "c.json",
            "-o",
            "out.json",
            "--bits",
            "3",
            "--group-size",
            "-1",
            "--act-order",
            "--asym",
        ])
        .unwrap();

        let Command::Quantize(args) = cli.command else {
            panic!("Expected Quantize command");
        };
        assert_eq!(args.bits, Some(3));
        assert_eq!(args.group_size, Some(GroupSize::WholeRow));

        let mut config = GptqConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.defaults.bits, 3);
        assert_eq!(config.defaults.group_size, GroupSize::WholeRow);
        assert!(config.defaults.act_order);
        assert!(!config.defaults.symmetric);
    }

    #[test]
    fn test_sym_conflicts_with_asym() {
        let result = parse_args([
            "cuantizar", "quantize", "w.json", "-c", "c.json", "-o", "o.json", "--sym", "--asym",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_group_size() {
        let result = parse_args([
            "cuantizar", "quantize", "w.json", "-c", "c.json", "-o", "o.json", "-g", "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_validate_and_info() {
        let cli = parse_args(["cuantizar", "validate", "gptq.yaml", "--detailed"]).unwrap();
        assert!(matches!(cli.command, Command::Validate(ValidateArgs { detailed: true, .. })));

        let cli = parse_args(["cuantizar", "-v", "info", "out.safetensors", "--format", "json"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Info(args) => assert_eq!(args.format, OutputFormat::Json),
            _ => panic!("Expected Info command"),
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("YAML".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
