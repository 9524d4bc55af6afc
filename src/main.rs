//! Cuantizar CLI
//!
//! # Usage
//!
//! ```bash
//! # Quantize a chain of linear layers
//! cuantizar quantize weights.safetensors -c calib.safetensors -o out.safetensors
//!
//! # With a config file and overrides
//! cuantizar quantize weights.json -c calib.json --config gptq.yaml -o out.json --bits 3 --act-order
//!
//! # Validate config
//! cuantizar validate gptq.yaml --detailed
//!
//! # Inspect artifacts
//! cuantizar info out.safetensors --format json
//! ```

use clap::Parser;
use cuantizar::config::{
    load_config, quantize_from_args, Cli, Command, InfoArgs, OutputFormat, QuantizeArgs,
    ValidateArgs,
};
use cuantizar::io::load_artifacts;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose/quiet flags
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Quantize(args) => run_quantize(args, cli.quiet),
        Command::Validate(args) => run_validate(args, cli.quiet),
        Command::Info(args) => run_info(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_quantize(args: QuantizeArgs, quiet: bool) -> Result<(), String> {
    let report = quantize_from_args(&args).map_err(|e| e.to_string())?;

    if !quiet {
        println!(
            "Quantized {} layers ({} skipped), total loss {:.6}",
            report.layers.len(),
            report.skipped.len(),
            report.total_loss()
        );
        println!("Artifacts written to {}", args.output.display());
    }
    Ok(())
}

fn run_validate(args: ValidateArgs, quiet: bool) -> Result<(), String> {
    let config = load_config(&args.config).map_err(|e| e.to_string())?;

    if !quiet {
        println!("Configuration is valid: {}", args.config.display());
    }

    if args.detailed {
        let d = &config.defaults;
        println!();
        println!("Defaults:");
        println!("  Bits: {}", d.bits);
        println!("  Group size: {}", d.group_size);
        println!("  Block size: {}", d.block_size);
        println!("  Damp fraction: {}", d.damp_fraction);
        println!("  Symmetric: {}", d.symmetric);
        println!("  Act order: {}", d.act_order);
        if d.use_mse_search {
            println!(
                "  MSE search: norm={} grid={} max_shrink={}",
                d.norm, d.grid, d.max_shrink
            );
        }
        if !config.layers.is_empty() {
            println!();
            println!("Overrides (in match order):");
            for (pattern, _) in &config.layers {
                println!("  {pattern}");
            }
        }
        if !config.exclude.is_empty() {
            println!();
            println!("Excluded: {}", config.exclude.join(", "));
        }
        let c = &config.calibration;
        println!();
        println!(
            "Calibration: {} samples, length {}{}, seed {}",
            c.nsamples,
            c.pad_max_length,
            if c.use_max_length { " (fixed)" } else { "" },
            c.seed
        );
    }

    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), String> {
    let report = load_artifacts(&args.artifacts).map_err(|e| e.to_string())?;

    match args.format {
        OutputFormat::Text => {
            println!("Artifacts: {}", args.artifacts.display());
            println!();
            for (name, layer) in &report.layers {
                println!(
                    "{name}: {:?} {}-bit group={} {} {}loss={:.6} sqnr={:.2} dB",
                    layer.shape,
                    layer.bits,
                    layer.group_size,
                    if layer.symmetric { "sym" } else { "asym" },
                    if layer.act_order() { "act_order " } else { "" },
                    layer.loss,
                    layer.weight_error.sqnr_db
                );
            }
            if !report.skipped.is_empty() {
                println!();
                println!("Skipped: {}", report.skipped.join(", "));
            }
            if let Some(calibration) = &report.calibration {
                println!();
                println!(
                    "Calibration: {}/{} samples ({} cropped, {} skipped)",
                    calibration.selected,
                    calibration.requested,
                    calibration.cropped,
                    calibration.skipped
                );
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| format!("JSON serialization error: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&report)
                .map_err(|e| format!("YAML serialization error: {e}"))?;
            println!("{yaml}");
        }
    }

    Ok(())
}
