//! CLI wiring for the offload harness.

use crate::bridge::{simulated_backend, BridgeStage, ExecutionPath, MatrixBridge};
use crate::config::BridgeConfig;
use crate::eval::{compare, parse_operands, EvaluationSuite, SuiteReport};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use manycore_backend::FaultInjector;
use manycore_kernels::config::{Dimension, MatmulProblem, MatmulVariant};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "manycore-bench", about = "Manycore matmul offload harness")]
pub struct Cli {
    /// JSON bridge config; environment overrides apply on top.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    pub variant: Option<VariantArg>,

    /// Program image exporting the matmul entry points.
    #[arg(long, global = true)]
    pub binary: Option<PathBuf>,

    /// Tile-group shape as `XxY`, e.g. `2x2`.
    #[arg(long, global = true, value_parser = parse_dimension)]
    pub tile_group: Option<Dimension>,

    /// Tile groups the linear-index kernel spreads the output over.
    #[arg(long, global = true)]
    pub linear_groups: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum VariantArg {
    BlockTiled,
    LinearIndex,
}

impl From<VariantArg> for MatmulVariant {
    fn from(value: VariantArg) -> MatmulVariant {
        match value {
            VariantArg::BlockTiled => MatmulVariant::BlockTiled,
            VariantArg::LinearIndex => MatmulVariant::LinearIndex,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Multiply two 4x4 matrices (32 values, A then B) on host and device.
    Multiply {
        /// Read operands from a file instead of stdin.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Emit the comparison report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Fail the offload at this stage to exercise the host fallback.
        #[arg(long)]
        inject_fault: Option<BridgeStage>,
    },
    /// Run the deterministic offload suite and emit a JSON report.
    Suite {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = resolve_config(&cli)?;
    info!(
        device = %config.device,
        binary = %config.resolved_binary().display(),
        variant = %config.variant,
        tile_group = %config.planner.tile_group,
        "bridge configured"
    );

    match cli.command {
        Command::Multiply {
            input,
            json,
            inject_fault,
        } => {
            let text = match input {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?,
            };
            let (lhs, rhs) = parse_operands(&text)?;

            let fault = inject_fault.map(|stage| stage.fault_point());
            let bridge = MatrixBridge::new(config, move |config: &BridgeConfig| {
                let backend = FaultInjector::new(simulated_backend(config));
                match fault {
                    Some(point) => backend.fail_at(point),
                    None => backend,
                }
            });

            let report = compare(&bridge, MatmulProblem::square(4), &lhs, &rhs)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
                if let ExecutionPath::CpuFallback { code } = report.path {
                    println!("Device offload failed with code {code}; result computed on the host.");
                }
            }
        }
        Command::Suite { output, baseline } => {
            let bridge = MatrixBridge::simulated(config);
            let report = EvaluationSuite::offload_smoke().run(&bridge);

            println!(
                "cases={}, passed={}, generated_at={}",
                report.cases.len(),
                report.passed(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: variant={} status={} latency_ms={:.3} gflops={:.6} max_abs_error={}",
                    case.case,
                    case.variant,
                    case.status,
                    case.latency_ms,
                    case.gflops,
                    case.max_abs_error
                        .map(|error| format!("{error:.3e}"))
                        .unwrap_or_else(|| "n/a".to_string())
                );
            }

            if let Some(path) = baseline {
                if path.exists() {
                    let baseline_blob = fs::read_to_string(&path)?;
                    let baseline_report: SuiteReport = serde_json::from_str(&baseline_blob)?;
                    for (name, delta) in report.diff(&baseline_report) {
                        println!(
                            "Δ {}: latency_ms={:+.3} gflops={:+.6}",
                            name, delta.latency_ms_delta, delta.gflops_delta
                        );
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }

            if let Some(path) = output {
                fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
        }
    }
    Ok(())
}

/// File (if any), then environment, then command-line flags.
fn resolve_config(cli: &Cli) -> Result<BridgeConfig> {
    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(variant) = cli.variant {
        config.variant = variant.into();
    }
    if let Some(binary) = &cli.binary {
        config.binary_path = binary.clone();
    }
    if let Some(tile_group) = cli.tile_group {
        config.planner.tile_group = tile_group;
    }
    if let Some(groups) = cli.linear_groups {
        config.planner.linear_groups = groups;
    }
    Ok(config)
}

fn parse_dimension(value: &str) -> Result<Dimension, String> {
    let (x, y) = value
        .split_once(|c: char| c == 'x' || c == 'X')
        .ok_or_else(|| format!("`{value}` is not of the form XxY"))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u32>()
            .map_err(|err| format!("`{part}` in `{value}`: {err}"))
    };
    let dimension = Dimension::new(parse(x)?, parse(y)?);
    if !dimension.is_valid() {
        return Err(format!("`{value}` has a zero component"));
    }
    Ok(dimension)
}
