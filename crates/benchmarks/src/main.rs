//! Offload harness executable for the manycore matmul bridge.

use anyhow::Result;
use clap::Parser;
use manycore_bridge::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
