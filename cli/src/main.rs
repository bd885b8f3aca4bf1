//! Entry point for the `bakeoff` binary.

use clap::Parser;

use bakeoff_cli::Cli;
use bakeoff_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_main(Cli::parse()).await
}
