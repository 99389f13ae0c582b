use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = runledger_cli::Cli::parse();
    runledger_cli::run_cli(cli)
}
