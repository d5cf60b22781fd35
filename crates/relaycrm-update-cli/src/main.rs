use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = relaycrm_update_cli::Cli::parse();
    relaycrm_update_cli::run_cli(cli)
}
