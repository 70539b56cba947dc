mod app;
mod args;
mod logging;

use anyhow::Result;
use clap::Parser;

use crate::args::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet);
    app::run(cli)
}
