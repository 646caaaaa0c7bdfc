//! novelkb CLI: turn a novel into a character-relation knowledge base.
//!
//! Four stages, each reading the previous stage's file:
//! `chunk` → `extract` → `merge` → `build-docs`.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
