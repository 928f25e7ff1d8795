mod assembler;
mod cli;
mod error;
mod manifest;
mod nfs;
mod pipeline;
mod sink;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use clap::Parser;
use cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    pipeline::run(&args)
}
