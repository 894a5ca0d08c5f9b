mod ape;
mod cli;
mod elf;
mod header;
mod loader;
mod macho;
mod pe;
mod script;

use anyhow::Result;
use clap::Parser;
use cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    let arch = match ape::Arch::from_str(&args.arch) {
        Some(arch) => arch,
        None => anyhow::bail!(
            "unknown architecture {:?} (expected x86_64 or aarch64)",
            args.arch
        ),
    };

    ape::convert(&args.input, arch)
}
