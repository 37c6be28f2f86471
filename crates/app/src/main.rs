mod cli;
mod commands;
mod display;
#[cfg(feature = "with-opencv")]
mod opencv_backend;

use clap::Parser;

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run(args) => commands::run(args),
        Command::Sensors(args) => commands::sensors(args),
        Command::Preview(args) => commands::preview(args),
    }
}
