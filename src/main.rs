use std::process::ExitCode;

use clap::Parser;

use impasto::cli::{self, CliArgs};
use impasto::logger;

fn main() -> ExitCode {
    // Session log (overwrites the previous session's file)
    logger::init();

    let args = CliArgs::parse();
    cli::run(args)
}
