mod cli;
mod completion;
mod dispatch;
mod interrupt;
mod logging;
mod render;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::Cli;
use crate::dispatch::run_cli;
use crate::render::{current_output_style, render_status_line};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "err", &format!("error: {err:#}"))
            );
            ExitCode::FAILURE
        }
    }
}
