use std::process::ExitCode;

use clap::Parser;
use shieldlaunch::cli::{self, Cli};
use shieldlaunch::error::DeployError;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli::dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                DeployError::Validation(v) => eprintln!("{}", v.report()),
                other => eprintln!("error: {other}"),
            }
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
