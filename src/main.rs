//! Fermata CLI - remote compute instances with idle auto-stop

use std::process::ExitCode;

use clap::Parser;

use fermata::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fermata=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let debug = cli.debug;
    match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            if debug {
                eprintln!("Error: {e:?}");
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
