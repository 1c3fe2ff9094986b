mod cli;
mod config;
mod render;
mod source;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{GlobalArgs, LogFormat};

fn init_logging(global: &GlobalArgs) {
    let filter = if global.debug {
        EnvFilter::new("info,aifx=debug,forensics_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,aifx=info,forensics_core=info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match global.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = cli::Cli::parse();

    //  Logging
    init_logging(&args.global);

    match args.command {
        cli::Commands::Scan(scan_args) => cli::scan::execute(scan_args).await,
        cli::Commands::Config(c) => {
            cli::config_cmd::execute(c).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
