pub mod config_cmd;
pub mod scan;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use forensics_core::{ModelFormat, Stage};

#[derive(Parser)]
#[command(
    name = "aifx",
    version,
    about = "Forensic inspector for GGUF and SafeTensors model files"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Enable debug logging for aifx and the analysis core.
    #[arg(long, global = true, env = "AIFX_DEBUG")]
    pub debug: bool,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "AIFX_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze one or more model files.
    Scan(ScanArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct ScanArgs {
    /// Model files to analyze.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Force the container format instead of guessing it (gguf, safetensors).
    #[arg(long)]
    pub format: Option<ModelFormat>,

    /// Stages to run (sha256, structure); defaults to the configured stages.
    #[arg(long = "stage", num_args = 1..)]
    pub stages: Vec<Stage>,

    /// Also write all reports as JSON to this file.
    #[arg(long, env = "AIFX_JSON_OUT")]
    pub json_out: Option<PathBuf>,

    /// Additional suspicious template substring (can be repeated).
    #[arg(long = "extra-indicator")]
    pub extra_indicators: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
}
