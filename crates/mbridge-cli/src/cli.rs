use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mbridge_attach::DetachPolicy;
use mbridge_operator::ProviderRetention;

#[derive(Parser)]
#[command(
    name = "mbridge",
    about = "Merge bridge diagnostics over the reference runtime",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the XOR combinator on two hex values
    Xor(XorArgs),
    /// Drive an associative adapter from many native threads
    Stress(StressArgs),
    /// Print the effective bridge configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct XorArgs {
    /// Existing value as hex, or `-` for none
    pub existing: String,
    /// Incoming value as hex
    pub incoming: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BufferArg {
    /// Copy arguments into managed arrays
    Copy,
    /// Pass zero-copy views over native memory
    View,
}

#[derive(Args)]
pub struct StressArgs {
    #[arg(long, default_value = "8")]
    pub threads: usize,
    /// Calls per thread
    #[arg(long, default_value = "10000")]
    pub calls: usize,
    /// lazy or eager
    #[arg(long, default_value = "lazy")]
    pub policy: DetachPolicy,
    #[arg(long, default_value = "copy")]
    pub mode: BufferArg,
    /// pin or allow-collection
    #[arg(long, default_value = "pin")]
    pub retention: ProviderRetention,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML file to start from
    #[arg(long)]
    pub file: Option<PathBuf>,
}
