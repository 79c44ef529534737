use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod output;

pub use output::OutputMode;

#[derive(Parser)]
#[command(name = "cartwatch")]
#[command(version)]
#[command(about = "Watches product pages and buys once the price drops", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config/default.toml", env = "CARTWATCH_CONFIG")]
    pub config: PathBuf,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch every configured product until it is bought or given up on
    Run,
    /// Validate the configuration and list the watched products
    Check,
    /// List the store kinds this build can automate
    Stores,
}
