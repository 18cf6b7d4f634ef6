//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Probabilistic load shedding in front of an HTTP service
#[derive(Parser, Debug)]
#[command(name = "load-shedder")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "LOAD_SHEDDER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "LOAD_SHEDDER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "LOAD_SHEDDER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "LOAD_SHEDDER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOAD_SHEDDER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the demo server (default)
    Serve,

    /// Validate the shedding configuration and exit
    Check {
        /// Print the effective configuration as YAML
        #[arg(long)]
        print: bool,
    },
}
