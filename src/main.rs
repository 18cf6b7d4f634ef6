//! Load Shedder - probabilistic admission control demo server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use load_shedder::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
    shed::LoadShedder,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    match cli.command {
        Some(Command::Check { print }) => run_check(&config, print).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Validate the shedding configuration without serving
async fn run_check(config: &Config, print: bool) -> ExitCode {
    match LoadShedder::from_config(&config.shedding) {
        Ok(shedder) => {
            shedder.shutdown().await;
            let aggregators = config.enabled_aggregators();
            if aggregators.is_empty() {
                println!("✅ Configuration valid (passthrough: no aggregators enabled)");
            } else {
                println!("✅ Configuration valid: {}", aggregators.join(", "));
            }

            if print {
                match serde_yaml::to_string(config) {
                    Ok(yaml) => println!("\n{yaml}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize configuration: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Invalid configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the demo server
async fn run_server(config: Config) -> ExitCode {
    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to create server");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
