use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod webhook;

use commands::{InspectCmd, OnceArgs, RunArgs};

#[derive(Parser)]
#[command(name = "recon", version, about = "Feed reconciliation pipeline")]
struct Cli {
    /// TOML config file; environment overrides apply on top
    #[arg(long, global = true, env = "RECON_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycles on an interval until interrupted
    Run(RunArgs),
    /// Run a single cycle and print its outcome (JSON)
    Once(OnceArgs),
    /// Inspect or maintain the store
    #[command(flatten)]
    Inspect(InspectCmd),
    /// Print the JSON Schema for the config file
    ConfigSchema {
        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() {
    recon_otel::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(cli.config.as_deref(), &args).await,
        Commands::Once(args) => commands::run::execute_once(cli.config.as_deref(), &args).await,
        Commands::Inspect(cmd) => commands::inspect::execute(cli.config.as_deref(), cmd),
        Commands::ConfigSchema { pretty } => commands::inspect::print_schema(pretty),
    };
    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
