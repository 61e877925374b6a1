use std::{path::Path, process};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod tail;

#[derive(Parser, Debug)]
#[clap(author, version, about = "SSELine - Server-Sent Events toolkit", long_about = None)]
struct Opts {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Connect to an event stream and print every event
    Tail(tail::TailCommand),
}

#[tokio::main]
async fn main() {
    // Load .env before parsing so env fallbacks see its values
    load_env_file(Path::new("."));

    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = handle_command(opts).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Load environment variables from a .env file in the given directory
fn load_env_file(dir: &Path) {
    let env_file_path = dir.join(".env");

    match dotenvy::from_path(&env_file_path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", env_file_path.display());
        }
        Err(e) if e.not_found() => {
            // .env file not found is fine, just continue silently
        }
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                env_file_path.display(),
                e
            );
        }
    }
}

async fn handle_command(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Tail(cmd) => cmd.execute().await,
    }
}
