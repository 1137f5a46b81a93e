//! Tactus CLI - Command-line interface for the Tactus engine.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tactus")]
#[command(author, version, about = "Tactus signal graph engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio devices
    Devices(commands::devices::DevicesArgs),

    /// Render a session offline to a WAV file
    Render(commands::render::RenderArgs),

    /// Play a session through an audio backend
    Play(commands::play::PlayArgs),

    /// Show or create the engine configuration
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices(args) => commands::devices::run(args),
        Commands::Render(args) => commands::render::run(args),
        Commands::Play(args) => commands::play::run(args),
        Commands::Config(args) => commands::config::run(args),
    }
}
