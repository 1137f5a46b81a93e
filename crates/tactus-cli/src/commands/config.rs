//! Engine configuration command.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use tactus_config::{EngineConfig, default_config_path};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show {
        /// Configuration file (defaults to the user config path)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Write a default configuration file
    Init {
        /// Where to write it (defaults to the user config path)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the default configuration path
    Path,
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show { path } => {
            let path = path.unwrap_or_else(default_config_path);
            let config = if path.exists() {
                println!("# {}", path.display());
                EngineConfig::load(&path)?
            } else {
                println!("# {} (not found, showing defaults)", path.display());
                EngineConfig::default()
            };
            if let Err(e) = config.validate() {
                println!("# warning: {e}");
            }
            print!("{}", config.to_toml()?);
        }

        ConfigCommand::Init { path, force } => {
            let path = path.unwrap_or_else(default_config_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "'{}' already exists. Use --force to overwrite.",
                    path.display()
                );
            }
            EngineConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }

        ConfigCommand::Path => {
            println!("{}", default_config_path().display());
        }
    }

    Ok(())
}
