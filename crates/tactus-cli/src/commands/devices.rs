//! Audio device listing command.

use clap::{Args, Subcommand};
use tactus_config::BackendKind;

use super::common::{CliBackend, open_backend};

#[derive(Args)]
pub struct DevicesArgs {
    #[command(subcommand)]
    command: Option<DevicesCommand>,

    /// Backend to query
    #[arg(long, value_enum, default_value = "cpal")]
    backend: CliBackend,
}

#[derive(Subcommand)]
enum DevicesCommand {
    /// List all available audio devices
    List,

    /// Show the default output device
    Info,
}

pub fn run(args: DevicesArgs) -> anyhow::Result<()> {
    let backend = open_backend(BackendKind::from(args.backend));

    match args.command.unwrap_or(DevicesCommand::List) {
        DevicesCommand::List => {
            let devices = backend.list_devices()?;

            if devices.is_empty() {
                println!("No audio devices found.");
                return Ok(());
            }

            println!("Available Audio Devices ({})", backend.name());
            println!("=======================\n");

            let inputs: Vec<_> = devices.iter().filter(|d| d.is_input).collect();
            if !inputs.is_empty() {
                println!("Input Devices:");
                for (idx, device) in inputs.iter().enumerate() {
                    println!(
                        "  [{}] {} ({} Hz)",
                        idx, device.name, device.default_sample_rate
                    );
                }
                println!();
            }

            let outputs: Vec<_> = devices.iter().filter(|d| d.is_output).collect();
            if !outputs.is_empty() {
                println!("Output Devices:");
                for (idx, device) in outputs.iter().enumerate() {
                    println!(
                        "  [{}] {} ({} Hz)",
                        idx, device.name, device.default_sample_rate
                    );
                }
                println!();
            }

            println!(
                "Total: {} input(s), {} output(s)",
                inputs.len(),
                outputs.len()
            );
            println!();
            println!("Tip: Use a partial device name with --device:");
            println!("  tactus play --device \"USB\"");
        }

        DevicesCommand::Info => match backend.default_output_device()? {
            Some(device) => {
                println!("Default Output ({}):", backend.name());
                println!("  Name: {}", device.name);
                println!("  Sample Rate: {} Hz", device.default_sample_rate);
            }
            None => println!("Default Output: None"),
        },
    }

    Ok(())
}
