//! Live playback command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use tactus_core::Engine;
use tactus_io::{AudioDriver, StreamRequest};

use super::common::{CliBackend, EngineArgs, load_session, open_backend, print_schedule};

/// How often the edit side runs maintenance while playing.
const MAINTAIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Args)]
pub struct PlayArgs {
    /// Session name or JSON file (plays the demo session if omitted)
    #[arg(short, long)]
    session: Option<String>,

    /// Backend to use (overrides the configuration file)
    #[arg(long, value_enum)]
    backend: Option<CliBackend>,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<f64>,

    #[command(flatten)]
    engine: EngineArgs,
}

pub fn run(args: PlayArgs) -> anyhow::Result<()> {
    let mut config = args.engine.load_config()?;
    if let Some(backend) = args.backend {
        config.backend.kind = backend.into();
    }
    if args.device.is_some() {
        config.backend.device = args.device.clone();
    }

    let backend = open_backend(config.backend.kind);
    let request = StreamRequest {
        sample_rate: config.sample_rate,
        block_size: config.block_size,
        input_channels: config.backend.input_channels,
        output_channels: config.backend.output_channels,
        device_name: config.backend.device.clone(),
    };
    let negotiated = backend.negotiate(&request)?;

    let options = config.engine_options_for(negotiated.sample_rate, negotiated.block_size);
    let (mut engine, scheduler) = Engine::new(options)?;
    let session = load_session(&mut engine, args.session.as_deref(), args.engine.bpm)?;
    if session.channels != negotiated.output_channels {
        tracing::warn!(
            session = session.channels,
            device = negotiated.output_channels,
            "output channel count differs from the device"
        );
    }

    print_schedule(&engine);
    println!("\nPlaying through '{}'", backend.name());
    println!(
        "  Device: {}",
        negotiated.device_name.as_deref().unwrap_or("default")
    );
    println!("  Sample rate: {} Hz", negotiated.sample_rate);
    println!("  Block size: {} frames", negotiated.block_size);
    println!("\nPress Ctrl+C to stop...\n");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let driver = AudioDriver::start(backend, negotiated, scheduler)?;
    let transport = engine.transport().clone();
    transport.play()?;

    let started = Instant::now();
    let deadline = args
        .seconds
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid --seconds: {e}"))?;
    let mut failed_over = driver.is_failed_over();
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        std::thread::sleep(MAINTAIN_INTERVAL);
        for failure in engine.maintain() {
            println!(
                "  node {} failed {} time(s): {}",
                failure.node, failure.count, failure.first
            );
        }
        if !failed_over && driver.is_failed_over() {
            failed_over = true;
            println!("  Device lost, continuing on '{}'", driver.backend_name());
        }
    }

    let snapshot = transport.snapshot();
    transport.stop()?;
    let stats = driver.stats();
    let period = driver.period();
    drop(driver.stop());

    println!(
        "Played {:.2}s ({} samples)",
        started.elapsed().as_secs_f64(),
        snapshot.position
    );
    println!(
        "  callbacks: {}, xruns: {}, failovers: {}, worst load: {:.0}%",
        stats.callbacks,
        stats.xruns,
        stats.failovers,
        stats.worst_load(period) * 100.0
    );
    println!("Done!");
    Ok(())
}
