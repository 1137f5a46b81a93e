//! Offline render command.

use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use tactus_core::{Bbt, Engine};
use tactus_io::{WavSpec, write_wav};

use super::common::{EngineArgs, load_session, print_schedule, write_description};

#[derive(Args)]
pub struct RenderArgs {
    /// Output WAV file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Session name or JSON file (renders the demo session if omitted)
    #[arg(short, long)]
    session: Option<String>,

    /// Duration in seconds
    #[arg(long, default_value = "4.0")]
    seconds: f64,

    /// Loop the first N bars while rendering
    #[arg(long)]
    loop_bars: Option<u32>,

    /// Also save the session description as JSON
    #[arg(long, value_name = "PATH")]
    save_session: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineArgs,
}

pub fn run(args: RenderArgs) -> anyhow::Result<()> {
    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        anyhow::bail!("--seconds must be positive, got {}", args.seconds);
    }
    let config = args.engine.load_config()?;
    let (mut engine, mut scheduler) = Engine::new(config.engine_options())?;
    let session = load_session(&mut engine, args.session.as_deref(), args.engine.bpm)?;

    if let Some(path) = &args.save_session {
        write_description(&engine, path)?;
        println!("Saved session: {}", path.display());
    }

    let transport = engine.transport().clone();
    if let Some(bars) = args.loop_bars.filter(|b| *b > 0) {
        let end = loop_end(&engine, bars);
        transport.set_loop(0, end)?;
        transport.set_loop_enabled(true)?;
        println!("Looping {} bar(s) ({} samples)", bars, end);
    }
    transport.play()?;

    print_schedule(&engine);

    let sample_rate = config.sample_rate;
    let channels = usize::from(session.channels);
    let block = config.block_size as usize;
    let total = (args.seconds * f64::from(sample_rate)).round() as usize;
    let mut samples = vec![0.0f32; total * channels];

    println!(
        "\nRendering '{}' for {:.2}s at {} Hz, block {} ({} channel(s))",
        engine.graph().node_name(session.output).unwrap_or("output"),
        args.seconds,
        sample_rate,
        block,
        channels
    );

    let started = Instant::now();
    for chunk in samples.chunks_mut(block * channels) {
        scheduler.render(chunk, channels);
        for failure in engine.maintain() {
            println!(
                "  node {} failed {} time(s): {}",
                failure.node, failure.count, failure.first
            );
        }
    }
    let elapsed = started.elapsed();

    write_wav(
        &args.output,
        &samples,
        WavSpec {
            channels: session.channels,
            sample_rate,
            bits_per_sample: 32,
        },
    )?;

    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let stats = scheduler.stats();
    let realtime = args.seconds / elapsed.as_secs_f64().max(1e-9);
    println!(
        "Rendered {} frames in {:.1} ms ({:.0}x real time)",
        total,
        elapsed.as_secs_f64() * 1000.0,
        realtime
    );
    println!(
        "  blocks: {}, sub-blocks: {}, node failures: {}, peak: {:.3}",
        stats.blocks, stats.sub_blocks, stats.node_failures, peak
    );
    println!("Wrote {}", args.output.display());
    Ok(())
}

/// End sample of the first `bars` bars.
fn loop_end(engine: &Engine, bars: u32) -> u64 {
    let map = engine.tempo_map();
    let bar = Bbt {
        bar: bars + 1,
        beat: 1,
        tick: 0.0,
    };
    map.bbt_to_samples(bar).round() as u64
}

