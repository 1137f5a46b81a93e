//! Shared CLI helpers used across multiple commands.

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use tactus_config::{BackendKind, EngineConfig, default_config_path, find_session};
use tactus_core::nodes::{Bus, Fader, Metronome, SineSource};
use tactus_core::persist::NodeSpec;
use tactus_core::{Engine, GraphDescription, NodeId, NodeRegistry};
use tactus_io::{AudioBackend, CpalBackend, NullBackend};

/// Backend choice on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CliBackend {
    /// System audio through cpal
    Cpal,
    /// Silent timer-driven backend
    Null,
}

impl From<CliBackend> for BackendKind {
    fn from(b: CliBackend) -> Self {
        match b {
            CliBackend::Cpal => BackendKind::Cpal,
            CliBackend::Null => BackendKind::Null,
        }
    }
}

/// Engine settings shared by `render` and `play`.
///
/// Values given here override the configuration file.
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Configuration file (defaults to the user config path)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Sample rate in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Block size in frames
    #[arg(long)]
    pub block_size: Option<u32>,

    /// Largest number of nodes processed concurrently
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Tempo in BPM
    #[arg(long)]
    pub bpm: Option<f64>,
}

impl EngineArgs {
    /// Loads the configuration file and applies command-line overrides.
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let path = self.config.clone().unwrap_or_else(default_config_path);
        let mut config = if self.config.is_some() {
            EngineConfig::load(&path)?
        } else {
            EngineConfig::load_or_default(&path)?
        };
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(block) = self.block_size {
            config.block_size = block;
        }
        if let Some(parallelism) = self.parallelism {
            config.max_parallelism = parallelism;
        }
        if let Some(bpm) = self.bpm {
            config.bpm = bpm;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Creates the backend named in the configuration.
pub fn open_backend(kind: BackendKind) -> Box<dyn AudioBackend> {
    match kind {
        BackendKind::Cpal => Box::new(CpalBackend::new()),
        BackendKind::Null => Box::new(NullBackend::new()),
    }
}

/// A session loaded into an engine.
pub struct Session {
    /// Output node the backend plays.
    pub output: NodeId,
    /// Channels of that output.
    pub channels: u16,
}

/// Loads the named session, or builds the demo session when `name` is `None`.
///
/// `bpm` replaces the saved tempo of a loaded session.
pub fn load_session(
    engine: &mut Engine,
    name: Option<&str>,
    bpm: Option<f64>,
) -> anyhow::Result<Session> {
    let Some(name) = name else {
        return demo_session(engine);
    };
    let path = find_session(name).ok_or_else(|| {
        anyhow::anyhow!("Session '{}' not found (tried the path and the sessions directory)", name)
    })?;
    let description = read_description(&path)?;
    let ids = engine.load_description(&description, &NodeRegistry::with_builtins())?;
    if let Some(bpm) = bpm {
        engine.edit_tempo(|map| map.set_tempo(0, bpm))?;
    }

    let (index, channels) = description
        .nodes
        .iter()
        .enumerate()
        .find_map(|(i, node)| match node.spec {
            NodeSpec::Output { channels } => Some((i, channels)),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("Session '{}' has no output node", path.display()))?;
    Ok(Session {
        output: ids[index],
        channels,
    })
}

/// Reads a JSON session description.
pub fn read_description(path: &Path) -> anyhow::Result<GraphDescription> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read '{}': {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes the engine's topology as a JSON session description.
pub fn write_description(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&engine.describe())?;
    std::fs::write(path, json)
        .map_err(|e| anyhow::anyhow!("failed to write '{}': {}", path.display(), e))?;
    Ok(())
}

/// Stereo demo: a metronome and a quiet tone through faders into a master bus.
pub fn demo_session(engine: &mut Engine) -> anyhow::Result<Session> {
    let main = engine.add_output("main", 2)?;
    let master = engine.add_processor("master", Box::new(Bus::new(2)))?;
    let click = engine.add_processor("click", Box::new(Metronome::new(0.5)))?;
    let click_fader = engine.add_processor("click fader", Box::new(Fader::new(1)))?;
    let tone = engine.add_processor("tone", Box::new(SineSource::new(220.0, 0.2)))?;
    let tone_fader = engine.add_processor("tone fader", Box::new(Fader::new(1)))?;

    engine.edit(|g| {
        let port = |node: NodeId, slot: usize, input: bool| {
            let id = if input {
                g.input(node, slot)
            } else {
                g.output(node, slot)
            };
            id.ok_or_else(|| {
                tactus_core::StructuralError::InvalidParameter(format!(
                    "demo node has no port {slot}"
                ))
            })
        };
        let wires = [
            (click, 0, click_fader, 0, 1.0),
            (tone, 0, tone_fader, 0, 1.0),
            (click_fader, 0, master, 0, 1.0),
            (click_fader, 0, master, 1, 1.0),
            (tone_fader, 0, master, 0, 0.7),
            (tone_fader, 0, master, 1, 0.7),
            (master, 0, main, 0, 1.0),
            (master, 1, main, 1, 1.0),
        ];
        let wires = wires
            .into_iter()
            .map(|(from, output, to, input, gain)| {
                Ok((port(from, output, false)?, port(to, input, true)?, gain))
            })
            .collect::<Result<Vec<_>, tactus_core::StructuralError>>()?;
        for (source, dest, gain) in wires {
            g.connect(source, dest, gain)?;
        }
        Ok(())
    })?;

    if let Some(gain_db) = engine.graph().input(tone_fader, 1) {
        engine.set_control(gain_db, -6.0)?;
    }

    Ok(Session {
        output: main,
        channels: 2,
    })
}

/// Prints the compiled order, stage layout and latency.
pub fn print_schedule(engine: &Engine) {
    let schedule = engine.schedule();
    let graph = engine.graph();
    println!("Schedule (generation {})", schedule.generation());
    for (i, node) in schedule.order().iter().enumerate() {
        let name = graph.node_name(*node).unwrap_or("?");
        println!("  {:>2}. {}", i + 1, name);
    }
    println!(
        "  {} node(s), {} stage(s), max parallelism {}, latency {} samples",
        schedule.node_count(),
        schedule.stages().len(),
        schedule.max_parallelism(),
        schedule.total_latency()
    );
}
