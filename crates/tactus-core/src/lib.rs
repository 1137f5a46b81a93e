//! Tactus Core - real-time signal graph and transport clock for a DAW engine
//!
//! This crate turns a user-editable routing topology into a fixed, ordered
//! execution plan and runs it once per audio block against a sample-accurate
//! musical timeline.
//!
//! # Core Abstractions
//!
//! ## Topology (edit thread)
//!
//! - [`Graph`] - Nodes, typed ports and weighted connections with cycle
//!   validation at connect time
//! - [`Processor`] - Object-safe trait for anything that processes a block
//! - [`nodes`] - Built-in processors: buses, faders, test sources, metronome
//!
//! ## Compilation and publication
//!
//! - [`Schedule`] - Immutable execution order, latency compensation and
//!   parallel stages, compiled from a graph snapshot
//! - [`Engine`] - Compiles and publishes every edit; the real-time side picks
//!   it up at the next block boundary without locks
//!
//! ## Real-time execution
//!
//! - [`Scheduler`] - Owned by the audio callback; processes a block
//! - [`Transport`] / [`TransportHandle`] - Play state, loop and punch ranges,
//!   block splitting at loop wraps and tempo changes
//! - [`TempoMap`] - Sample ↔ tick ↔ bar/beat conversion
//!
//! ## Recording
//!
//! - [`Recorder`] - Lock-free capture from armed nodes into recorded regions
//!
//! # Example
//!
//! ```rust
//! use tactus_core::{Engine, EngineOptions};
//! use tactus_core::nodes::SineSource;
//!
//! let (mut engine, mut scheduler) = Engine::new(EngineOptions::default()).unwrap();
//! let out = engine.add_output("main", 1).unwrap();
//! let tone = engine.add_processor("tone", Box::new(SineSource::new(440.0, 0.5))).unwrap();
//!
//! let src = engine.graph().output(tone, 0).unwrap();
//! let dst = engine.graph().input(out, 0).unwrap();
//! engine.connect(src, dst, 1.0).unwrap();
//!
//! // On the audio thread:
//! let mut block = vec![0.0f32; 512];
//! scheduler.render(&mut block, 1);
//! assert!(block.iter().any(|s| *s != 0.0));
//! ```
//!
//! # Design Principles
//!
//! - **Real-time safe**: no allocation, blocking or logging in
//!   [`Scheduler::process`]
//! - **Contained failures**: a failing node produces silence and a report,
//!   never a missed block
//! - **Deterministic**: equal graphs compile to equal schedules and render
//!   equal output

pub mod buffer;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod graph;
pub mod id;
pub mod monitor;
pub mod node;
pub mod nodes;
pub mod param;
pub mod persist;
mod pool;
pub mod port;
mod publish;
pub mod recording;
pub mod schedule;
pub mod scheduler;
pub mod tempo;
pub mod transport;

pub use buffer::{Event, EventBuffer, EventDelay, PortBuffer, SignalDelay};
pub use engine::{Engine, EngineOptions};
pub use error::{PersistError, ProcessError, StructuralError, TransportError};
pub use graph::{ConnectionInfo, DEFAULT_EVENT_CAPACITY, Graph, PortInfo};
pub use id::{AnyId, ConnectionId, NodeId, PortId};
pub use monitor::{EngineMonitor, FailureSummary};
pub use node::{NodeCell, NodeKind, NodeShared, ProcessContext, ProcessResult, Processor};
pub use param::{SmoothedParam, db_to_linear, linear_to_db};
pub use persist::{GraphDescription, NodeRegistry};
pub use port::{ControlRange, PortDirection, PortKind, PortSpec};
pub use publish::Versioned;
pub use recording::{RecordedRegion, Recorder, RecordingMode, RegionContent, TimedEvent};
pub use schedule::{Schedule, Stage, WorkUnit};
pub use scheduler::{BlockIo, Scheduler, SchedulerStats};
pub use tempo::{Bbt, TICKS_PER_QUARTER, TempoError, TempoMap};
pub use transport::{
    PlayState, SampleRange, SubBlock, Transport, TransportCommand, TransportHandle, TransportInfo,
    TransportSnapshot,
};
