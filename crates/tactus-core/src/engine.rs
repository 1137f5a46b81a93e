//! Edit-side facade tying the graph, schedule publication, transport and
//! recording together.
//!
//! [`Engine::new`] returns the engine and its real-time [`Scheduler`]. The
//! scheduler goes to the audio callback; everything else stays on the edit
//! thread:
//!
//! ```text
//! edit thread                               audio thread
//! ───────────                               ────────────
//! Engine::connect ─► Graph ─► compile ─► publish ─► Scheduler::process
//! TransportHandle::play ─► command queue ─────────► Transport
//! EngineMonitor::poll ◄── failure queue ◄────────── node failures
//! Recorder::drain ◄──── capture rings ◄───────────── armed nodes
//! ```
//!
//! Each structural edit is compiled and published on success. A failed edit
//! leaves both the graph and the running schedule untouched.
//!
//! Removed nodes are quarantined until the scheduler acknowledges a schedule
//! that no longer contains them, then marked retired and released. Call
//! [`Engine::maintain`] periodically (the CLI does so every few milliseconds)
//! to release memory, pick up latency changes and log failures.

use std::sync::Arc;

use crate::error::{PersistError, StructuralError, TransportError};
use crate::graph::{DEFAULT_EVENT_CAPACITY, Graph};
use crate::id::{ConnectionId, NodeId, PortId};
use crate::monitor::{EngineMonitor, FailureSummary};
use crate::node::{NodeCell, Processor};
use crate::persist::{GraphDescription, NodeRegistry};
use crate::pool::WorkerPool;
use crate::port::{PortDirection, PortKind, PortSpec};
use crate::publish::{self, Publisher, Versioned};
use crate::recording::{RecordedRegion, Recorder, RecordingMode};
use crate::schedule::Schedule;
use crate::scheduler::{RtShared, Scheduler};
use crate::tempo::{TempoError, TempoMap};
use crate::transport::{PlayState, TransportHandle, transport_channel};

type Result<T> = core::result::Result<T, StructuralError>;

/// Engine construction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Largest number of frames processed in one pass.
    pub max_block: usize,
    /// Largest number of work units per stage. 1 runs everything on the audio thread.
    pub max_parallelism: usize,
    /// Worker threads. 0 picks `max_parallelism - 1`.
    pub worker_threads: usize,
    /// Capacity of each event port.
    pub event_capacity: usize,
    /// Failure reports buffered between monitor polls.
    pub failure_queue_capacity: usize,
    /// Transport commands buffered between blocks.
    pub command_queue_capacity: usize,
    /// Whether `stop` returns the playhead to the cue point.
    pub return_to_cue: bool,
    /// Initial tempo.
    pub bpm: f64,
    /// Seconds of audio buffered per armed node between drains.
    pub record_buffer_seconds: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            max_block: 512,
            max_parallelism: 1,
            worker_threads: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            failure_queue_capacity: 1024,
            command_queue_capacity: 256,
            return_to_cue: true,
            bpm: 120.0,
            record_buffer_seconds: 4.0,
        }
    }
}

/// Edit-side owner of the processing graph.
pub struct Engine {
    options: EngineOptions,
    graph: Graph,
    schedules: Publisher<Schedule>,
    tempo: Publisher<TempoMap>,
    tempo_map: TempoMap,
    transport: TransportHandle,
    monitor: EngineMonitor,
    recorder: Recorder,
    /// Removed nodes with the publication that dropped them.
    quarantine: Vec<(u64, Arc<NodeCell>)>,
}

impl Engine {
    /// Creates an engine with an empty graph and its real-time scheduler.
    ///
    /// If worker threads cannot be spawned the scheduler runs every stage on
    /// the audio thread.
    ///
    /// # Errors
    ///
    /// [`StructuralError::InvalidParameter`] for a zero block size,
    /// non-positive sample rate or zero parallelism.
    pub fn new(options: EngineOptions) -> Result<(Self, Scheduler)> {
        if options.max_parallelism == 0 {
            return Err(StructuralError::InvalidParameter(
                "max_parallelism must be at least 1".into(),
            ));
        }
        let graph = Graph::new(options.sample_rate, options.max_block)?
            .with_event_capacity(options.event_capacity);
        let tempo_map = TempoMap::new(options.sample_rate, options.bpm);

        let (schedules, schedule_rx) = publish::channel(graph.compile(options.max_parallelism)?);
        let (tempo, tempo_rx) = publish::channel(tempo_map.clone());
        let (transport, inbox) = transport_channel(options.command_queue_capacity);
        let (failure_tx, failure_rx) = crossbeam_channel::bounded(options.failure_queue_capacity.max(1));
        let rt = Arc::new(RtShared::new(failure_tx));

        let pool = if options.max_parallelism > 1 {
            let threads = match options.worker_threads {
                0 => options.max_parallelism - 1,
                n => n,
            };
            match WorkerPool::new(threads, Arc::clone(&rt)) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!("worker threads unavailable, running single-threaded: {e}");
                    None
                }
            }
        } else {
            None
        };
        let workers = pool.as_ref().map_or(0, WorkerPool::threads);

        let scheduler = Scheduler::new(
            schedule_rx,
            tempo_rx,
            inbox,
            Arc::clone(&rt),
            pool,
            options.return_to_cue,
        );
        tracing::info!(
            sample_rate = options.sample_rate,
            max_block = options.max_block,
            max_parallelism = options.max_parallelism,
            workers,
            "engine initialized"
        );

        let engine = Self {
            graph,
            schedules,
            tempo,
            tempo_map,
            transport,
            monitor: EngineMonitor::new(failure_rx, rt),
            recorder: Recorder::new(),
            quarantine: Vec::new(),
            options,
        };
        Ok((engine, scheduler))
    }

    /// Options the engine was created with, updated by block size and sample
    /// rate changes.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Current topology.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Latest published schedule.
    pub fn schedule(&self) -> Arc<Versioned<Schedule>> {
        self.schedules.current()
    }

    // --- Structural edits (compiled and published on success) ---

    /// Applies several edits and publishes once.
    ///
    /// Edits are not rolled back if a later one fails; the failing edit itself
    /// leaves the graph unchanged and whatever succeeded is published.
    ///
    /// # Errors
    ///
    /// The first error returned by `f`, or a compile failure.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut Graph) -> Result<R>) -> Result<R> {
        let result = f(&mut self.graph);
        let committed = self.commit();
        let value = result?;
        committed?;
        Ok(value)
    }

    /// Adds a processor node.
    ///
    /// # Errors
    ///
    /// Only if the resulting graph fails to compile.
    pub fn add_processor(&mut self, name: impl Into<String>, processor: Box<dyn Processor>) -> Result<NodeId> {
        let id = self.graph.add_processor(name, processor);
        self.commit()?;
        Ok(id)
    }

    /// Adds a backend input node.
    ///
    /// # Errors
    ///
    /// Only if the resulting graph fails to compile.
    pub fn add_input(&mut self, name: impl Into<String>, channels: u16) -> Result<NodeId> {
        let id = self.graph.add_input(name, channels);
        self.commit()?;
        Ok(id)
    }

    /// Adds a backend output node.
    ///
    /// # Errors
    ///
    /// Only if the resulting graph fails to compile.
    pub fn add_output(&mut self, name: impl Into<String>, channels: u16) -> Result<NodeId> {
        let id = self.graph.add_output(name, channels);
        self.commit()?;
        Ok(id)
    }

    /// Adds a feedback node.
    ///
    /// # Errors
    ///
    /// See [`Graph::add_feedback`].
    pub fn add_feedback(&mut self, name: impl Into<String>, channels: u16, delay: u32) -> Result<NodeId> {
        let id = self.graph.add_feedback(name, channels, delay)?;
        self.commit()?;
        Ok(id)
    }

    /// Removes a node and its connections.
    ///
    /// # Errors
    ///
    /// See [`Graph::remove_node`].
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        if self.recorder.is_armed(node) {
            self.recorder.disarm(&self.graph, node)?;
        }
        self.graph.remove_node(node)?;
        self.commit()?;
        Ok(())
    }

    /// Adds a port to a node.
    ///
    /// # Errors
    ///
    /// See [`Graph::create_port`].
    pub fn create_port(&mut self, node: NodeId, kind: PortKind, direction: PortDirection) -> Result<PortId> {
        let port = self.graph.create_port(node, kind, direction)?;
        self.commit()?;
        Ok(port)
    }

    /// Adds a port described by `spec`.
    ///
    /// # Errors
    ///
    /// See [`Graph::create_port_with`].
    pub fn create_port_with(&mut self, node: NodeId, spec: PortSpec) -> Result<PortId> {
        let port = self.graph.create_port_with(node, spec)?;
        self.commit()?;
        Ok(port)
    }

    /// Connects an output port to an input port.
    ///
    /// # Errors
    ///
    /// See [`Graph::connect`]. A rejected connection leaves the running
    /// schedule as it was.
    pub fn connect(&mut self, source: PortId, dest: PortId, multiplier: f32) -> Result<ConnectionId> {
        let id = self.graph.connect(source, dest, multiplier)?;
        if let Err(e) = self.commit() {
            let _ = self.graph.disconnect(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Removes a connection.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the connection does not exist.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        self.graph.disconnect(id)?;
        self.commit()?;
        Ok(())
    }

    /// Changes a connection's gain.
    ///
    /// # Errors
    ///
    /// See [`Graph::set_multiplier`].
    pub fn set_multiplier(&mut self, id: ConnectionId, multiplier: f32) -> Result<()> {
        self.graph.set_multiplier(id, multiplier)?;
        self.commit()?;
        Ok(())
    }

    /// Enables or disables a connection.
    ///
    /// # Errors
    ///
    /// See [`Graph::set_connection_enabled`].
    pub fn set_connection_enabled(&mut self, id: ConnectionId, enabled: bool) -> Result<()> {
        self.graph.set_connection_enabled(id, enabled)?;
        self.commit()?;
        Ok(())
    }

    /// Changes the maximum block size.
    ///
    /// # Errors
    ///
    /// See [`Graph::set_block_size`].
    pub fn set_block_size(&mut self, max_block: usize) -> Result<()> {
        self.graph.set_block_size(max_block)?;
        self.options.max_block = max_block;
        self.commit()?;
        Ok(())
    }

    /// Changes the sample rate of the graph and the tempo map.
    ///
    /// # Errors
    ///
    /// See [`Graph::set_sample_rate`].
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        self.graph.set_sample_rate(sample_rate)?;
        self.options.sample_rate = sample_rate;
        self.tempo_map = self.tempo_map.clone().with_sample_rate(sample_rate);
        self.tempo.publish(self.tempo_map.clone());
        self.commit()?;
        Ok(())
    }

    // --- Live flags (no recompile) ---

    /// Bypasses or un-bypasses a node from the next block on.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn set_bypass(&self, node: NodeId, bypassed: bool) -> Result<()> {
        self.graph.set_bypass(node, bypassed)
    }

    /// Enables or silences a node from the next block on.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn set_enabled(&self, node: NodeId, enabled: bool) -> Result<()> {
        self.graph.set_enabled(node, enabled)
    }

    /// Sets the value of an unconnected control input.
    ///
    /// # Errors
    ///
    /// See [`Graph::set_control`].
    pub fn set_control(&self, port: PortId, value: f32) -> Result<()> {
        self.graph.set_control(port, value)
    }

    /// Runs `f` on a node's processor off the real-time thread.
    ///
    /// Blocks for at most one sub-block while the node is being processed.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn with_processor<R>(&self, node: NodeId, f: impl FnOnce(&mut dyn Processor) -> R) -> Result<Option<R>> {
        self.graph.with_processor(node, f)
    }

    /// Compiles the current topology and publishes it.
    ///
    /// Returns the publication generation.
    ///
    /// # Errors
    ///
    /// [`StructuralError::CycleDetected`] if the topology cannot be ordered.
    pub fn commit(&mut self) -> Result<u64> {
        let schedule = self.graph.compile(self.options.max_parallelism)?;
        let generation = self.schedules.publish(schedule);
        for cell in self.graph.take_removed() {
            self.quarantine.push((generation, cell));
        }
        self.release();
        Ok(generation)
    }

    /// Releases retired schedules and quarantined nodes the scheduler no
    /// longer references.
    fn release(&mut self) -> usize {
        let released = self.schedules.collect() + self.tempo.collect();
        let acked = self.schedules.acknowledged();
        let before = self.quarantine.len();
        self.quarantine.retain(|(generation, cell)| {
            if *generation <= acked {
                cell.shared().mark_retired();
                tracing::debug!("graph_release: {}", cell.id());
                false
            } else {
                true
            }
        });
        released + before - self.quarantine.len()
    }

    /// Removed nodes still waiting for the scheduler to move past them.
    pub fn quarantined(&self) -> usize {
        self.quarantine.len()
    }

    /// Saves the topology and tempo map.
    pub fn describe(&self) -> GraphDescription {
        self.graph.describe(&self.tempo_map)
    }

    /// Adds a saved topology to the graph, adopts its tempo map and publishes
    /// once.
    ///
    /// Returns the new node handles in description order.
    ///
    /// # Errors
    ///
    /// See [`Graph::load_description`]. A rejected description leaves the
    /// graph and the published schedule untouched.
    pub fn load_description(
        &mut self,
        description: &GraphDescription,
        registry: &NodeRegistry,
    ) -> core::result::Result<Vec<NodeId>, PersistError> {
        let ids = self.graph.load_description(description, registry)?;
        self.commit()?;
        self.set_tempo_map(description.tempo.clone());
        Ok(ids)
    }

    // --- Transport and tempo ---

    /// Transport control handle. Clone it to control the transport from other threads.
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Current tempo map.
    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    /// Edits a copy of the tempo map and publishes it if `f` succeeds.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns; the published map is unchanged in that case.
    pub fn edit_tempo<R>(
        &mut self,
        f: impl FnOnce(&mut TempoMap) -> core::result::Result<R, TempoError>,
    ) -> core::result::Result<R, TempoError> {
        let mut map = self.tempo_map.clone();
        let value = f(&mut map)?;
        self.tempo_map = map;
        self.tempo.publish(self.tempo_map.clone());
        tracing::debug!("tempo_publish: {} tempo points", self.tempo_map.tempo_points().count());
        Ok(value)
    }

    /// Replaces the tempo map.
    pub fn set_tempo_map(&mut self, map: TempoMap) {
        self.tempo_map = map.with_sample_rate(self.options.sample_rate);
        self.tempo.publish(self.tempo_map.clone());
    }

    /// Stops the transport and rewinds to the start.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueFull`] if the command cannot be queued.
    pub fn reset_transport(&self) -> core::result::Result<(), TransportError> {
        self.transport.reset()?;
        self.graph.reset_nodes();
        Ok(())
    }

    // --- Recording ---

    /// Arms a node for recording with the configured buffer length.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn arm(&mut self, node: NodeId) -> Result<()> {
        self.recorder
            .arm(&self.graph, node, self.options.record_buffer_seconds)
    }

    /// Disarms a node, keeping what it captured.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node is not armed.
    pub fn disarm(&mut self, node: NodeId) -> Result<()> {
        self.recorder.disarm(&self.graph, node)
    }

    /// Recorder holding captured passes.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Drains capture rings and returns finished regions.
    ///
    /// Passes still being captured are closed only when the transport is no
    /// longer recording.
    pub fn take_recordings(&mut self, mode: RecordingMode) -> Vec<RecordedRegion> {
        self.recorder.drain();
        let snapshot = self.transport.snapshot();
        if !(snapshot.recording && snapshot.state == PlayState::Playing) {
            self.recorder.finish_pass();
        }
        self.recorder.take_regions(mode)
    }

    // --- Maintenance ---

    /// Failure and counter monitor.
    pub fn monitor(&self) -> &EngineMonitor {
        &self.monitor
    }

    /// Periodic housekeeping off the real-time thread:
    ///
    /// - recompiles if a node's latency changed at run time
    /// - releases retired schedules and quarantined nodes
    /// - drains recording rings
    /// - logs and returns node failures
    pub fn maintain(&mut self) -> Vec<FailureSummary> {
        let latency_changed = self.monitor.take_latency_changed();
        if latency_changed || self.schedules.current().latency_stale() {
            match self.commit() {
                Ok(generation) => tracing::debug!("graph_recompensate: generation {generation}"),
                Err(e) => tracing::warn!("latency recompile failed: {e}"),
            }
        }
        self.release();
        self.recorder.drain();
        self.monitor.poll()
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("nodes", &self.graph.node_count())
            .field("connections", &self.graph.connection_count())
            .field("quarantined", &self.quarantine.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::SineSource;

    fn engine() -> (Engine, Scheduler) {
        Engine::new(EngineOptions {
            max_block: 64,
            ..EngineOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn zero_parallelism_rejected() {
        let result = Engine::new(EngineOptions {
            max_parallelism: 0,
            ..EngineOptions::default()
        });
        assert!(matches!(result, Err(StructuralError::InvalidParameter(_))));
    }

    #[test]
    fn each_edit_publishes() {
        let (mut engine, _scheduler) = engine();
        let before = engine.schedule().generation();
        let out = engine.add_output("main", 1).unwrap();
        let sine = engine
            .add_processor("tone", Box::new(SineSource::new(440.0, 0.5)))
            .unwrap();
        let src = engine.graph().output(sine, 0).unwrap();
        let dst = engine.graph().input(out, 0).unwrap();
        engine.connect(src, dst, 1.0).unwrap();
        assert_eq!(engine.schedule().generation(), before + 3);
        assert_eq!(engine.schedule().order(), &[sine, out]);
    }

    #[test]
    fn removed_node_waits_for_acknowledgement() {
        let (mut engine, mut scheduler) = engine();
        let sine = engine
            .add_processor("tone", Box::new(SineSource::new(440.0, 0.5)))
            .unwrap();
        let cell = Arc::clone(engine.graph().node(sine).unwrap());
        scheduler.render(&mut [0.0; 64], 1);

        engine.remove_node(sine).unwrap();
        assert_eq!(engine.quarantined(), 1);
        assert!(!cell.shared().is_retired());

        scheduler.render(&mut [0.0; 64], 1);
        engine.maintain();
        assert_eq!(engine.quarantined(), 0);
        assert!(cell.shared().is_retired());
        assert_eq!(scheduler.stats().retired_hits, 0);
    }

    #[test]
    fn tempo_edit_publishes() {
        let (mut engine, _scheduler) = engine();
        engine.edit_tempo(|map| map.set_tempo(0, 90.0)).unwrap();
        assert_eq!(engine.tempo_map().bpm_at_sample(0), 90.0);
        assert!(engine.edit_tempo(|map| map.set_tempo(0, -1.0)).is_err());
        assert_eq!(engine.tempo_map().bpm_at_sample(0), 90.0);
    }

    #[test]
    fn description_loads_into_fresh_engine() {
        let (mut engine, _scheduler) = engine();
        let out = engine.add_output("main", 1).unwrap();
        let sine = engine
            .add_processor("tone", Box::new(SineSource::new(220.0, 0.25)))
            .unwrap();
        let src = engine.graph().output(sine, 0).unwrap();
        let dst = engine.graph().input(out, 0).unwrap();
        engine.connect(src, dst, 0.5).unwrap();
        engine.edit_tempo(|map| map.set_tempo(0, 100.0)).unwrap();
        let description = engine.describe();

        let (mut copy, mut scheduler) = self::engine();
        let ids = copy
            .load_description(&description, &NodeRegistry::with_builtins())
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(copy.graph().connection_count(), 1);
        assert_eq!(copy.tempo_map().bpm_at_sample(0), 100.0);
        assert_eq!(copy.schedule().node_count(), 2);

        let mut block = [0.0f32; 64];
        scheduler.render(&mut block, 1);
        assert!(block.iter().any(|s| *s != 0.0));
    }
}
