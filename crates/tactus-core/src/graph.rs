//! Edit-side graph topology: nodes, ports and weighted connections.
//!
//! [`Graph`] is only touched off the real-time thread. Every successful
//! structural edit bumps [`generation`](Graph::generation); nothing reaches the
//! audio path until the graph is compiled into a
//! [`Schedule`](crate::Schedule) and published.
//!
//! Flags that do not change topology (bypass, enable, control values) are
//! atomics on the shared node and apply at the next block without a recompile.
//!
//! Edits are validated before anything is mutated, so a rejected edit leaves
//! the graph exactly as it was.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::PortBuffer;
use crate::compiler;
use crate::error::StructuralError;
use crate::id::{Arena, ConnectionId, NodeId, PortId};
use crate::node::{FeedbackLine, NodeBody, NodeCell, NodeKind, Processor};
use crate::port::{ControlRange, ControlValue, Port, PortDirection, PortKind, PortSpec};
use crate::recording::CaptureTap;
use crate::schedule::{Schedule, SharedDelay};

/// Default event capacity per event port.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

type Result<T> = core::result::Result<T, StructuralError>;

pub(crate) struct NodeEntry {
    pub(crate) cell: Arc<NodeCell>,
    pub(crate) inputs: Vec<PortId>,
    pub(crate) outputs: Vec<PortId>,
    pub(crate) incoming: Vec<ConnectionId>,
    pub(crate) outgoing: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub(crate) struct Connection {
    pub(crate) source: PortId,
    pub(crate) dest: PortId,
    pub(crate) from: NodeId,
    pub(crate) to: NodeId,
    pub(crate) multiplier: f32,
    pub(crate) enabled: bool,
    /// Creation order. Orders event merges and summing.
    pub(crate) seq: u64,
}

/// Public view of a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    /// Owning node.
    pub node: NodeId,
    /// Display name.
    pub name: String,
    /// Data kind.
    pub kind: PortKind,
    /// Flow direction.
    pub direction: PortDirection,
    /// Position among the node's ports of the same direction.
    pub slot: usize,
    /// Range for control inputs.
    pub range: Option<ControlRange>,
}

/// Public view of a connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionInfo {
    /// Output port.
    pub source: PortId,
    /// Input port.
    pub dest: PortId,
    /// Node owning the output port.
    pub from: NodeId,
    /// Node owning the input port.
    pub to: NodeId,
    /// Gain applied when summing signals. Ignored for events.
    pub multiplier: f32,
    /// Disabled connections keep their place in the topology but carry nothing.
    pub enabled: bool,
}

/// Structural state captured by [`Graph::checkpoint`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    generation: u64,
    removed: usize,
}

/// Node, port and connection topology.
pub struct Graph {
    pub(crate) nodes: Arena<NodeEntry>,
    pub(crate) ports: Arena<Port>,
    pub(crate) connections: Arena<Connection>,
    next_node_seq: u64,
    next_connection_seq: u64,
    generation: u64,
    sample_rate: f64,
    max_block: usize,
    event_capacity: usize,
    removed: Vec<Arc<NodeCell>>,
    /// Compensation lines from the last compile with their delay in samples.
    pub(crate) compensation: Mutex<HashMap<ConnectionId, (u32, SharedDelay)>>,
}

impl Graph {
    /// Creates an empty graph.
    ///
    /// # Errors
    ///
    /// [`StructuralError::InvalidParameter`] for a non-positive sample rate or
    /// a zero block size.
    pub fn new(sample_rate: f64, max_block: usize) -> Result<Self> {
        validate_sample_rate(sample_rate)?;
        validate_block(max_block)?;
        Ok(Self {
            nodes: Arena::new(),
            ports: Arena::new(),
            connections: Arena::new(),
            next_node_seq: 0,
            next_connection_seq: 0,
            generation: 0,
            sample_rate,
            max_block,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            removed: Vec::new(),
            compensation: Mutex::new(HashMap::new()),
        })
    }

    /// Sets the capacity of event buffers created from now on.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Structural generation. Increments on every successful structural edit.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Engine sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Maximum frames per block.
    pub fn max_block(&self) -> usize {
        self.max_block
    }

    /// Capacity of each event buffer.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // --- Nodes ---

    /// Adds a node running `processor`.
    pub fn add_processor(&mut self, name: impl Into<String>, mut processor: Box<dyn Processor>) -> NodeId {
        let specs = processor.ports();
        processor.prepare(self.sample_rate, self.max_block);
        let latency = processor.latency_samples();
        self.create_node(
            name.into(),
            NodeKind::Processor,
            NodeBody::Processor(processor),
            &specs,
            latency,
        )
    }

    /// Adds a backend input node with `channels` audio outputs and one event output.
    pub fn add_input(&mut self, name: impl Into<String>, channels: u16) -> NodeId {
        let mut specs: Vec<PortSpec> = (0..channels)
            .map(|c| PortSpec::audio_out(format!("in {}", c + 1)))
            .collect();
        specs.push(PortSpec::event_out("events"));
        self.create_node(
            name.into(),
            NodeKind::Input { channels },
            NodeBody::Input,
            &specs,
            0,
        )
    }

    /// Adds a backend output node with `channels` audio inputs.
    pub fn add_output(&mut self, name: impl Into<String>, channels: u16) -> NodeId {
        let specs: Vec<PortSpec> = (0..channels)
            .map(|c| PortSpec::audio_in(format!("out {}", c + 1)))
            .collect();
        self.create_node(
            name.into(),
            NodeKind::Output { channels },
            NodeBody::Output,
            &specs,
            0,
        )
    }

    /// Adds a feedback node delaying `channels` audio channels by `delay` samples.
    ///
    /// # Errors
    ///
    /// [`StructuralError::InvalidParameter`] if `delay` is shorter than the
    /// maximum block size.
    pub fn add_feedback(&mut self, name: impl Into<String>, channels: u16, delay: u32) -> Result<NodeId> {
        if (delay as usize) < self.max_block {
            return Err(StructuralError::InvalidParameter(format!(
                "feedback delay {delay} is shorter than block size {}",
                self.max_block
            )));
        }
        let mut specs = Vec::with_capacity(usize::from(channels) * 2);
        for c in 0..channels {
            specs.push(PortSpec::audio_in(format!("in {}", c + 1)));
            specs.push(PortSpec::audio_out(format!("out {}", c + 1)));
        }
        Ok(self.create_node(
            name.into(),
            NodeKind::Feedback { channels, delay },
            NodeBody::Feedback(FeedbackLine::new(usize::from(channels), delay as usize)),
            &specs,
            0,
        ))
    }

    fn create_node(
        &mut self,
        name: String,
        kind: NodeKind,
        body: NodeBody,
        specs: &[PortSpec],
        latency: u32,
    ) -> NodeId {
        let seq = self.next_node_seq;
        self.next_node_seq += 1;
        let raw = self.nodes.insert_with(move |raw| {
            let cell = NodeCell::new(NodeId(raw), seq, name, kind, body, latency);
            NodeEntry {
                cell: Arc::new(cell),
                inputs: Vec::new(),
                outputs: Vec::new(),
                incoming: Vec::new(),
                outgoing: Vec::new(),
            }
        });
        let id = NodeId(raw);
        for spec in specs {
            let added = self.add_port(id, spec);
            debug_assert!(added.is_ok(), "port on fresh node {id} rejected");
        }
        self.generation += 1;
        if let Some(entry) = self.nodes.get(raw) {
            tracing::debug!(
                "graph_add: {:?} node {id} '{}' ({} in, {} out)",
                kind,
                entry.cell.name(),
                entry.inputs.len(),
                entry.outputs.len()
            );
        }
        id
    }

    /// Removes a node and every connection touching it.
    ///
    /// The node's state stays alive until the engine confirms no published
    /// schedule still references it.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let entry = self
            .nodes
            .get(id.0)
            .ok_or(StructuralError::UnknownId(id.into()))?;
        let touching: Vec<ConnectionId> = entry
            .incoming
            .iter()
            .chain(&entry.outgoing)
            .copied()
            .collect();
        for connection in touching {
            self.unlink(connection);
        }
        if let Some(entry) = self.nodes.remove(id.0) {
            for port in entry.inputs.iter().chain(&entry.outputs) {
                self.ports.remove(port.0);
            }
            self.removed.push(entry.cell);
        }
        self.generation += 1;
        tracing::debug!("graph_remove: node {id}");
        Ok(())
    }

    /// Adds a port to an existing node.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn create_port(&mut self, node: NodeId, kind: PortKind, direction: PortDirection) -> Result<PortId> {
        let name = format!("{kind} {}", self.ports_of(node)?.len() + 1);
        self.create_port_with(node, PortSpec::new(name, kind, direction))
    }

    /// Adds a port described by `spec` to an existing node.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn create_port_with(&mut self, node: NodeId, spec: PortSpec) -> Result<PortId> {
        let port = self.add_port(node, &spec)?;
        self.generation += 1;
        tracing::debug!("graph_port: {} {} {port} on {node}", spec.kind, dir_label(spec.direction));
        Ok(port)
    }

    fn add_port(&mut self, node: NodeId, spec: &PortSpec) -> Result<PortId> {
        let entry = self
            .nodes
            .get_mut(node.0)
            .ok_or(StructuralError::UnknownId(node.into()))?;
        let slot = match spec.direction {
            PortDirection::Input => entry.inputs.len(),
            PortDirection::Output => entry.outputs.len(),
        };
        let control = match (spec.kind, spec.direction) {
            (PortKind::Control, PortDirection::Input) => {
                Some(Arc::new(ControlValue::new(spec.range.unwrap_or_default())))
            }
            _ => None,
        };
        let buffer = PortBuffer::for_kind(spec.kind, self.max_block, self.event_capacity);
        {
            let mut runtime = entry.cell.runtime.write();
            match spec.direction {
                PortDirection::Input => runtime.inputs.push(buffer),
                PortDirection::Output => runtime.outputs.push(buffer),
            }
        }
        let port = PortId(self.ports.insert(Port {
            node,
            name: spec.name.clone(),
            kind: spec.kind,
            direction: spec.direction,
            slot,
            control,
        }));
        match spec.direction {
            PortDirection::Input => entry.inputs.push(port),
            PortDirection::Output => entry.outputs.push(port),
        }
        Ok(port)
    }

    /// All ports of a node, inputs first.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn ports_of(&self, node: NodeId) -> Result<Vec<PortId>> {
        let entry = self.entry(node)?;
        Ok(entry.inputs.iter().chain(&entry.outputs).copied().collect())
    }

    /// Input ports of a node in slot order.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn inputs_of(&self, node: NodeId) -> Result<&[PortId]> {
        Ok(&self.entry(node)?.inputs)
    }

    /// Output ports of a node in slot order.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn outputs_of(&self, node: NodeId) -> Result<&[PortId]> {
        Ok(&self.entry(node)?.outputs)
    }

    /// Input port `slot` of a node.
    pub fn input(&self, node: NodeId, slot: usize) -> Option<PortId> {
        self.nodes.get(node.0)?.inputs.get(slot).copied()
    }

    /// Output port `slot` of a node.
    pub fn output(&self, node: NodeId, slot: usize) -> Option<PortId> {
        self.nodes.get(node.0)?.outputs.get(slot).copied()
    }

    /// Describes a port.
    pub fn port_info(&self, port: PortId) -> Option<PortInfo> {
        self.ports.get(port.0).map(|p| PortInfo {
            node: p.node,
            name: p.name.clone(),
            kind: p.kind,
            direction: p.direction,
            slot: p.slot,
            range: p.control.as_ref().map(|c| c.range()),
        })
    }

    /// Live node handles in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<(u64, NodeId)> = self
            .nodes
            .iter()
            .map(|(raw, entry)| (entry.cell.seq(), NodeId(raw)))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Live connection handles in creation order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<(u64, ConnectionId)> = self
            .connections
            .iter()
            .map(|(raw, c)| (c.seq, ConnectionId(raw)))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Display name of a node.
    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(|e| e.cell.name())
    }

    /// Structural kind of a node.
    pub fn node_kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(node.0).map(|e| e.cell.kind())
    }

    /// Shared state of a node, for reading flags and failure counters.
    pub fn node(&self, node: NodeId) -> Option<&Arc<NodeCell>> {
        self.nodes.get(node.0).map(|e| &e.cell)
    }

    /// True if the handle names a live node.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains(node.0)
    }

    /// Runs `f` on the processor of a node, waiting for the current block.
    ///
    /// Returns `None` for structural nodes.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn with_processor<R>(&self, node: NodeId, f: impl FnOnce(&mut dyn Processor) -> R) -> Result<Option<R>> {
        let entry = self.entry(node)?;
        let mut runtime = entry.cell.runtime.write();
        let state = runtime.state.get_mut();
        Ok(match &mut state.body {
            NodeBody::Processor(p) => Some(f(p.as_mut())),
            _ => None,
        })
    }

    // --- Connections ---

    /// Connects an output port to an input port.
    ///
    /// # Errors
    ///
    /// - [`StructuralError::UnknownId`] if either port does not exist.
    /// - [`StructuralError::InvalidDirection`] unless `source` is an output and
    ///   `dest` an input.
    /// - [`StructuralError::IncompatibleKind`] if the port kinds differ.
    /// - [`StructuralError::CycleDetected`] if the connection closes a cycle
    ///   not broken by a feedback node.
    /// - [`StructuralError::InvalidParameter`] for a non-finite multiplier or a
    ///   duplicate connection.
    pub fn connect(&mut self, source: PortId, dest: PortId, multiplier: f32) -> Result<ConnectionId> {
        let src = self
            .ports
            .get(source.0)
            .ok_or(StructuralError::UnknownId(source.into()))?;
        let dst = self
            .ports
            .get(dest.0)
            .ok_or(StructuralError::UnknownId(dest.into()))?;
        if src.direction != PortDirection::Output {
            return Err(StructuralError::InvalidDirection(source));
        }
        if dst.direction != PortDirection::Input {
            return Err(StructuralError::InvalidDirection(dest));
        }
        if src.kind != dst.kind {
            return Err(StructuralError::IncompatibleKind {
                output: source,
                output_kind: src.kind,
                input: dest,
                input_kind: dst.kind,
            });
        }
        validate_multiplier(multiplier)?;
        let (from, to) = (src.node, dst.node);
        if self
            .connections
            .iter()
            .any(|(_, c)| c.source == source && c.dest == dest)
        {
            return Err(StructuralError::InvalidParameter(format!(
                "{source} is already connected to {dest}"
            )));
        }
        compiler::check_acyclic(self, from, to)?;

        let seq = self.next_connection_seq;
        self.next_connection_seq += 1;
        let id = ConnectionId(self.connections.insert(Connection {
            source,
            dest,
            from,
            to,
            multiplier,
            enabled: true,
            seq,
        }));
        if let Some(entry) = self.nodes.get_mut(from.0) {
            entry.outgoing.push(id);
        }
        if let Some(entry) = self.nodes.get_mut(to.0) {
            entry.incoming.push(id);
        }
        self.generation += 1;
        tracing::debug!("graph_connect: {from} → {to} ({source} → {dest}, x{multiplier})");
        Ok(id)
    }

    /// Removes a connection.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the connection does not exist. The
    /// graph is left unchanged.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        if !self.connections.contains(id.0) {
            return Err(StructuralError::UnknownId(id.into()));
        }
        self.unlink(id);
        self.generation += 1;
        tracing::debug!("graph_disconnect: {id}");
        Ok(())
    }

    fn unlink(&mut self, id: ConnectionId) {
        if let Some(c) = self.connections.remove(id.0) {
            if let Some(entry) = self.nodes.get_mut(c.from.0) {
                entry.outgoing.retain(|&e| e != id);
            }
            if let Some(entry) = self.nodes.get_mut(c.to.0) {
                entry.incoming.retain(|&e| e != id);
            }
        }
    }

    /// Changes the gain of a connection.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] for an unknown connection,
    /// [`StructuralError::InvalidParameter`] for a non-finite multiplier.
    pub fn set_multiplier(&mut self, id: ConnectionId, multiplier: f32) -> Result<()> {
        validate_multiplier(multiplier)?;
        let c = self
            .connections
            .get_mut(id.0)
            .ok_or(StructuralError::UnknownId(id.into()))?;
        c.multiplier = multiplier;
        self.generation += 1;
        tracing::debug!("graph_multiplier: {id} x{multiplier}");
        Ok(())
    }

    /// Enables or disables a connection without removing it.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] for an unknown connection.
    pub fn set_connection_enabled(&mut self, id: ConnectionId, enabled: bool) -> Result<()> {
        let c = self
            .connections
            .get_mut(id.0)
            .ok_or(StructuralError::UnknownId(id.into()))?;
        c.enabled = enabled;
        self.generation += 1;
        tracing::debug!("graph_connection_enabled: {id} {enabled}");
        Ok(())
    }

    /// Describes a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id.0).map(|c| ConnectionInfo {
            source: c.source,
            dest: c.dest,
            from: c.from,
            to: c.to,
            multiplier: c.multiplier,
            enabled: c.enabled,
        })
    }

    // --- Flags applied without a recompile ---

    /// Bypasses or un-bypasses a node.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn set_bypass(&self, node: NodeId, bypassed: bool) -> Result<()> {
        self.entry(node)?.cell.shared().set_bypassed(bypassed);
        Ok(())
    }

    /// Enables or silences a node.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist.
    pub fn set_enabled(&self, node: NodeId, enabled: bool) -> Result<()> {
        self.entry(node)?.cell.shared().set_enabled(enabled);
        Ok(())
    }

    /// Sets the value of an unconnected control input.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] for an unknown port,
    /// [`StructuralError::InvalidParameter`] if it is not a control input.
    pub fn set_control(&self, port: PortId, value: f32) -> Result<()> {
        let p = self
            .ports
            .get(port.0)
            .ok_or(StructuralError::UnknownId(port.into()))?;
        let control = p.control.as_ref().ok_or_else(|| {
            StructuralError::InvalidParameter(format!("{port} is not a control input"))
        })?;
        control.set(value);
        Ok(())
    }

    /// Current value of a control input.
    pub fn control(&self, port: PortId) -> Option<f32> {
        self.ports.get(port.0)?.control.as_ref().map(|c| c.get())
    }

    // --- Engine settings ---

    /// Reallocates every port buffer for a new maximum block size and prepares
    /// all processors again.
    ///
    /// # Errors
    ///
    /// [`StructuralError::InvalidParameter`] for a zero size or one that
    /// exceeds a feedback node's delay.
    pub fn set_block_size(&mut self, max_block: usize) -> Result<()> {
        validate_block(max_block)?;
        for (_, entry) in self.nodes.iter() {
            if let NodeKind::Feedback { delay, .. } = entry.cell.kind()
                && (delay as usize) < max_block
            {
                return Err(StructuralError::InvalidParameter(format!(
                    "block size {max_block} exceeds feedback delay {delay} of {}",
                    entry.cell.id()
                )));
            }
        }
        self.max_block = max_block;
        self.prepare_all(true);
        self.generation += 1;
        tracing::debug!("graph_block_size: {max_block}");
        Ok(())
    }

    /// Changes the sample rate and prepares all processors again.
    ///
    /// # Errors
    ///
    /// [`StructuralError::InvalidParameter`] for a non-positive rate.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        validate_sample_rate(sample_rate)?;
        self.sample_rate = sample_rate;
        self.prepare_all(false);
        self.generation += 1;
        tracing::debug!("graph_sample_rate: {sample_rate}");
        Ok(())
    }

    fn prepare_all(&self, resize: bool) {
        for (_, entry) in self.nodes.iter() {
            let mut runtime = entry.cell.runtime.write();
            let runtime = &mut *runtime;
            if resize {
                for buffer in runtime.inputs.iter_mut().chain(runtime.outputs.iter_mut()) {
                    buffer.resize(self.max_block);
                }
            }
            if let NodeBody::Processor(p) = &mut runtime.state.get_mut().body {
                p.prepare(self.sample_rate, self.max_block);
                entry.cell.shared().set_latency(p.latency_samples());
            }
        }
    }

    /// Clears processor state and feedback history on every node.
    pub fn reset_nodes(&self) {
        for (_, entry) in self.nodes.iter() {
            let mut runtime = entry.cell.runtime.write();
            match &mut runtime.state.get_mut().body {
                NodeBody::Processor(p) => p.reset(),
                NodeBody::Feedback(line) => line.clear(),
                NodeBody::Input | NodeBody::Output => {}
            }
        }
    }

    /// Compiles the current topology.
    ///
    /// # Errors
    ///
    /// [`StructuralError::CycleDetected`] if the topology contains a cycle.
    pub fn compile(&self, max_parallelism: usize) -> Result<Schedule> {
        compiler::compile(self, max_parallelism)
    }

    // --- Crate internals ---

    pub(crate) fn entry(&self, node: NodeId) -> Result<&NodeEntry> {
        self.nodes
            .get(node.0)
            .ok_or(StructuralError::UnknownId(node.into()))
    }

    pub(crate) fn port(&self, port: PortId) -> Option<&Port> {
        self.ports.get(port.0)
    }

    /// Nodes removed since the last call, awaiting quarantine.
    pub(crate) fn take_removed(&mut self) -> Vec<Arc<NodeCell>> {
        core::mem::take(&mut self.removed)
    }

    /// Marks the current structure so a batch of additions can be undone.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            generation: self.generation,
            removed: self.removed.len(),
        }
    }

    /// Removes `added` (and their connections) and restores the generation
    /// recorded in `checkpoint`.
    ///
    /// The nodes were never published, so they skip quarantine.
    pub(crate) fn roll_back(&mut self, checkpoint: Checkpoint, added: &[NodeId]) {
        for &id in added.iter().rev() {
            let removed = self.remove_node(id);
            debug_assert!(removed.is_ok(), "rolled back node {id} is missing");
        }
        self.removed.truncate(checkpoint.removed);
        self.generation = checkpoint.generation;
        tracing::debug!("graph_rollback: {} nodes", added.len());
    }

    /// Installs or removes a capture tap, returning the previous one.
    pub(crate) fn set_capture(&self, node: NodeId, tap: Option<CaptureTap>) -> Result<Option<CaptureTap>> {
        let entry = self.entry(node)?;
        let armed = tap.is_some();
        let previous = {
            let mut runtime = entry.cell.runtime.write();
            core::mem::replace(&mut runtime.state.get_mut().capture, tap)
        };
        entry.cell.shared().set_armed(armed);
        Ok(previous)
    }

    /// Signal and event ports a capture tap records, with the signal channel count.
    ///
    /// Input nodes are captured at their outputs, every other node at its inputs.
    pub(crate) fn capture_ports(&self, node: NodeId) -> Result<(bool, Vec<usize>, Vec<usize>)> {
        let entry = self.entry(node)?;
        let from_outputs = matches!(entry.cell.kind(), NodeKind::Input { .. });
        let ports = if from_outputs {
            &entry.outputs
        } else {
            &entry.inputs
        };
        let mut audio = Vec::new();
        let mut events = Vec::new();
        for port in ports {
            if let Some(p) = self.ports.get(port.0) {
                match p.kind {
                    PortKind::Audio => audio.push(p.slot),
                    PortKind::Event => events.push(p.slot),
                    PortKind::Control | PortKind::Cv => {}
                }
            }
        }
        Ok((from_outputs, audio, events))
    }

    /// Nodes reachable from `start` through dependency edges.
    ///
    /// Edges into feedback nodes are not dependencies and are not followed.
    pub(crate) fn can_reach(&self, start: NodeId, target: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            let Some(entry) = self.nodes.get(current.0) else {
                continue;
            };
            for id in &entry.outgoing {
                if let Some(c) = self.connections.get(id.0)
                    && !self.is_feedback(c.to)
                {
                    stack.push(c.to);
                }
            }
        }
        false
    }

    pub(crate) fn is_feedback(&self, node: NodeId) -> bool {
        matches!(self.node_kind(node), Some(NodeKind::Feedback { .. }))
    }
}

impl core::fmt::Debug for Graph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("ports", &self.ports.len())
            .field("connections", &self.connections.len())
            .field("generation", &self.generation)
            .field("sample_rate", &self.sample_rate)
            .field("max_block", &self.max_block)
            .finish()
    }
}

fn dir_label(direction: PortDirection) -> &'static str {
    match direction {
        PortDirection::Input => "input",
        PortDirection::Output => "output",
    }
}

fn validate_block(max_block: usize) -> Result<()> {
    if max_block == 0 {
        return Err(StructuralError::InvalidParameter("block size must be non-zero".into()));
    }
    Ok(())
}

fn validate_sample_rate(sample_rate: f64) -> Result<()> {
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(StructuralError::InvalidParameter(format!(
            "sample rate {sample_rate} must be positive"
        )));
    }
    Ok(())
}

fn validate_multiplier(multiplier: f32) -> Result<()> {
    if !multiplier.is_finite() {
        return Err(StructuralError::InvalidParameter(format!(
            "multiplier {multiplier} must be finite"
        )));
    }
    Ok(())
}
