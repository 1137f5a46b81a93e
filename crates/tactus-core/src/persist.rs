//! Serializable graph topology.
//!
//! Only topology and the tempo map are saved; a schedule is always recompiled
//! after loading. Processors are rebuilt through a [`NodeRegistry`] from their
//! [`type_name`](crate::Processor::type_name) and
//! [`parameters`](crate::Processor::parameters).
//!
//! Nodes and ports are referenced by position, not by handle, so a description
//! loads into any graph.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, StructuralError};
use crate::graph::Graph;
use crate::id::NodeId;
use crate::node::{NodeKind, Processor};
use crate::nodes::{Bus, Fader, LatencyDelay, Lfo, Metronome, SineSource};
use crate::port::{ControlRange, PortDirection, PortKind, PortSpec};
use crate::tempo::TempoMap;

/// Named processor parameters.
pub type Parameters = BTreeMap<String, f32>;

/// Builds a processor from saved parameters.
pub type ProcessorFactory = Box<dyn Fn(&Parameters) -> Box<dyn Processor> + Send + Sync>;

/// Saved form of one port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescription {
    /// Display name.
    pub name: String,
    /// Data kind.
    pub kind: PortKind,
    /// Range of a control input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ControlRange>,
    /// Value of a control input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
}

/// Structural kind of a saved node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    /// Backend input.
    Input {
        /// Audio channels.
        channels: u16,
    },
    /// Backend output.
    Output {
        /// Audio channels.
        channels: u16,
    },
    /// Feedback delay.
    Feedback {
        /// Audio channels.
        channels: u16,
        /// Delay in samples.
        delay: u32,
    },
    /// Registered processor.
    Processor {
        /// Registry name.
        processor: String,
        /// Saved parameters.
        #[serde(default)]
        parameters: Parameters,
    },
}

/// Saved form of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Display name.
    pub name: String,
    /// Kind and construction data.
    #[serde(flatten)]
    pub spec: NodeSpec,
    /// Input ports in slot order.
    #[serde(default)]
    pub inputs: Vec<PortDescription>,
    /// Output ports in slot order.
    #[serde(default)]
    pub outputs: Vec<PortDescription>,
    /// Enabled flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bypass flag.
    #[serde(default)]
    pub bypassed: bool,
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> f32 {
    1.0
}

/// Saved form of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    /// Index of the source node.
    pub from: usize,
    /// Output slot on the source node.
    pub output: usize,
    /// Index of the destination node.
    pub to: usize,
    /// Input slot on the destination node.
    pub input: usize,
    /// Gain applied to the signal.
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,
    /// Enabled flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Saved topology plus tempo map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Nodes in creation order.
    pub nodes: Vec<NodeDescription>,
    /// Connections in creation order.
    #[serde(default)]
    pub connections: Vec<ConnectionDescription>,
    /// Tempo and meter.
    #[serde(default)]
    pub tempo: TempoMap,
}

/// Maps processor type names to factories.
pub struct NodeRegistry {
    factories: HashMap<String, ProcessorFactory>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn param(params: &Parameters, key: &str, default: f32) -> f32 {
    params.get(key).copied().unwrap_or(default)
}

fn channels(params: &Parameters) -> u16 {
    param(params, "channels", 2.0).clamp(1.0, f32::from(u16::MAX)) as u16
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in processor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("bus", |p| Box::new(Bus::new(channels(p))));
        registry.register("fader", |p| Box::new(Fader::new(channels(p))));
        registry.register("latency_delay", |p| {
            Box::new(LatencyDelay::new(channels(p), param(p, "samples", 0.0).max(0.0) as u32))
        });
        registry.register("sine", |p| {
            Box::new(SineSource::new(
                f64::from(param(p, "frequency", 440.0)),
                param(p, "amplitude", 0.5),
            ))
        });
        registry.register("lfo", |p| {
            Box::new(Lfo::new(
                f64::from(param(p, "rate", 1.0)),
                param(p, "depth", 1.0),
                param(p, "offset", 0.0),
            ))
        });
        registry.register("metronome", |p| Box::new(Metronome::new(param(p, "level", 0.5))));
        registry
    }

    /// Registers or replaces a factory.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Parameters) -> Box<dyn Processor> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Builds a processor.
    ///
    /// # Errors
    ///
    /// [`PersistError::UnknownProcessor`] if nothing is registered under `name`.
    pub fn create(&self, name: &str, params: &Parameters) -> Result<Box<dyn Processor>, PersistError> {
        self.factories
            .get(name)
            .map(|factory| factory(params))
            .ok_or_else(|| PersistError::UnknownProcessor(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Graph {
    /// Saves the topology. `tempo` is stored alongside.
    pub fn describe(&self, tempo: &TempoMap) -> GraphDescription {
        let ids = self.node_ids();
        let index: HashMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let nodes = ids
            .iter()
            .filter_map(|&id| {
                let cell = self.node(id)?;
                let spec = match cell.kind() {
                    NodeKind::Input { channels } => NodeSpec::Input { channels },
                    NodeKind::Output { channels } => NodeSpec::Output { channels },
                    NodeKind::Feedback { channels, delay } => NodeSpec::Feedback { channels, delay },
                    NodeKind::Processor => {
                        let (processor, parameters) = self
                            .with_processor(id, |p| (p.type_name().to_string(), p.parameters()))
                            .ok()
                            .flatten()?;
                        NodeSpec::Processor {
                            processor,
                            parameters: parameters.into_iter().collect(),
                        }
                    }
                };
                let describe_ports = |ports: &[crate::id::PortId]| -> Vec<PortDescription> {
                    ports
                        .iter()
                        .filter_map(|&port| {
                            let info = self.port_info(port)?;
                            Some(PortDescription {
                                name: info.name,
                                kind: info.kind,
                                range: info.range,
                                value: self.control(port),
                            })
                        })
                        .collect()
                };
                Some(NodeDescription {
                    name: cell.name().to_string(),
                    spec,
                    inputs: describe_ports(self.inputs_of(id).ok()?),
                    outputs: describe_ports(self.outputs_of(id).ok()?),
                    enabled: cell.shared().is_enabled(),
                    bypassed: cell.shared().is_bypassed(),
                })
            })
            .collect();

        let connections = self
            .connection_ids()
            .into_iter()
            .filter_map(|id| {
                let c = self.connection(id)?;
                Some(ConnectionDescription {
                    from: *index.get(&c.from)?,
                    output: self.port_info(c.source)?.slot,
                    to: *index.get(&c.to)?,
                    input: self.port_info(c.dest)?.slot,
                    multiplier: c.multiplier,
                    enabled: c.enabled,
                })
            })
            .collect();

        GraphDescription {
            nodes,
            connections,
            tempo: tempo.clone(),
        }
    }

    /// Builds a new graph from a description.
    ///
    /// # Errors
    ///
    /// See [`Graph::load_description`].
    pub fn from_description(
        description: &GraphDescription,
        registry: &NodeRegistry,
        sample_rate: f64,
        max_block: usize,
    ) -> Result<Self, PersistError> {
        let mut graph = Self::new(sample_rate, max_block)?;
        graph.load_description(description, registry)?;
        Ok(graph)
    }

    /// Adds every node and connection of `description` to this graph and
    /// returns the new node handles in description order.
    ///
    /// Ports listed beyond a node's initial layout are created. Control values
    /// and flags are restored. On failure every node added so far is removed
    /// again and the graph is left as it was.
    ///
    /// # Errors
    ///
    /// - [`PersistError::UnknownProcessor`] for an unregistered processor.
    /// - [`PersistError::DanglingConnection`] for a connection naming a
    ///   missing node or slot.
    /// - [`PersistError::Structural`] if an edit is rejected, for example a
    ///   cycle without a feedback node.
    pub fn load_description(
        &mut self,
        description: &GraphDescription,
        registry: &NodeRegistry,
    ) -> Result<Vec<NodeId>, PersistError> {
        let checkpoint = self.checkpoint();
        let mut ids = Vec::with_capacity(description.nodes.len());
        if let Err(e) = self.load_into(description, registry, &mut ids) {
            self.roll_back(checkpoint, &ids);
            tracing::debug!("graph_load: rejected ({e})");
            return Err(e);
        }
        tracing::debug!(
            "graph_load: {} nodes, {} connections",
            ids.len(),
            description.connections.len()
        );
        Ok(ids)
    }

    /// Pushes each node onto `ids` as soon as it exists.
    fn load_into(
        &mut self,
        description: &GraphDescription,
        registry: &NodeRegistry,
        ids: &mut Vec<NodeId>,
    ) -> Result<(), PersistError> {
        for node in &description.nodes {
            let id = match &node.spec {
                NodeSpec::Input { channels } => self.add_input(node.name.clone(), *channels),
                NodeSpec::Output { channels } => self.add_output(node.name.clone(), *channels),
                NodeSpec::Feedback { channels, delay } => {
                    self.add_feedback(node.name.clone(), *channels, *delay)?
                }
                NodeSpec::Processor {
                    processor,
                    parameters,
                } => {
                    let processor = registry.create(processor, parameters)?;
                    self.add_processor(node.name.clone(), processor)
                }
            };
            ids.push(id);
            self.restore_ports(id, &node.inputs, PortDirection::Input)?;
            self.restore_ports(id, &node.outputs, PortDirection::Output)?;
            self.set_enabled(id, node.enabled)?;
            self.set_bypass(id, node.bypassed)?;
        }

        for (index, c) in description.connections.iter().enumerate() {
            let dangling = || PersistError::DanglingConnection { index };
            let from = *ids.get(c.from).ok_or_else(dangling)?;
            let to = *ids.get(c.to).ok_or_else(dangling)?;
            let source = self.output(from, c.output).ok_or_else(dangling)?;
            let dest = self.input(to, c.input).ok_or_else(dangling)?;
            let id = self.connect(source, dest, c.multiplier)?;
            if !c.enabled {
                self.set_connection_enabled(id, false)?;
            }
        }
        Ok(())
    }

    fn restore_ports(
        &mut self,
        node: NodeId,
        ports: &[PortDescription],
        direction: PortDirection,
    ) -> Result<(), StructuralError> {
        let existing = match direction {
            PortDirection::Input => self.inputs_of(node)?.len(),
            PortDirection::Output => self.outputs_of(node)?.len(),
        };
        for port in ports.iter().skip(existing) {
            let spec = match (port.kind, port.range, direction) {
                (PortKind::Control, Some(range), PortDirection::Input) => {
                    PortSpec::control_in(port.name.clone(), range)
                }
                (kind, _, direction) => PortSpec::new(port.name.clone(), kind, direction),
            };
            self.create_port_with(node, spec)?;
        }
        if direction == PortDirection::Input {
            for (slot, port) in ports.iter().enumerate() {
                if let (Some(value), Some(id)) = (port.value, self.input(node, slot)) {
                    self.set_control(id, value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineOptions};

    fn session() -> (Graph, TempoMap) {
        let mut graph = Graph::new(48000.0, 128).unwrap();
        let tone = graph.add_processor("tone", Box::new(SineSource::new(220.0, 0.25)));
        let fader = graph.add_processor("fader", Box::new(Fader::new(1)));
        let fb = graph.add_feedback("echo", 1, 4800).unwrap();
        let out = graph.add_output("main", 1);
        let link = |g: &mut Graph, a: NodeId, o: usize, b: NodeId, i: usize, m: f32| {
            let src = g.output(a, o).unwrap();
            let dst = g.input(b, i).unwrap();
            g.connect(src, dst, m).unwrap()
        };
        link(&mut graph, tone, 0, fader, 0, 1.0);
        link(&mut graph, fader, 0, out, 0, 1.0);
        link(&mut graph, fader, 0, fb, 0, 0.5);
        let back = link(&mut graph, fb, 0, fader, 0, 0.3);
        graph.set_connection_enabled(back, false).unwrap();
        let gain = graph.input(fader, 1).unwrap();
        graph.set_control(gain, -6.0).unwrap();
        graph.set_bypass(tone, true).unwrap();

        let mut tempo = TempoMap::new(48000.0, 100.0);
        tempo.set_time_signature(0, 3, 4).unwrap();
        (graph, tempo)
    }

    #[test]
    fn json_round_trip_preserves_topology() {
        let (graph, tempo) = session();
        let description = graph.describe(&tempo);
        let json = serde_json::to_string_pretty(&description).unwrap();
        let parsed: GraphDescription = serde_json::from_str(&json).unwrap();

        let restored = Graph::from_description(&parsed, &NodeRegistry::with_builtins(), 48000.0, 128).unwrap();
        assert_eq!(restored.node_count(), graph.node_count());
        assert_eq!(restored.connection_count(), graph.connection_count());

        let again = restored.describe(&parsed.tempo);
        assert_eq!(again.nodes, description.nodes);
        assert_eq!(again.connections, description.connections);
        assert_eq!(parsed.tempo.bpm_at_sample(0), 100.0);

        let order: Vec<String> = restored
            .compile(1)
            .unwrap()
            .order()
            .iter()
            .map(|&id| restored.node_name(id).unwrap().to_string())
            .collect();
        assert_eq!(order, ["tone", "echo", "fader", "main"]);
    }

    #[test]
    fn unknown_processor_rejected() {
        let json = r#"{ "nodes": [ { "name": "x", "type": "processor", "processor": "granular" } ] }"#;
        let description: GraphDescription = serde_json::from_str(json).unwrap();
        let err = Graph::from_description(&description, &NodeRegistry::new(), 48000.0, 64).unwrap_err();
        assert!(matches!(err, PersistError::UnknownProcessor(name) if name == "granular"));
    }

    #[test]
    fn failed_load_leaves_engine_untouched() {
        let (mut engine, _scheduler) = Engine::new(EngineOptions {
            max_block: 64,
            ..EngineOptions::default()
        })
        .unwrap();
        engine.add_output("main", 1).unwrap();
        let generation = engine.schedule().generation();

        let json = r#"{
            "nodes": [
                { "name": "tone", "type": "processor", "processor": "sine" },
                { "name": "grain", "type": "processor", "processor": "granular" }
            ],
            "connections": [ { "from": 0, "output": 0, "to": 1, "input": 0 } ]
        }"#;
        let description: GraphDescription = serde_json::from_str(json).unwrap();
        let err = engine
            .load_description(&description, &NodeRegistry::with_builtins())
            .unwrap_err();

        assert!(matches!(err, PersistError::UnknownProcessor(name) if name == "granular"));
        assert_eq!(engine.graph().node_count(), 1);
        assert_eq!(engine.graph().connection_count(), 0);
        assert_eq!(engine.schedule().generation(), generation);
        assert_eq!(engine.schedule().node_count(), 1);
        assert_eq!(engine.quarantined(), 0);
    }

    #[test]
    fn dangling_connection_rolls_back_added_nodes() {
        let mut graph = Graph::new(48000.0, 64).unwrap();
        let generation = graph.generation();
        let json = r#"{
            "nodes": [
                { "name": "tone", "type": "processor", "processor": "sine" },
                { "name": "out", "type": "output", "channels": 1 }
            ],
            "connections": [
                { "from": 0, "output": 0, "to": 1, "input": 0 },
                { "from": 0, "output": 5, "to": 1, "input": 0 }
            ]
        }"#;
        let description: GraphDescription = serde_json::from_str(json).unwrap();
        let err = graph
            .load_description(&description, &NodeRegistry::with_builtins())
            .unwrap_err();
        assert!(matches!(err, PersistError::DanglingConnection { index: 1 }));
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.connection_count(), 0);
        assert_eq!(graph.generation(), generation);
        assert!(graph.take_removed().is_empty());
    }

    #[test]
    fn dangling_connection_rejected() {
        let json = r#"{
            "nodes": [ { "name": "out", "type": "output", "channels": 1 } ],
            "connections": [ { "from": 3, "output": 0, "to": 0, "input": 0 } ]
        }"#;
        let description: GraphDescription = serde_json::from_str(json).unwrap();
        let err = Graph::from_description(&description, &NodeRegistry::with_builtins(), 48000.0, 64).unwrap_err();
        assert!(matches!(err, PersistError::DanglingConnection { index: 0 }));
    }

    #[test]
    fn builtins_registered() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            ["bus", "fader", "latency_delay", "lfo", "metronome", "sine"]
        );
    }
}
