//! Compiled, immutable execution plan.
//!
//! A [`Schedule`] is produced by the compiler from a [`Graph`](crate::Graph)
//! snapshot and executed by the [`Scheduler`](crate::Scheduler) until a newer
//! one is published. Nodes and compensation delay lines are shared with the
//! graph through `Arc`; execution order and connection feeds belong to the
//! schedule.
//!
//! # Execution phases
//!
//! Per sub-block:
//!
//! 1. Input nodes copy backend input; feedback nodes emit delayed history.
//! 2. Stages run in order. The work units of one stage have no dependencies
//!    on each other and may run on different threads.
//! 3. Feedback nodes absorb their inputs; output nodes mix into the backend
//!    buffer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{EventDelay, SignalDelay};
use crate::id::NodeId;
use crate::node::NodeCell;
use crate::port::ControlValue;

/// Compensation delay on one connection.
#[derive(Debug)]
pub(crate) enum DelayLine {
    Signal(SignalDelay),
    Events(EventDelay),
}

/// A delay line shared by every schedule compiled while its connection keeps
/// the same compensation, so recompiling does not drop the audio in flight.
pub(crate) type SharedDelay = Arc<Mutex<DelayLine>>;

/// One incoming connection of an input port.
#[derive(Debug)]
pub(crate) struct FeedSource {
    /// Index of the source step.
    pub(crate) step: usize,
    /// Output slot on the source node.
    pub(crate) port: usize,
    pub(crate) multiplier: f32,
    /// Only locked by the thread running the destination step.
    pub(crate) delay: Option<SharedDelay>,
}

/// How one input port is filled before its node runs.
#[derive(Debug)]
pub(crate) struct PortFeed {
    /// Input slot on the destination node.
    pub(crate) port: usize,
    /// Connections in creation order.
    pub(crate) sources: Vec<FeedSource>,
    /// Value for unconnected control inputs.
    pub(crate) control: Option<Arc<ControlValue>>,
}

/// One node in execution order.
#[derive(Debug)]
pub(crate) struct Step {
    pub(crate) cell: Arc<NodeCell>,
    pub(crate) feeds: Vec<PortFeed>,
    /// Own latency at compile time.
    pub(crate) latency: u32,
    /// Longest-path latency arriving at the node's inputs.
    pub(crate) input_latency: u32,
}

/// Independent work inside a stage: one or more chains run back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub(crate) steps: Vec<usize>,
    nodes: Vec<NodeId>,
}

impl WorkUnit {
    pub(crate) fn new(steps: Vec<usize>, nodes: Vec<NodeId>) -> Self {
        Self { steps, nodes }
    }

    /// Nodes in the order they run.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}

/// Set of work units that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stage {
    pub(crate) units: Vec<WorkUnit>,
}

impl Stage {
    /// Work units of this stage. At most the configured maximum parallelism.
    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    /// Number of nodes across all units.
    pub fn node_count(&self) -> usize {
        self.units.iter().map(|u| u.nodes.len()).sum()
    }
}

/// Immutable execution plan for one graph generation.
pub struct Schedule {
    pub(crate) generation: u64,
    pub(crate) sample_rate: f64,
    pub(crate) max_block: usize,
    pub(crate) max_parallelism: usize,
    pub(crate) steps: Vec<Step>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) inputs: Vec<usize>,
    pub(crate) outputs: Vec<usize>,
    pub(crate) feedback: Vec<usize>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) chains: Vec<Vec<NodeId>>,
    pub(crate) total_latency: u32,
}

impl Schedule {
    /// A schedule that processes nothing and produces silence.
    pub fn empty(sample_rate: f64, max_block: usize) -> Self {
        Self {
            generation: 0,
            sample_rate,
            max_block: max_block.max(1),
            max_parallelism: 1,
            steps: Vec::new(),
            order: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            feedback: Vec::new(),
            stages: Vec::new(),
            chains: Vec::new(),
            total_latency: 0,
        }
    }

    /// Graph generation this schedule was compiled from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every node in execution order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Processor stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Maximal chains of processors, in order of their first node.
    pub fn chains(&self) -> &[Vec<NodeId>] {
        &self.chains
    }

    /// Latency from input to the slowest output, in samples.
    pub fn total_latency(&self) -> u32 {
        self.total_latency
    }

    /// Longest-path latency arriving at a node's inputs.
    pub fn input_latency(&self, node: NodeId) -> Option<u32> {
        self.step_index(node).map(|i| self.steps[i].input_latency)
    }

    /// Sample rate the nodes were prepared for.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Largest number of frames processed in one pass.
    pub fn max_block(&self) -> usize {
        self.max_block
    }

    /// Largest number of work units in one stage.
    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Number of nodes scheduled.
    pub fn node_count(&self) -> usize {
        self.steps.len()
    }

    /// True if no nodes are scheduled.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True if this schedule runs `node`.
    pub fn contains(&self, node: NodeId) -> bool {
        self.step_index(node).is_some()
    }

    pub(crate) fn step_index(&self, node: NodeId) -> Option<usize> {
        self.order.iter().position(|&id| id == node)
    }

    /// Nodes whose reported latency differs from the compiled one.
    pub(crate) fn latency_stale(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.cell.shared().latency() != s.latency)
    }
}

impl core::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Schedule")
            .field("generation", &self.generation)
            .field("order", &self.order)
            .field("stages", &self.stages.len())
            .field("total_latency", &self.total_latency)
            .finish_non_exhaustive()
    }
}
