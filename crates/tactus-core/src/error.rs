//! Error types for the graph, the processing path and the transport.
//!
//! Errors split by where they surface:
//!
//! - [`StructuralError`] is returned synchronously to the edit thread. A failed
//!   edit leaves the graph and the published schedule untouched.
//! - [`ProcessError`] is produced on the real-time thread, queued, and surfaced
//!   later through [`EngineMonitor`](crate::EngineMonitor). It is never returned
//!   from a processing call.
//! - [`TransportError`] is returned from transport transitions.

use crate::id::{AnyId, NodeId, PortId};
use crate::port::PortKind;
use crate::transport::PlayState;

/// Rejected structural edit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StructuralError {
    /// The connection would close a cycle that no feedback node breaks.
    #[error("connecting {from} to {to} would create a cycle")]
    CycleDetected {
        /// Node owning the source port.
        from: NodeId,
        /// Node owning the destination port.
        to: NodeId,
    },

    /// Source and destination ports carry different kinds of data.
    #[error("cannot connect {output_kind} port {output} to {input_kind} port {input}")]
    IncompatibleKind {
        /// Source (output) port.
        output: PortId,
        /// Kind of the source port.
        output_kind: PortKind,
        /// Destination (input) port.
        input: PortId,
        /// Kind of the destination port.
        input_kind: PortKind,
    },

    /// The source is not an output or the destination is not an input.
    #[error("port {0} has the wrong direction for this connection")]
    InvalidDirection(PortId),

    /// A handle that does not name a live entry.
    #[error("unknown id {0}")]
    UnknownId(AnyId),

    /// An argument outside its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Failure inside one block, contained to a single node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessError {
    /// The node reported a failure, or its state was unavailable this block.
    #[error("node {node} failed: {reason}")]
    NodeFailed {
        /// Failing node.
        node: NodeId,
        /// Static reason supplied by the node.
        reason: &'static str,
    },

    /// A node's buffers do not match the engine block size.
    #[error("node {node} buffer holds {actual} frames, block needs {expected}")]
    BufferSizeMismatch {
        /// Affected node.
        node: NodeId,
        /// Frames required by the block.
        expected: usize,
        /// Frames available in the node's buffer.
        actual: usize,
    },
}

impl ProcessError {
    /// Node the error belongs to.
    pub fn node(&self) -> NodeId {
        match self {
            Self::NodeFailed { node, .. } | Self::BufferSizeMismatch { node, .. } => *node,
        }
    }
}

/// Rejected transport transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Relocation is refused while a recording pass is running.
    #[error("cannot seek while recording")]
    SeekWhileRecording,

    /// The action makes no sense from the current state.
    #[error("cannot {action} while {from:?}")]
    InvalidTransition {
        /// State at the time of the request.
        from: PlayState,
        /// Requested action.
        action: &'static str,
    },

    /// Loop or punch range is empty, reversed or too short.
    #[error("invalid range {start}..{end}")]
    InvalidRange {
        /// Range start in samples.
        start: u64,
        /// Range end in samples.
        end: u64,
    },

    /// The command queue to the real-time thread is full.
    #[error("transport command queue is full")]
    QueueFull,
}

/// Failure while rebuilding a graph from a [`GraphDescription`](crate::GraphDescription).
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// No factory is registered for the processor type.
    #[error("unknown processor type '{0}'")]
    UnknownProcessor(String),

    /// A connection names a node or port that is not in the description.
    #[error("connection {index} references missing node or port")]
    DanglingConnection {
        /// Position of the connection in the description.
        index: usize,
    },

    /// Rebuilding the topology failed.
    #[error(transparent)]
    Structural(#[from] StructuralError),
}
