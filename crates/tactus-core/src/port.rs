//! Typed port endpoints.
//!
//! A port belongs to exactly one node and carries one kind of data. Audio, CV
//! and control ports hold mono `f32` signal buffers; event ports hold an
//! [`EventBuffer`](crate::buffer::EventBuffer). Connections may only join ports
//! of the same kind, from an output to an input.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// Kind of data a port carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Audio-rate signal.
    Audio,
    /// Timestamped MIDI-style events.
    Event,
    /// Parameter value, one per sample, usually constant within a block.
    Control,
    /// Audio-rate modulation signal.
    Cv,
}

impl PortKind {
    /// True for kinds backed by `f32` sample buffers.
    #[inline]
    pub fn is_signal(self) -> bool {
        !matches!(self, Self::Event)
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Event => "event",
            Self::Control => "control",
            Self::Cv => "cv",
        })
    }
}

/// Direction of data flow relative to the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    /// Data flows into the node.
    Input,
    /// Data flows out of the node.
    Output,
}

/// Value range of a control port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlRange {
    /// Minimum value.
    pub min: f32,
    /// Maximum value.
    pub max: f32,
    /// Value used when nothing is connected and nothing was set.
    pub default: f32,
}

impl ControlRange {
    /// Creates a range. `default` is clamped into `min..=max`.
    pub fn new(min: f32, max: f32, default: f32) -> Self {
        Self {
            min,
            max,
            default: default.clamp(min, max),
        }
    }
}

impl Default for ControlRange {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.0)
    }
}

/// Static description of a port, used when creating nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    /// Display name.
    pub name: String,
    /// Data kind.
    pub kind: PortKind,
    /// Flow direction.
    pub direction: PortDirection,
    /// Range for control inputs.
    pub range: Option<ControlRange>,
}

impl PortSpec {
    /// Audio input port.
    pub fn audio_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Audio, PortDirection::Input)
    }

    /// Audio output port.
    pub fn audio_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Audio, PortDirection::Output)
    }

    /// Event input port.
    pub fn event_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Event, PortDirection::Input)
    }

    /// Event output port.
    pub fn event_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Event, PortDirection::Output)
    }

    /// CV output port.
    pub fn cv_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Cv, PortDirection::Output)
    }

    /// CV input port.
    pub fn cv_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Cv, PortDirection::Input)
    }

    /// Control input port with a value range.
    pub fn control_in(name: impl Into<String>, range: ControlRange) -> Self {
        Self {
            range: Some(range),
            ..Self::new(name, PortKind::Control, PortDirection::Input)
        }
    }

    /// Port of any kind and direction.
    pub fn new(name: impl Into<String>, kind: PortKind, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            kind,
            direction,
            range: None,
        }
    }
}

/// Lock-free control value shared between the edit thread and the processing path.
///
/// The edit thread writes, the scheduler reads when the owning control input
/// has no incoming connection. `f32` is stored as bits in an `AtomicU32`.
#[derive(Debug)]
pub struct ControlValue {
    value: AtomicU32,
    range: ControlRange,
}

impl ControlValue {
    /// Creates a value initialised to the range default.
    pub fn new(range: ControlRange) -> Self {
        Self {
            value: AtomicU32::new(range.default.to_bits()),
            range,
        }
    }

    /// Sets the value, clamped to the range.
    #[inline]
    pub fn set(&self, v: f32) {
        let clamped = v.clamp(self.range.min, self.range.max);
        self.value.store(clamped.to_bits(), Ordering::Release);
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }

    /// Range of this value.
    pub fn range(&self) -> ControlRange {
        self.range
    }

    /// Restores the default.
    pub fn reset(&self) {
        self.set(self.range.default);
    }
}

/// Port record kept by the graph.
#[derive(Debug, Clone)]
pub(crate) struct Port {
    pub(crate) node: NodeId,
    pub(crate) name: String,
    pub(crate) kind: PortKind,
    pub(crate) direction: PortDirection,
    /// Position among the node's ports of the same direction.
    pub(crate) slot: usize,
    pub(crate) control: Option<Arc<ControlValue>>,
}
