//! Processable nodes.
//!
//! A node is the unit of work in the graph: a track, fader, send, plugin
//! adapter, modulator or bus. Third-party and built-in processing is expressed
//! through the [`Processor`] trait; the engine adds a few structural kinds of
//! its own ([`NodeKind`]).
//!
//! # Shared state
//!
//! Each node is an [`Arc<NodeCell>`] shared between the graph (edit side) and
//! every schedule that references it:
//!
//! - Flags the edit thread flips without recompiling (enabled, bypassed,
//!   record-armed) are atomics in [`NodeShared`].
//! - Port buffers and processor state sit behind a `parking_lot::RwLock`. The
//!   real-time path only ever uses `try_write` on the node it runs and
//!   `try_read` on its sources. A failed attempt degrades to silence and a
//!   report, never to waiting.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::buffer::{Event, EventBuffer, PortBuffer};
use crate::id::NodeId;
use crate::port::PortSpec;
use crate::recording::CaptureTap;
use crate::transport::TransportInfo;

/// Outcome of one [`Processor::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Outputs were written.
    Ok,
    /// The processor chose to pass inputs through unchanged.
    Bypassed,
    /// The processor could not run. Its outputs are zeroed and the failure is
    /// reported off the real-time thread.
    Failed(&'static str),
}

/// Everything a processor sees for one sub-block.
///
/// Input buffers were gathered from upstream connections (summed for
/// signals, merged for events). Output buffers were cleared, so a processor
/// that writes nothing produces silence.
pub struct ProcessContext<'a> {
    /// Timeline position and tempo for the first frame.
    pub transport: TransportInfo,
    /// Frames to process.
    pub frames: usize,
    /// Engine sample rate.
    pub sample_rate: f64,
    inputs: &'a [PortBuffer],
    outputs: &'a mut [PortBuffer],
}

impl<'a> ProcessContext<'a> {
    /// Creates a context over borrowed port buffers.
    pub fn new(
        transport: TransportInfo,
        frames: usize,
        sample_rate: f64,
        inputs: &'a [PortBuffer],
        outputs: &'a mut [PortBuffer],
    ) -> Self {
        Self {
            transport,
            frames,
            sample_rate,
            inputs,
            outputs,
        }
    }

    /// Number of input ports.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output ports.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Samples of signal input `port`. Empty for event ports or a missing port.
    #[inline]
    pub fn input(&self, port: usize) -> &[f32] {
        self.inputs
            .get(port)
            .and_then(PortBuffer::signal)
            .map_or(&[], |s| &s[..self.frames.min(s.len())])
    }

    /// First sample of a control input, or `default` if the port is missing.
    #[inline]
    pub fn control(&self, port: usize, default: f32) -> f32 {
        self.input(port).first().copied().unwrap_or(default)
    }

    /// Events of input `port`. Empty for signal ports or a missing port.
    #[inline]
    pub fn input_events(&self, port: usize) -> &[Event] {
        self.inputs
            .get(port)
            .and_then(PortBuffer::events)
            .map_or(&[], |e| e.before(self.frames))
    }

    /// Samples of signal output `port`. Empty for event ports or a missing port.
    #[inline]
    pub fn output(&mut self, port: usize) -> &mut [f32] {
        let frames = self.frames;
        match self.outputs.get_mut(port).and_then(PortBuffer::signal_mut) {
            Some(s) => {
                let n = frames.min(s.len());
                &mut s[..n]
            }
            None => &mut [],
        }
    }

    /// Event buffer of output `port`.
    #[inline]
    pub fn output_events(&mut self, port: usize) -> Option<&mut EventBuffer> {
        self.outputs.get_mut(port).and_then(PortBuffer::events_mut)
    }

    /// Input and output signal of a pair of ports, for in-to-out processing.
    pub fn io(&mut self, input: usize, output: usize) -> (&[f32], &mut [f32]) {
        let frames = self.frames;
        let src = self
            .inputs
            .get(input)
            .and_then(PortBuffer::signal)
            .map_or(&[][..], |s| &s[..frames.min(s.len())]);
        let dst = match self.outputs.get_mut(output).and_then(PortBuffer::signal_mut) {
            Some(s) => {
                let n = frames.min(s.len());
                &mut s[..n]
            }
            None => &mut [],
        };
        (src, dst)
    }
}

/// Uniform processing contract for everything that is not a structural node.
///
/// Implementations must not allocate, block or panic in [`process`](Self::process).
/// A processor that cannot produce output returns [`ProcessResult::Failed`].
pub trait Processor: Send {
    /// Initial port layout. Called once when the node is created.
    fn ports(&self) -> Vec<PortSpec>;

    /// Called off the real-time thread before first use and after the sample
    /// rate or block size changes.
    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    /// Processes one sub-block.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult;

    /// Processing latency in samples. Read after every block; a change
    /// triggers recompensation on the next maintenance pass.
    fn latency_samples(&self) -> u32 {
        0
    }

    /// Clears internal state (delay lines, envelopes).
    fn reset(&mut self) {}

    /// Registry name used when saving and restoring the graph.
    fn type_name(&self) -> &str {
        "custom"
    }

    /// Named parameters to persist. The registry factory receives them back.
    fn parameters(&self) -> Vec<(String, f32)> {
        Vec::new()
    }
}

/// Structural role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Backend input: one audio output per channel plus one event output.
    Input {
        /// Audio channels.
        channels: u16,
    },
    /// Backend output: one audio input per channel, mixed into the device buffer.
    Output {
        /// Audio channels.
        channels: u16,
    },
    /// Explicit delay that may close a cycle.
    ///
    /// Connections into a feedback node are not dependencies. Its output is
    /// the input from `delay` samples earlier.
    Feedback {
        /// Audio channels.
        channels: u16,
        /// Delay in samples, at least the engine's maximum block size.
        delay: u32,
    },
    /// A [`Processor`].
    Processor,
}

/// Flags and counters shared with the real-time path.
#[derive(Debug)]
pub struct NodeShared {
    enabled: AtomicBool,
    bypassed: AtomicBool,
    armed: AtomicBool,
    retired: AtomicBool,
    latency: AtomicU32,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl NodeShared {
    fn new(latency: u32) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            bypassed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            latency: AtomicU32::new(latency),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// True unless the node was disabled.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// True while bypassed.
    #[inline]
    pub fn is_bypassed(&self) -> bool {
        self.bypassed.load(Ordering::Relaxed)
    }

    /// True while armed for recording.
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    /// True once the node was removed and released from quarantine.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Latency last reported by the processor.
    #[inline]
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Total failed blocks.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Failed blocks since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_bypassed(&self, on: bool) {
        self.bypassed.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_armed(&self, on: bool) {
        self.armed.store(on, Ordering::Relaxed);
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn set_latency(&self, samples: u32) {
        self.latency.store(samples, Ordering::Relaxed);
    }

    pub(crate) fn note_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

/// Audio history of a feedback node.
#[derive(Debug)]
pub(crate) struct FeedbackLine {
    rings: Vec<Vec<f32>>,
    pos: usize,
}

impl FeedbackLine {
    pub(crate) fn new(channels: usize, delay: usize) -> Self {
        Self {
            rings: vec![vec![0.0; delay.max(1)]; channels],
            pos: 0,
        }
    }

    /// Writes the oldest `len` samples of each channel into `outputs`.
    pub(crate) fn emit(&self, outputs: &mut [PortBuffer], len: usize) {
        for (ring, out) in self.rings.iter().zip(outputs.iter_mut()) {
            if let Some(out) = out.signal_mut() {
                let n = ring.len();
                for (i, sample) in out.iter_mut().take(len).enumerate() {
                    *sample = ring[(self.pos + i) % n];
                }
            }
        }
    }

    /// Stores `len` samples of each input channel and advances.
    pub(crate) fn absorb(&mut self, inputs: &[PortBuffer], len: usize) {
        for (ring, input) in self.rings.iter_mut().zip(inputs) {
            if let Some(input) = input.signal() {
                let n = ring.len();
                for (i, sample) in input.iter().take(len).enumerate() {
                    ring[(self.pos + i) % n] = *sample;
                }
            }
        }
        if let Some(n) = self.rings.first().map(Vec::len) {
            self.pos = (self.pos + len) % n;
        }
    }

    pub(crate) fn clear(&mut self) {
        for ring in &mut self.rings {
            ring.fill(0.0);
        }
        self.pos = 0;
    }
}

/// Behaviour behind a node.
pub(crate) enum NodeBody {
    Input,
    Output,
    Feedback(FeedbackLine),
    Processor(Box<dyn Processor>),
}

/// Mutable state that is not shared with readers of the node's outputs.
pub(crate) struct NodeState {
    pub(crate) body: NodeBody,
    pub(crate) capture: Option<CaptureTap>,
}

/// Port buffers plus processing state.
pub(crate) struct NodeRuntime {
    pub(crate) inputs: Vec<PortBuffer>,
    pub(crate) outputs: Vec<PortBuffer>,
    /// Only reached through `get_mut` while the runtime is write-locked, so
    /// the mutex is never contended. It makes the runtime `Sync` without
    /// requiring processors to be.
    pub(crate) state: Mutex<NodeState>,
}

impl NodeRuntime {
    /// Smallest signal buffer length, or `usize::MAX` without signal ports.
    pub(crate) fn frames(&self) -> usize {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .map(PortBuffer::frames)
            .min()
            .unwrap_or(usize::MAX)
    }
}

/// A node shared between the graph and compiled schedules.
pub struct NodeCell {
    id: NodeId,
    seq: u64,
    name: String,
    kind: NodeKind,
    shared: NodeShared,
    pub(crate) runtime: RwLock<NodeRuntime>,
}

impl NodeCell {
    pub(crate) fn new(
        id: NodeId,
        seq: u64,
        name: String,
        kind: NodeKind,
        body: NodeBody,
        latency: u32,
    ) -> Self {
        Self {
            id,
            seq,
            name,
            kind,
            shared: NodeShared::new(latency),
            runtime: RwLock::new(NodeRuntime {
                inputs: Vec::new(),
                outputs: Vec::new(),
                state: Mutex::new(NodeState {
                    body,
                    capture: None,
                }),
            }),
        }
    }

    /// Node handle.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Creation sequence number. Breaks ties in the execution order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Flags and counters.
    pub fn shared(&self) -> &NodeShared {
        &self.shared
    }
}

impl core::fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NodeCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
