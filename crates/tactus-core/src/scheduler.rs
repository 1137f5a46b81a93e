//! Real-time block processing.
//!
//! [`Scheduler`] is the only thing the audio callback touches. Per callback it:
//!
//! 1. Picks up the latest published schedule and tempo map and acknowledges
//!    them.
//! 2. Applies queued transport commands.
//! 3. Splits the block into sub-blocks (loop wrap, punch edges, tempo
//!    changes) and runs the schedule once per sub-block.
//! 4. Publishes the new transport state.
//!
//! Nothing here allocates, blocks or logs. Node failures are contained: the
//! node's outputs are zeroed, the failure is queued for the
//! [`EngineMonitor`](crate::EngineMonitor) and the block completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::Sender;

use crate::buffer::{Event, EventBuffer, PortBuffer, accumulate};
use crate::error::ProcessError;
use crate::node::{NodeBody, NodeCell, NodeRuntime, ProcessContext, ProcessResult};
use crate::pool::WorkerPool;
use crate::publish::{Subscriber, Versioned};
use crate::schedule::{DelayLine, FeedSource, Schedule, Step};
use crate::tempo::TempoMap;
use crate::transport::{SubBlock, Transport, TransportInbox};

/// Counters updated on the real-time path.
#[derive(Debug, Default)]
pub(crate) struct RtStats {
    pub(crate) blocks: AtomicU64,
    pub(crate) sub_blocks: AtomicU64,
    pub(crate) node_failures: AtomicU64,
    pub(crate) dropped_reports: AtomicU64,
    pub(crate) dropped_events: AtomicU64,
    pub(crate) retired_hits: AtomicU64,
    pub(crate) latency_changed: AtomicBool,
}

/// Snapshot of the scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Callbacks processed.
    pub blocks: u64,
    /// Sub-blocks processed.
    pub sub_blocks: u64,
    /// Node-blocks that failed.
    pub node_failures: u64,
    /// Failure reports lost because the queue was full.
    pub dropped_reports: u64,
    /// Events lost because a port's event buffer was full.
    pub dropped_events: u64,
    /// Times a retired node was reached by a schedule. Always zero unless the
    /// quarantine is broken.
    pub retired_hits: u64,
}

/// State shared between the scheduler, its workers and the monitor.
#[derive(Debug)]
pub(crate) struct RtShared {
    failures: Sender<ProcessError>,
    pub(crate) stats: RtStats,
}

impl RtShared {
    pub(crate) fn new(failures: Sender<ProcessError>) -> Self {
        Self {
            failures,
            stats: RtStats::default(),
        }
    }

    fn report(&self, cell: &NodeCell, error: ProcessError) {
        cell.shared().note_failure();
        self.stats.node_failures.fetch_add(1, Ordering::Relaxed);
        if self.failures.try_send(error).is_err() {
            self.stats.dropped_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fail(&self, cell: &NodeCell, reason: &'static str) {
        self.report(
            cell,
            ProcessError::NodeFailed {
                node: cell.id(),
                reason,
            },
        );
    }

    /// Moves the drop counters of `buffers` into the stats.
    fn tally_dropped(&self, buffers: &mut [PortBuffer]) {
        let dropped: u64 = buffers
            .iter_mut()
            .filter_map(PortBuffer::events_mut)
            .map(|events| u64::from(events.take_dropped()))
            .sum();
        if dropped > 0 {
            self.stats.dropped_events.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        let s = &self.stats;
        SchedulerStats {
            blocks: s.blocks.load(Ordering::Relaxed),
            sub_blocks: s.sub_blocks.load(Ordering::Relaxed),
            node_failures: s.node_failures.load(Ordering::Relaxed),
            dropped_reports: s.dropped_reports.load(Ordering::Relaxed),
            dropped_events: s.dropped_events.load(Ordering::Relaxed),
            retired_hits: s.retired_hits.load(Ordering::Relaxed),
        }
    }
}

/// Interleaved backend buffers for one callback.
pub struct BlockIo<'a> {
    /// Interleaved input samples. May be empty.
    pub input: &'a [f32],
    /// Channels in `input`.
    pub input_channels: usize,
    /// Interleaved output samples. Overwritten.
    pub output: &'a mut [f32],
    /// Channels in `output`.
    pub output_channels: usize,
    /// Incoming events, frames relative to the start of the callback.
    pub events: &'a [Event],
}

impl<'a> BlockIo<'a> {
    /// Output-only block.
    pub fn output_only(output: &'a mut [f32], channels: usize) -> Self {
        Self {
            input: &[],
            input_channels: 0,
            output,
            output_channels: channels,
            events: &[],
        }
    }

    /// Frames in this callback.
    pub fn frames(&self) -> usize {
        if self.output_channels > 0 {
            self.output.len() / self.output_channels
        } else if self.input_channels > 0 {
            self.input.len() / self.input_channels
        } else {
            0
        }
    }
}

/// Real-time end of the engine.
pub struct Scheduler {
    schedules: Subscriber<Schedule>,
    tempo: Subscriber<TempoMap>,
    transport: Transport,
    inbox: TransportInbox,
    pool: Option<WorkerPool>,
    rt: Arc<RtShared>,
}

impl Scheduler {
    pub(crate) fn new(
        schedules: Subscriber<Schedule>,
        tempo: Subscriber<TempoMap>,
        inbox: TransportInbox,
        rt: Arc<RtShared>,
        pool: Option<WorkerPool>,
        return_to_cue: bool,
    ) -> Self {
        let mut transport = Transport::new();
        transport.set_return_to_cue(return_to_cue);
        if let Some(pool) = &pool {
            pool.set_schedule(Arc::clone(schedules.current()));
        }
        Self {
            schedules,
            tempo,
            transport,
            inbox,
            pool,
            rt,
        }
    }

    /// Processes one callback.
    pub fn process(&mut self, io: &mut BlockIo<'_>) {
        let frames = io.frames();
        io.output.fill(0.0);

        if self.schedules.refresh()
            && let Some(pool) = &self.pool
        {
            pool.set_schedule(Arc::clone(self.schedules.current()));
        }
        self.schedules.acknowledge();
        self.tempo.refresh();
        self.tempo.acknowledge();
        self.inbox.drain_into(&mut self.transport);

        let schedule: &Versioned<Schedule> = self.schedules.current();
        let tempo: &TempoMap = self.tempo.current();
        let max_block = schedule.max_block.max(1);

        let mut done = 0;
        while done < frames {
            let plan = self.transport.plan((frames - done).min(max_block), tempo);
            for sub in plan.sub_blocks() {
                let sub = SubBlock {
                    offset: done + sub.offset,
                    ..*sub
                };
                run_sub_block(schedule, self.pool.as_mut(), &self.rt, io, &sub);
                self.rt.stats.sub_blocks.fetch_add(1, Ordering::Relaxed);
            }
            self.transport.commit(&plan);
            if plan.frames() == 0 {
                break;
            }
            done += plan.frames();
        }

        self.inbox.shared().publish(&self.transport, tempo);
        self.rt.stats.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders `output` with no backend input.
    pub fn render(&mut self, output: &mut [f32], channels: usize) {
        self.process(&mut BlockIo::output_only(output, channels));
    }

    /// Transport state as of the last block.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Schedule in use.
    pub fn schedule(&self) -> &Schedule {
        self.schedules.current()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.rt.snapshot()
    }

    /// True if work units of a stage run on worker threads.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("generation", &self.schedules.current().generation())
            .field("transport", &self.transport)
            .field("parallel", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

fn run_sub_block(
    schedule: &Schedule,
    mut pool: Option<&mut WorkerPool>,
    rt: &RtShared,
    io: &mut BlockIo<'_>,
    sub: &SubBlock,
) {
    for &i in &schedule.inputs {
        run_input(schedule, i, io, sub, rt);
    }
    for &i in &schedule.feedback {
        run_feedback_emit(&schedule.steps[i], sub, rt);
    }
    for (index, stage) in schedule.stages.iter().enumerate() {
        let units = stage.units.len();
        match pool.as_deref_mut() {
            Some(pool) if units > 1 => pool.run_stage(index, units, sub),
            _ => {
                for unit in 0..units {
                    execute_unit(schedule, index, unit, sub, rt);
                }
            }
        }
    }
    for &i in &schedule.feedback {
        run_feedback_absorb(schedule, i, sub, rt);
    }
    for &i in &schedule.outputs {
        run_output(schedule, i, io, sub, rt);
    }
}

/// Runs every processor of one work unit in order.
pub(crate) fn execute_unit(schedule: &Schedule, stage: usize, unit: usize, sub: &SubBlock, rt: &RtShared) {
    let Some(unit) = schedule.stages.get(stage).and_then(|s| s.units.get(unit)) else {
        return;
    };
    for &step in &unit.steps {
        run_processor(schedule, step, sub, rt);
    }
}

fn run_processor(schedule: &Schedule, index: usize, sub: &SubBlock, rt: &RtShared) {
    let step = &schedule.steps[index];
    let cell = &*step.cell;
    let shared = cell.shared();
    if shared.is_retired() {
        rt.stats.retired_hits.fetch_add(1, Ordering::Relaxed);
    }
    let Some(mut guard) = cell.runtime.try_write() else {
        rt.fail(cell, "node state busy");
        return;
    };
    let runtime = &mut *guard;
    let len = sub.len;

    let available = runtime.frames();
    if available < len {
        for out in &mut runtime.outputs {
            out.clear(available);
        }
        rt.report(
            cell,
            ProcessError::BufferSizeMismatch {
                node: cell.id(),
                expected: len,
                actual: available,
            },
        );
        return;
    }

    gather(schedule, step, &mut runtime.inputs, len);
    rt.tally_dropped(&mut runtime.inputs);
    for out in &mut runtime.outputs {
        out.clear(len);
    }
    if !shared.is_enabled() {
        return;
    }

    let state = runtime.state.get_mut();
    let NodeBody::Processor(processor) = &mut state.body else {
        return;
    };
    let result = if shared.is_bypassed() {
        ProcessResult::Bypassed
    } else {
        let mut ctx = ProcessContext::new(
            sub.info,
            len,
            schedule.sample_rate,
            &runtime.inputs,
            &mut runtime.outputs,
        );
        processor.process(&mut ctx)
    };
    match result {
        ProcessResult::Ok => shared.note_success(),
        ProcessResult::Bypassed => {
            bypass_copy(&runtime.inputs, &mut runtime.outputs, len);
            shared.note_success();
        }
        ProcessResult::Failed(reason) => {
            for out in &mut runtime.outputs {
                out.clear(len);
            }
            rt.fail(cell, reason);
        }
    }
    rt.tally_dropped(&mut runtime.outputs);

    let latency = processor.latency_samples();
    if latency != shared.latency() {
        shared.set_latency(latency);
        rt.stats.latency_changed.store(true, Ordering::Release);
    }

    if sub.info.capturing
        && shared.is_armed()
        && let Some(tap) = &mut state.capture
    {
        let ports = if tap.from_outputs() {
            &runtime.outputs
        } else {
            &runtime.inputs
        };
        tap.capture(ports, sub);
    }
}

fn run_input(schedule: &Schedule, index: usize, io: &BlockIo<'_>, sub: &SubBlock, rt: &RtShared) {
    let cell = &*schedule.steps[index].cell;
    let Some(mut guard) = cell.runtime.try_write() else {
        rt.fail(cell, "node state busy");
        return;
    };
    let runtime = &mut *guard;
    let len = sub.len.min(runtime.frames());
    let enabled = cell.shared().is_enabled();
    let channels = io.input_channels;
    let mut channel = 0;
    for out in &mut runtime.outputs {
        match out {
            PortBuffer::Signal(samples) => {
                for (i, sample) in samples[..len].iter_mut().enumerate() {
                    *sample = if enabled && channel < channels {
                        io.input
                            .get((sub.offset + i) * channels + channel)
                            .copied()
                            .unwrap_or(0.0)
                    } else {
                        0.0
                    };
                }
                channel += 1;
            }
            PortBuffer::Events(events) => {
                events.clear();
                if enabled {
                    let (start, end) = (sub.offset, sub.offset + len);
                    for event in io.events {
                        let frame = event.frame as usize;
                        if frame >= start && frame < end {
                            events.push(event.at((frame - start) as u32));
                        }
                    }
                }
            }
        }
    }
    rt.tally_dropped(&mut runtime.outputs);
    capture(cell, runtime, sub);
}

fn run_output(schedule: &Schedule, index: usize, io: &mut BlockIo<'_>, sub: &SubBlock, rt: &RtShared) {
    let step = &schedule.steps[index];
    let cell = &*step.cell;
    let Some(mut guard) = cell.runtime.try_write() else {
        rt.fail(cell, "node state busy");
        return;
    };
    let runtime = &mut *guard;
    let len = sub.len.min(runtime.frames());
    gather(schedule, step, &mut runtime.inputs, len);
    rt.tally_dropped(&mut runtime.inputs);
    if cell.shared().is_enabled() {
        let channels = io.output_channels;
        let signals = runtime.inputs.iter().filter_map(PortBuffer::signal);
        for (channel, samples) in signals.enumerate().take(channels) {
            for (i, sample) in samples[..len].iter().enumerate() {
                if let Some(out) = io.output.get_mut((sub.offset + i) * channels + channel) {
                    *out += *sample;
                }
            }
        }
    }
    capture(cell, runtime, sub);
}

fn run_feedback_emit(step: &Step, sub: &SubBlock, rt: &RtShared) {
    let cell = &*step.cell;
    let Some(mut guard) = cell.runtime.try_write() else {
        rt.fail(cell, "node state busy");
        return;
    };
    let runtime = &mut *guard;
    let len = sub.len.min(runtime.frames());
    if let NodeBody::Feedback(line) = &runtime.state.get_mut().body {
        line.emit(&mut runtime.outputs, len);
    }
    if !cell.shared().is_enabled() {
        for out in &mut runtime.outputs {
            out.clear(len);
        }
    }
}

fn run_feedback_absorb(schedule: &Schedule, index: usize, sub: &SubBlock, rt: &RtShared) {
    let step = &schedule.steps[index];
    let cell = &*step.cell;
    let Some(mut guard) = cell.runtime.try_write() else {
        rt.fail(cell, "node state busy");
        return;
    };
    let runtime = &mut *guard;
    let len = sub.len.min(runtime.frames());
    gather(schedule, step, &mut runtime.inputs, len);
    rt.tally_dropped(&mut runtime.inputs);
    if let NodeBody::Feedback(line) = &mut runtime.state.get_mut().body {
        line.absorb(&runtime.inputs, len);
    }
}

fn capture(cell: &NodeCell, runtime: &mut NodeRuntime, sub: &SubBlock) {
    if !(sub.info.capturing && cell.shared().is_armed()) {
        return;
    }
    let state = runtime.state.get_mut();
    if let Some(tap) = &mut state.capture {
        let ports = if tap.from_outputs() {
            &runtime.outputs
        } else {
            &runtime.inputs
        };
        tap.capture(ports, sub);
    }
}

/// Fills a step's input buffers from its connections.
fn gather(schedule: &Schedule, step: &Step, inputs: &mut [PortBuffer], len: usize) {
    for feed in &step.feeds {
        let Some(dst) = inputs.get_mut(feed.port) else {
            continue;
        };
        dst.clear(len);
        if feed.sources.is_empty() {
            if let (Some(control), Some(samples)) = (&feed.control, dst.signal_mut()) {
                samples[..len].fill(control.get());
            }
            continue;
        }
        for source in &feed.sources {
            let Some(src_step) = schedule.steps.get(source.step) else {
                continue;
            };
            // An unavailable source contributes silence but still feeds its delay line.
            let guard = src_step.cell.runtime.try_read();
            let src = guard.as_ref().and_then(|rt| rt.outputs.get(source.port));
            mix(dst, src, source, len);
        }
    }
}

fn mix(dst: &mut PortBuffer, src: Option<&PortBuffer>, source: &FeedSource, len: usize) {
    let mut delay = source.delay.as_ref().and_then(|d| d.try_lock());
    match (dst, delay.as_deref_mut()) {
        (PortBuffer::Signal(out), Some(DelayLine::Signal(line))) => {
            let input = src.and_then(PortBuffer::signal);
            for (i, sample) in out[..len].iter_mut().enumerate() {
                let x = input.and_then(|s| s.get(i)).copied().unwrap_or(0.0);
                *sample += line.tick(x) * source.multiplier;
            }
        }
        (PortBuffer::Signal(out), _) => {
            if let Some(input) = src.and_then(PortBuffer::signal) {
                let n = len.min(input.len());
                accumulate(&mut out[..n], &input[..n], source.multiplier);
            }
        }
        (PortBuffer::Events(out), Some(DelayLine::Events(line))) => match src.and_then(PortBuffer::events) {
            Some(input) => line.process(input, len, out),
            None => line.process(&EventBuffer::with_capacity(0), len, out),
        },
        (PortBuffer::Events(out), _) => {
            if let Some(input) = src.and_then(PortBuffer::events) {
                for event in input.before(len) {
                    out.push(*event);
                }
            }
        }
    }
}

/// Copies inputs to outputs, pairing the n-th output of each buffer type
/// with the n-th input of the same type.
fn bypass_copy(inputs: &[PortBuffer], outputs: &mut [PortBuffer], len: usize) {
    let mut signals = inputs.iter().filter(|b| b.signal().is_some());
    let mut events = inputs.iter().filter(|b| b.events().is_some());
    for out in outputs {
        let source = match out {
            PortBuffer::Signal(_) => signals.next(),
            PortBuffer::Events(_) => events.next(),
        };
        match source {
            Some(input) => out.copy_from(input, len),
            None => out.clear(len),
        }
    }
}
