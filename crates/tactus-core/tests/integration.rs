//! Integration tests for tactus-core.
//!
//! Each test builds a small session through the public [`Engine`] API, renders
//! blocks through the [`Scheduler`] exactly as an audio callback would, and
//! checks the rendered samples, the transport and the monitor.

use std::sync::{Arc, Mutex};

use tactus_core::nodes::{Bus, Fader, LatencyDelay, SineSource};
use tactus_core::{
    BlockIo, Engine, EngineOptions, Event, NodeId, PlayState, PortSpec, ProcessContext,
    ProcessResult, Processor, RecordingMode, Scheduler, StructuralError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine(max_block: usize) -> (Engine, Scheduler) {
    Engine::new(EngineOptions {
        max_block,
        ..EngineOptions::default()
    })
    .expect("engine")
}

fn link(engine: &mut Engine, from: NodeId, output: usize, to: NodeId, input: usize, gain: f32) {
    let src = engine.graph().output(from, output).expect("output port");
    let dst = engine.graph().input(to, input).expect("input port");
    engine.connect(src, dst, gain).expect("connect");
}

fn render(scheduler: &mut Scheduler, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames];
    scheduler.render(&mut out, 1);
    out
}

/// Emits a single 1.0 on the first frame it ever processes.
struct Impulse {
    fired: bool,
}

impl Processor for Impulse {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_out("out")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        if !self.fired
            && let Some(first) = ctx.output(0).first_mut()
        {
            *first = 1.0;
            self.fired = true;
        }
        ProcessResult::Ok
    }
}

/// Audio pass-through.
struct Thru;

impl Processor for Thru {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let (input, output) = ctx.io(0, 0);
        output.copy_from_slice(input);
        ProcessResult::Ok
    }
}

/// Always fails.
struct Broken;

impl Processor for Broken {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        ctx.output(0).fill(1.0);
        ProcessResult::Failed("broken on purpose")
    }
}

/// Records the timeline of every call and the absolute position of incoming events.
#[derive(Clone, Default)]
struct Probe {
    calls: Arc<Mutex<Vec<(u64, usize, bool)>>>,
    events: Arc<Mutex<Vec<u64>>>,
}

impl Processor for Probe {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::event_in("midi")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let info = ctx.transport;
        self.calls
            .lock()
            .unwrap()
            .push((info.position, ctx.frames, info.rolling));
        let mut events = self.events.lock().unwrap();
        for event in ctx.input_events(0) {
            events.push(info.position + u64::from(event.frame));
        }
        ProcessResult::Ok
    }
}

// ===========================================================================
// 1. Ordering and determinism
// ===========================================================================

fn mixing_session(max_parallelism: usize) -> (Engine, Scheduler) {
    let (mut engine, scheduler) = Engine::new(EngineOptions {
        max_block: 128,
        max_parallelism,
        ..EngineOptions::default()
    })
    .unwrap();
    let out = engine.add_output("master", 1).unwrap();
    let bus = engine.add_processor("group", Box::new(Bus::new(1))).unwrap();
    for i in 0..6 {
        let tone = engine
            .add_processor(format!("tone {i}"), Box::new(SineSource::new(110.0 * f64::from(i + 1), 0.1)))
            .unwrap();
        let fader = engine.add_processor(format!("fader {i}"), Box::new(Fader::new(1))).unwrap();
        link(&mut engine, tone, 0, fader, 0, 1.0);
        link(&mut engine, fader, 0, bus, 0, 0.5);
    }
    link(&mut engine, bus, 0, out, 0, 1.0);
    (engine, scheduler)
}

fn names(engine: &Engine) -> Vec<String> {
    engine
        .schedule()
        .order()
        .iter()
        .map(|&id| engine.graph().node_name(id).unwrap().to_string())
        .collect()
}

#[test]
fn equal_graphs_compile_and_render_identically() {
    let (a, mut ra) = mixing_session(1);
    let (b, mut rb) = mixing_session(1);
    assert_eq!(names(&a), names(&b));
    for _ in 0..8 {
        assert_eq!(render(&mut ra, 128), render(&mut rb, 128));
    }
}

#[test]
fn parallel_render_matches_sequential() {
    let (_seq, mut sequential) = mixing_session(1);
    let (par, mut parallel) = mixing_session(4);
    assert!(parallel.is_parallel());
    assert!(par.schedule().stages().iter().any(|s| s.units().len() > 1));
    for _ in 0..32 {
        let expected = render(&mut sequential, 128);
        let actual = render(&mut parallel, 128);
        assert_eq!(expected, actual);
    }
}

#[test]
fn upstream_always_runs_first() {
    let (engine, _scheduler) = mixing_session(1);
    let order = names(&engine);
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
    for i in 0..6 {
        assert!(pos(&format!("tone {i}")) < pos(&format!("fader {i}")));
        assert!(pos(&format!("fader {i}")) < pos("group"));
    }
    assert!(pos("group") < pos("master"));
}

// ===========================================================================
// 2. Rejected edits
// ===========================================================================

#[test]
fn cycle_leaves_running_schedule_unchanged() {
    let (mut engine, _scheduler) = engine(64);
    let a = engine.add_processor("a", Box::new(Thru)).unwrap();
    let b = engine.add_processor("b", Box::new(Thru)).unwrap();
    link(&mut engine, a, 0, b, 0, 1.0);
    let before = engine.schedule().generation();

    let src = engine.graph().output(b, 0).unwrap();
    let dst = engine.graph().input(a, 0).unwrap();
    let err = engine.connect(src, dst, 1.0).unwrap_err();
    assert!(matches!(err, StructuralError::CycleDetected { .. }));
    assert_eq!(engine.schedule().generation(), before);
    assert_eq!(engine.graph().connection_count(), 1);
}

#[test]
fn disconnect_unknown_connection_is_a_no_op() {
    let (mut engine, _scheduler) = engine(64);
    let a = engine.add_processor("a", Box::new(Thru)).unwrap();
    let b = engine.add_processor("b", Box::new(Thru)).unwrap();
    let src = engine.graph().output(a, 0).unwrap();
    let dst = engine.graph().input(b, 0).unwrap();
    let id = engine.connect(src, dst, 1.0).unwrap();
    engine.disconnect(id).unwrap();

    let generation = engine.graph().generation();
    let published = engine.schedule().generation();
    let err = engine.disconnect(id).unwrap_err();
    assert!(matches!(err, StructuralError::UnknownId(_)));
    assert_eq!(engine.graph().generation(), generation);
    assert_eq!(engine.schedule().generation(), published);
}

// ===========================================================================
// 3. Delay compensation and feedback
// ===========================================================================

#[test]
fn parallel_paths_arrive_aligned() {
    let (mut engine, mut scheduler) = engine(256);
    let impulse = engine
        .add_processor("impulse", Box::new(Impulse { fired: false }))
        .unwrap();
    let lookahead = engine
        .add_processor("lookahead", Box::new(LatencyDelay::new(1, 64)))
        .unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, impulse, 0, lookahead, 0, 1.0);
    link(&mut engine, impulse, 0, out, 0, 1.0);
    link(&mut engine, lookahead, 0, out, 0, 1.0);
    assert_eq!(engine.schedule().total_latency(), 64);

    let block = render(&mut scheduler, 256);
    assert_eq!(block[64], 2.0);
    assert_eq!(block.iter().filter(|&&s| s != 0.0).count(), 1);
}

#[test]
fn unrelated_edit_keeps_compensated_audio() {
    let (mut engine, mut scheduler) = engine(256);
    let impulse = engine
        .add_processor("impulse", Box::new(Impulse { fired: false }))
        .unwrap();
    let lookahead = engine
        .add_processor("lookahead", Box::new(LatencyDelay::new(1, 64)))
        .unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, impulse, 0, lookahead, 0, 1.0);
    link(&mut engine, impulse, 0, out, 0, 1.0);
    link(&mut engine, lookahead, 0, out, 0, 1.0);

    let mut rendered = render(&mut scheduler, 32);
    engine.add_processor("unrelated", Box::new(Bus::new(1))).unwrap();
    for _ in 0..3 {
        rendered.extend(render(&mut scheduler, 32));
    }
    engine.maintain();

    assert_eq!(rendered[64], 2.0);
    assert_eq!(rendered.iter().filter(|&&s| s != 0.0).count(), 1);
}

/// Reports a latency that changes after its first block.
struct GrowingLatency {
    latency: u32,
}

impl Processor for GrowingLatency {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> ProcessResult {
        self.latency = 48;
        ProcessResult::Ok
    }

    fn latency_samples(&self) -> u32 {
        self.latency
    }
}

#[test]
fn runtime_latency_report_triggers_recompile() {
    let (mut engine, mut scheduler) = engine(64);
    let node = engine
        .add_processor("plugin", Box::new(GrowingLatency { latency: 0 }))
        .unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, node, 0, out, 0, 1.0);
    assert_eq!(engine.schedule().total_latency(), 0);

    let before = engine.schedule().generation();
    render(&mut scheduler, 64);
    engine.maintain();
    assert_eq!(engine.schedule().total_latency(), 48);
    assert!(engine.schedule().generation() > before);
}

#[test]
fn feedback_loop_repeats_with_decay() {
    let (mut engine, mut scheduler) = engine(64);
    let impulse = engine
        .add_processor("impulse", Box::new(Impulse { fired: false }))
        .unwrap();
    let bus = engine.add_processor("echo bus", Box::new(Bus::new(1))).unwrap();
    let fb = engine.add_feedback("echo", 1, 128).unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, impulse, 0, bus, 0, 1.0);
    link(&mut engine, bus, 0, out, 0, 1.0);
    link(&mut engine, bus, 0, fb, 0, 1.0);
    link(&mut engine, fb, 0, bus, 0, 0.5);

    let mut rendered = Vec::new();
    for _ in 0..8 {
        rendered.extend(render(&mut scheduler, 64));
    }
    assert_eq!(rendered[0], 1.0);
    assert_eq!(rendered[128], 0.5);
    assert_eq!(rendered[256], 0.25);
    assert_eq!(rendered.iter().filter(|&&s| s != 0.0).count(), 4);
}

#[test]
fn feedback_shorter_than_block_rejected() {
    let (mut engine, _scheduler) = engine(256);
    let err = engine.add_feedback("tight", 1, 64).unwrap_err();
    assert!(matches!(err, StructuralError::InvalidParameter(_)));
}

// ===========================================================================
// 4. Failure containment
// ===========================================================================

#[test]
fn failing_node_is_contained_for_a_hundred_blocks() {
    let (mut engine, mut scheduler) = engine(64);
    let tone = engine
        .add_processor("tone", Box::new(SineSource::new(440.0, 0.5)))
        .unwrap();
    let broken = engine.add_processor("broken", Box::new(Broken)).unwrap();
    let after = engine.add_processor("after", Box::new(Thru)).unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, tone, 0, broken, 0, 1.0);
    link(&mut engine, broken, 0, after, 0, 1.0);
    link(&mut engine, after, 0, out, 0, 1.0);
    engine.transport().play().unwrap();

    for _ in 0..100 {
        let block = render(&mut scheduler, 64);
        assert!(block.iter().all(|&s| s == 0.0));
    }
    assert_eq!(engine.transport().snapshot().position, 6400);
    assert_eq!(engine.transport().snapshot().state, PlayState::Playing);

    let failures = engine.maintain();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].node, broken);
    assert_eq!(failures[0].count, 100);
    assert_eq!(engine.monitor().total_failures(broken), 100);
    assert_eq!(engine.monitor().total_failures(after), 0);
    let shared = engine.graph().node(broken).unwrap().shared();
    assert_eq!(shared.failures(), 100);
    assert_eq!(scheduler.stats().blocks, 100);
}

// ===========================================================================
// 5. Live flags
// ===========================================================================

#[test]
fn bypass_and_control_apply_without_recompile() {
    let (mut engine, mut scheduler) = engine(64);
    let impulse = engine
        .add_processor("impulse", Box::new(Impulse { fired: false }))
        .unwrap();
    let fader = engine.add_processor("fader", Box::new(Fader::new(1))).unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, impulse, 0, fader, 0, 1.0);
    link(&mut engine, fader, 0, out, 0, 1.0);

    let gain = engine.graph().input(fader, 1).unwrap();
    engine.set_control(gain, -96.0).unwrap();
    engine.set_bypass(fader, true).unwrap();
    let generation = engine.schedule().generation();

    let block = render(&mut scheduler, 64);
    assert_eq!(block[0], 1.0);
    assert_eq!(engine.schedule().generation(), generation);
}

#[test]
fn disabled_node_is_silent() {
    let (mut engine, mut scheduler) = engine(64);
    let tone = engine
        .add_processor("tone", Box::new(SineSource::new(440.0, 0.5)))
        .unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, tone, 0, out, 0, 1.0);
    engine.set_enabled(tone, false).unwrap();
    assert!(render(&mut scheduler, 64).iter().all(|&s| s == 0.0));
    engine.set_enabled(tone, true).unwrap();
    assert!(render(&mut scheduler, 64).iter().any(|&s| s != 0.0));
}

// ===========================================================================
// 6. Transport
// ===========================================================================

#[test]
fn loop_wrap_splits_the_block() {
    let (mut engine, mut scheduler) = engine(512);
    let probe = Probe::default();
    engine.add_processor("probe", Box::new(probe.clone())).unwrap();
    let transport = engine.transport().clone();
    transport.set_loop(0, 1000).unwrap();
    transport.set_loop_enabled(true).unwrap();
    transport.seek(512).unwrap();
    transport.play().unwrap();

    render(&mut scheduler, 512);
    let calls = probe.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![(512, 488, true), (0, 24, true)]);
    assert_eq!(scheduler.transport().position(), 24);
    assert_eq!(transport.snapshot().position, 24);
}

#[test]
fn stopped_transport_still_processes() {
    let (mut engine, mut scheduler) = engine(128);
    let probe = Probe::default();
    engine.add_processor("probe", Box::new(probe.clone())).unwrap();
    render(&mut scheduler, 256);
    let calls = probe.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![(0, 128, false), (0, 128, false)]);
}

#[test]
fn backend_events_reach_nodes_at_their_frame() {
    let (mut engine, mut scheduler) = engine(256);
    let input = engine.add_input("in", 0).unwrap();
    let probe = Probe::default();
    let node = engine.add_processor("probe", Box::new(probe.clone())).unwrap();
    link(&mut engine, input, 0, node, 0, 1.0);
    engine.transport().play().unwrap();

    let events = [Event::note_on(10, 0, 60, 100), Event::note_off(300, 0, 60)];
    let mut output = vec![0.0; 512];
    scheduler.process(&mut BlockIo {
        input: &[],
        input_channels: 0,
        output: &mut output,
        output_channels: 1,
        events: &events,
    });
    assert_eq!(*probe.events.lock().unwrap(), vec![10, 300]);
}

#[test]
fn event_overflow_is_counted() {
    let (mut engine, mut scheduler) = Engine::new(EngineOptions {
        max_block: 64,
        event_capacity: 2,
        ..EngineOptions::default()
    })
    .unwrap();
    let input = engine.add_input("in", 0).unwrap();
    let probe = Probe::default();
    let node = engine.add_processor("probe", Box::new(probe.clone())).unwrap();
    link(&mut engine, input, 0, node, 0, 1.0);

    let events: Vec<Event> = (0..5).map(|i| Event::note_on(i, 0, 60, 100)).collect();
    let mut output = vec![0.0; 64];
    scheduler.process(&mut BlockIo {
        input: &[],
        input_channels: 0,
        output: &mut output,
        output_channels: 1,
        events: &events,
    });
    assert_eq!(probe.events.lock().unwrap().len(), 2);
    assert_eq!(scheduler.stats().dropped_events, 3);
    assert_eq!(engine.monitor().stats().dropped_events, 3);
}

// ===========================================================================
// 7. Recording
// ===========================================================================

fn recording_session() -> (Engine, Scheduler, NodeId) {
    let (mut engine, scheduler) = engine(64);
    let input = engine.add_input("mic", 1).unwrap();
    let out = engine.add_output("main", 1).unwrap();
    link(&mut engine, input, 0, out, 0, 1.0);
    engine.arm(input).unwrap();
    (engine, scheduler, input)
}

fn feed(scheduler: &mut Scheduler, blocks: usize, start: usize) {
    for b in 0..blocks {
        let input: Vec<f32> = (0..64).map(|i| ((start + b) * 64 + i) as f32).collect();
        let mut output = vec![0.0; 64];
        scheduler.process(&mut BlockIo {
            input: &input,
            input_channels: 1,
            output: &mut output,
            output_channels: 1,
            events: &[],
        });
    }
}

#[test]
fn records_armed_input() {
    let (mut engine, mut scheduler, input) = recording_session();
    engine.transport().set_recording(true).unwrap();
    engine.transport().play().unwrap();
    feed(&mut scheduler, 10, 0);
    engine.transport().stop().unwrap();
    feed(&mut scheduler, 1, 10);

    let regions = engine.take_recordings(RecordingMode::Takes);
    assert_eq!(regions.len(), 1);
    let region = &regions[0];
    assert_eq!(region.node, input);
    assert_eq!(region.start_sample, 0);
    assert_eq!(region.frames, 640);
    let audio = region.audio().unwrap();
    assert_eq!(audio.len(), 1);
    assert_eq!(audio[0][0], 0.0);
    assert_eq!(audio[0][639], 639.0);
    assert_eq!(engine.recorder().overruns(), 0);
}

#[test]
fn punch_limits_capture() {
    let (mut engine, mut scheduler, _input) = recording_session();
    let transport = engine.transport().clone();
    transport.set_punch(100, 300).unwrap();
    transport.set_punch_enabled(true).unwrap();
    transport.set_recording(true).unwrap();
    transport.play().unwrap();
    feed(&mut scheduler, 8, 0);
    transport.stop().unwrap();
    feed(&mut scheduler, 1, 8);

    let regions = engine.take_recordings(RecordingMode::Takes);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].start_sample, 100);
    assert_eq!(regions[0].frames, 200);
    assert_eq!(regions[0].audio().unwrap()[0][0], 100.0);
}

#[test]
fn loop_recording_produces_a_take_per_pass() {
    let (mut engine, mut scheduler, _input) = recording_session();
    let transport = engine.transport().clone();
    transport.set_loop(0, 256).unwrap();
    transport.set_loop_enabled(true).unwrap();
    transport.set_recording(true).unwrap();
    transport.play().unwrap();
    feed(&mut scheduler, 10, 0);
    transport.stop().unwrap();
    feed(&mut scheduler, 1, 10);

    let regions = engine.take_recordings(RecordingMode::TakesMuted);
    assert_eq!(regions.len(), 3);
    assert_eq!(
        regions.iter().map(|r| r.frames).collect::<Vec<_>>(),
        vec![256, 256, 128]
    );
    assert!(regions.iter().all(|r| r.start_sample == 0));
    assert_eq!(regions.iter().filter(|r| !r.muted).count(), 1);
    assert!(!regions[2].muted);
}

// ===========================================================================
// 8. Node lifetime
// ===========================================================================

#[test]
fn removed_nodes_are_never_processed_after_retirement() {
    let (mut engine, mut scheduler) = engine(64);
    let out = engine.add_output("main", 1).unwrap();
    for round in 0..50 {
        let tone = engine
            .add_processor(format!("tone {round}"), Box::new(SineSource::new(220.0, 0.1)))
            .unwrap();
        link(&mut engine, tone, 0, out, 0, 1.0);
        render(&mut scheduler, 64);
        engine.remove_node(tone).unwrap();
        render(&mut scheduler, 64);
        engine.maintain();
    }
    assert_eq!(engine.quarantined(), 0);
    assert_eq!(scheduler.stats().retired_hits, 0);
    assert_eq!(engine.graph().node_count(), 1);
}
