//! Transport state machine, block splitting and the edit-side handle.
//!
//! # Architecture
//!
//! - [`Transport`] is the authoritative state. It is owned by the
//!   [`Scheduler`](crate::Scheduler) and only mutated on the real-time thread.
//!   It stores a sample position and nothing else that measures time; ticks
//!   always come from the [`TempoMap`].
//! - [`TransportHandle`] lives on the edit side. It queues [`TransportCommand`]s
//!   over a bounded lock-free channel and reads the state the real-time thread
//!   publishes after every block. Commands take effect at the next block
//!   boundary; an in-flight block is never interrupted.
//!
//! # Block splitting
//!
//! Each block is planned as a list of [`SubBlock`]s over which the position is
//! contiguous and increasing. A block is split where it crosses the loop end
//! (the remainder restarts at the loop start), at punch boundaries while
//! recording, and at tempo changes so that ticks are linear within each piece.
//!
//! ```text
//! loop 0..1000, block 512, second block:
//!   [512 .. 1000)  offset 0,   len 488
//!   [0   .. 24)    offset 488, len 24
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::TransportError;
use crate::tempo::TempoMap;

/// Shortest accepted loop in samples.
pub const MIN_LOOP_SAMPLES: u64 = 64;

/// Most sub-blocks planned in one pass. Longer plans continue in another pass.
pub const MAX_SUB_BLOCKS: usize = 64;

/// Play state. Recording is a separate flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    /// Not rolling. Position is held.
    #[default]
    Stopped,
    /// Rolling.
    Playing,
    /// Not rolling, position held, resumes with `play`.
    Paused,
}

impl PlayState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Playing => 1,
            Self::Paused => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Playing,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// Half-open sample range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleRange {
    /// First sample.
    pub start: u64,
    /// One past the last sample.
    pub end: u64,
}

impl SampleRange {
    /// Creates a range.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length in samples.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True for an empty or reversed range.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True if `pos` lies inside.
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end
    }
}

/// Timeline information handed to nodes for one sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportInfo {
    /// Sample position of the first frame.
    pub position: u64,
    /// Tick position of the first frame.
    pub tick: f64,
    /// Ticks per sample, constant across the sub-block.
    pub ticks_per_sample: f64,
    /// Tempo in quarter notes per minute.
    pub bpm: f64,
    /// Beats per bar of the current meter.
    pub beats_per_bar: u8,
    /// Beat unit of the current meter.
    pub beat_unit: u8,
    /// True while the transport is playing.
    pub rolling: bool,
    /// True while input is being captured.
    pub capturing: bool,
}

/// Contiguous piece of a block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SubBlock {
    /// Frame offset inside the backend block.
    pub offset: usize,
    /// Number of frames.
    pub len: usize,
    /// Recording pass this piece belongs to when capturing.
    pub pass_id: u64,
    /// Timeline information.
    pub info: TransportInfo,
}

/// Planned split of a block, applied with [`Transport::commit`].
#[derive(Debug, Clone, Copy)]
pub struct BlockPlan {
    blocks: [SubBlock; MAX_SUB_BLOCKS],
    count: usize,
    frames: usize,
    end_position: u64,
    pass_id: u64,
    capturing: bool,
}

impl BlockPlan {
    /// Planned sub-blocks in order.
    pub fn sub_blocks(&self) -> &[SubBlock] {
        &self.blocks[..self.count]
    }

    /// Frames covered. Can be less than requested when the plan is full.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Position after the planned frames.
    pub fn end_position(&self) -> u64 {
        self.end_position
    }
}

/// Transport state machine.
#[derive(Debug, Clone)]
pub struct Transport {
    state: PlayState,
    recording: bool,
    position: u64,
    cue: u64,
    return_to_cue: bool,
    loop_range: SampleRange,
    loop_enabled: bool,
    punch_range: SampleRange,
    punch_enabled: bool,
    pass_id: u64,
    capturing: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Stopped transport at sample 0 with return-to-cue on.
    pub fn new() -> Self {
        Self {
            state: PlayState::Stopped,
            recording: false,
            position: 0,
            cue: 0,
            return_to_cue: true,
            loop_range: SampleRange::default(),
            loop_enabled: false,
            punch_range: SampleRange::default(),
            punch_enabled: false,
            pass_id: 0,
            capturing: false,
        }
    }

    /// Resets to a stopped state at sample 0 for a new session.
    ///
    /// Return-to-cue is a preference and survives the reset.
    pub fn reset(&mut self) {
        *self = Self {
            return_to_cue: self.return_to_cue,
            ..Self::new()
        };
    }

    /// Current play state.
    pub fn state(&self) -> PlayState {
        self.state
    }

    /// True if the record flag is set.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Current sample position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Cue point that `stop` returns to.
    pub fn cue(&self) -> u64 {
        self.cue
    }

    /// Latest recording pass id. 0 before the first pass.
    pub fn pass_id(&self) -> u64 {
        self.pass_id
    }

    /// Loop range and whether it is enabled.
    pub fn loop_range(&self) -> (SampleRange, bool) {
        (self.loop_range, self.loop_enabled)
    }

    /// Punch range and whether it is enabled.
    pub fn punch_range(&self) -> (SampleRange, bool) {
        (self.punch_range, self.punch_enabled)
    }

    /// Starts or resumes playback. Starting from stop sets the cue point.
    pub fn play(&mut self) {
        if self.state == PlayState::Stopped {
            self.cue = self.position;
        }
        self.state = PlayState::Playing;
    }

    /// Stops. Returns to the cue point unless return-to-cue is off.
    pub fn stop(&mut self) {
        self.state = PlayState::Stopped;
        self.capturing = false;
        if self.return_to_cue {
            self.position = self.cue;
        }
    }

    /// Pauses playback, holding the position.
    pub fn pause(&mut self) -> Result<(), TransportError> {
        if self.state != PlayState::Playing {
            return Err(TransportError::InvalidTransition {
                from: self.state,
                action: "pause",
            });
        }
        self.state = PlayState::Paused;
        Ok(())
    }

    /// Flips the record flag and returns the new value.
    pub fn toggle_record(&mut self) -> bool {
        self.recording = !self.recording;
        self.recording
    }

    /// Moves the playhead and the cue point.
    pub fn seek(&mut self, position: u64) -> Result<(), TransportError> {
        if self.recording && self.state == PlayState::Playing {
            return Err(TransportError::SeekWhileRecording);
        }
        self.position = position;
        self.cue = position;
        Ok(())
    }

    /// Sets the loop range.
    pub fn set_loop(&mut self, start: u64, end: u64) -> Result<(), TransportError> {
        validate_loop(start, end)?;
        self.loop_range = SampleRange::new(start, end);
        Ok(())
    }

    /// Enables or disables looping.
    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_enabled = enabled && !self.loop_range.is_empty();
    }

    /// Sets the punch range.
    pub fn set_punch(&mut self, start: u64, end: u64) -> Result<(), TransportError> {
        validate_punch(start, end)?;
        self.punch_range = SampleRange::new(start, end);
        Ok(())
    }

    /// Enables or disables punch recording.
    pub fn set_punch_enabled(&mut self, enabled: bool) {
        self.punch_enabled = enabled && !self.punch_range.is_empty();
    }

    /// Sets whether `stop` returns to the cue point.
    pub fn set_return_to_cue(&mut self, enabled: bool) {
        self.return_to_cue = enabled;
    }

    /// Applies a queued command.
    pub fn apply(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        match command {
            TransportCommand::Play => self.play(),
            TransportCommand::Stop => self.stop(),
            TransportCommand::Pause => self.pause()?,
            TransportCommand::SetRecording(on) => {
                if self.recording != on {
                    self.toggle_record();
                }
            }
            TransportCommand::Seek(pos) => self.seek(pos)?,
            TransportCommand::SetLoop { start, end } => self.set_loop(start, end)?,
            TransportCommand::SetLoopEnabled(on) => self.set_loop_enabled(on),
            TransportCommand::SetPunch { start, end } => self.set_punch(start, end)?,
            TransportCommand::SetPunchEnabled(on) => self.set_punch_enabled(on),
            TransportCommand::SetReturnToCue(on) => self.set_return_to_cue(on),
            TransportCommand::Reset => self.reset(),
        }
        Ok(())
    }

    /// Plans up to `frames` frames without changing state.
    ///
    /// While stopped or paused the whole request is one sub-block at the held
    /// position.
    pub fn plan(&self, frames: usize, tempo: &TempoMap) -> BlockPlan {
        let mut plan = BlockPlan {
            blocks: [SubBlock::default(); MAX_SUB_BLOCKS],
            count: 0,
            frames: 0,
            end_position: self.position,
            pass_id: self.pass_id,
            capturing: false,
        };
        if frames == 0 {
            plan.capturing = self.capturing;
            return plan;
        }

        if self.state != PlayState::Playing {
            plan.blocks[0] = SubBlock {
                offset: 0,
                len: frames,
                pass_id: self.pass_id,
                info: self.info_at(self.position, tempo, false, false),
            };
            plan.count = 1;
            plan.frames = frames;
            return plan;
        }

        let mut pos = self.position;
        let mut pass = self.pass_id;
        let mut capturing = self.capturing;
        let mut offset = 0usize;

        while offset < frames && plan.count < MAX_SUB_BLOCKS {
            let mut len = (frames - offset) as u64;

            let looping = self.loop_enabled && pos < self.loop_range.end;
            if looping {
                len = len.min(self.loop_range.end - pos);
            }
            if self.recording && self.punch_enabled {
                for edge in [self.punch_range.start, self.punch_range.end] {
                    if edge > pos {
                        len = len.min(edge - pos);
                    }
                }
            }
            if let Some(change) = tempo.next_tempo_change_after(pos) {
                len = len.min(change - pos);
            }

            let in_punch = !self.punch_enabled || self.punch_range.contains(pos);
            let capture = self.recording && in_punch;
            if capture && !capturing {
                pass += 1;
            }
            capturing = capture;

            plan.blocks[plan.count] = SubBlock {
                offset,
                len: len as usize,
                pass_id: pass,
                info: self.info_at(pos, tempo, true, capture),
            };
            plan.count += 1;

            pos += len;
            offset += len as usize;
            if looping && pos == self.loop_range.end {
                pos = self.loop_range.start;
                // Every loop pass is a separate take.
                if capturing {
                    pass += 1;
                }
            }
        }

        plan.frames = offset;
        plan.end_position = pos;
        plan.pass_id = pass;
        plan.capturing = capturing;
        plan
    }

    /// Applies a plan produced by [`plan`](Self::plan) on the current state.
    pub fn commit(&mut self, plan: &BlockPlan) {
        self.position = plan.end_position;
        self.pass_id = plan.pass_id;
        self.capturing = plan.capturing;
    }

    fn info_at(&self, pos: u64, tempo: &TempoMap, rolling: bool, capturing: bool) -> TransportInfo {
        let tick = tempo.samples_to_ticks(pos as f64);
        let sig = tempo.signature_at_tick(tick);
        TransportInfo {
            position: pos,
            tick,
            ticks_per_sample: tempo.ticks_per_sample_at(pos),
            bpm: tempo.bpm_at_sample(pos),
            beats_per_bar: sig.beats_per_bar,
            beat_unit: sig.beat_unit,
            rolling,
            capturing,
        }
    }
}

fn validate_loop(start: u64, end: u64) -> Result<(), TransportError> {
    if end <= start || end - start < MIN_LOOP_SAMPLES {
        return Err(TransportError::InvalidRange { start, end });
    }
    Ok(())
}

fn validate_punch(start: u64, end: u64) -> Result<(), TransportError> {
    if end <= start {
        return Err(TransportError::InvalidRange { start, end });
    }
    Ok(())
}

/// Transition queued from the edit side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    /// Start or resume.
    Play,
    /// Stop, returning to the cue point if enabled.
    Stop,
    /// Pause.
    Pause,
    /// Set the record flag.
    SetRecording(bool),
    /// Relocate the playhead and cue point.
    Seek(u64),
    /// Set the loop range.
    SetLoop {
        /// Loop start.
        start: u64,
        /// Loop end.
        end: u64,
    },
    /// Enable or disable looping.
    SetLoopEnabled(bool),
    /// Set the punch range.
    SetPunch {
        /// Punch in.
        start: u64,
        /// Punch out.
        end: u64,
    },
    /// Enable or disable punch.
    SetPunchEnabled(bool),
    /// Enable or disable return-to-cue.
    SetReturnToCue(bool),
    /// Reset for a new session.
    Reset,
}

/// State published by the real-time thread after each block.
#[derive(Debug, Default)]
pub(crate) struct TransportShared {
    state: AtomicU8,
    recording: AtomicBool,
    position: AtomicU64,
    tick_bits: AtomicU64,
    pass_id: AtomicU64,
    rejected: AtomicU64,
}

impl TransportShared {
    pub(crate) fn publish(&self, transport: &Transport, tempo: &TempoMap) {
        let tick = tempo.samples_to_ticks(transport.position as f64);
        self.state.store(transport.state.to_u8(), Ordering::Relaxed);
        self.recording.store(transport.recording, Ordering::Relaxed);
        self.tick_bits.store(tick.to_bits(), Ordering::Relaxed);
        self.pass_id.store(transport.pass_id, Ordering::Relaxed);
        self.position.store(transport.position, Ordering::Release);
    }

    pub(crate) fn note_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Published transport state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    /// Play state.
    pub state: PlayState,
    /// Record flag.
    pub recording: bool,
    /// Sample position.
    pub position: u64,
    /// Tick position derived from the tempo map.
    pub tick: f64,
    /// Latest recording pass id.
    pub pass_id: u64,
    /// Commands the real-time thread could not apply.
    pub rejected: u64,
}

/// Edit-side control of the transport.
///
/// Cloneable. Validates what it can before queueing; commands that race with
/// another handle and become invalid by the time they run are counted in
/// [`TransportSnapshot::rejected`].
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: Sender<TransportCommand>,
    shared: Arc<TransportShared>,
}

impl TransportHandle {
    /// Latest published state.
    pub fn snapshot(&self) -> TransportSnapshot {
        let position = self.shared.position.load(Ordering::Acquire);
        TransportSnapshot {
            state: PlayState::from_u8(self.shared.state.load(Ordering::Relaxed)),
            recording: self.shared.recording.load(Ordering::Relaxed),
            position,
            tick: f64::from_bits(self.shared.tick_bits.load(Ordering::Relaxed)),
            pass_id: self.shared.pass_id.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Starts or resumes playback.
    pub fn play(&self) -> Result<(), TransportError> {
        self.send(TransportCommand::Play)
    }

    /// Stops playback.
    pub fn stop(&self) -> Result<(), TransportError> {
        self.send(TransportCommand::Stop)
    }

    /// Pauses playback.
    pub fn pause(&self) -> Result<(), TransportError> {
        let state = self.snapshot().state;
        if state != PlayState::Playing {
            return Err(TransportError::InvalidTransition {
                from: state,
                action: "pause",
            });
        }
        self.send(TransportCommand::Pause)
    }

    /// Flips the record flag based on the last published state.
    pub fn toggle_record(&self) -> Result<bool, TransportError> {
        let on = !self.snapshot().recording;
        self.send(TransportCommand::SetRecording(on))?;
        Ok(on)
    }

    /// Sets the record flag.
    pub fn set_recording(&self, on: bool) -> Result<(), TransportError> {
        self.send(TransportCommand::SetRecording(on))
    }

    /// Moves the playhead and cue point.
    pub fn seek(&self, position: u64) -> Result<(), TransportError> {
        let snap = self.snapshot();
        if snap.recording && snap.state == PlayState::Playing {
            return Err(TransportError::SeekWhileRecording);
        }
        self.send(TransportCommand::Seek(position))
    }

    /// Sets the loop range.
    pub fn set_loop(&self, start: u64, end: u64) -> Result<(), TransportError> {
        validate_loop(start, end)?;
        self.send(TransportCommand::SetLoop { start, end })
    }

    /// Enables or disables looping.
    pub fn set_loop_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.send(TransportCommand::SetLoopEnabled(enabled))
    }

    /// Sets the punch range.
    pub fn set_punch(&self, start: u64, end: u64) -> Result<(), TransportError> {
        validate_punch(start, end)?;
        self.send(TransportCommand::SetPunch { start, end })
    }

    /// Enables or disables punch recording.
    pub fn set_punch_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.send(TransportCommand::SetPunchEnabled(enabled))
    }

    /// Sets whether `stop` returns to the cue point.
    pub fn set_return_to_cue(&self, enabled: bool) -> Result<(), TransportError> {
        self.send(TransportCommand::SetReturnToCue(enabled))
    }

    /// Resets for a new session.
    pub fn reset(&self) -> Result<(), TransportError> {
        self.send(TransportCommand::Reset)
    }

    fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => TransportError::QueueFull,
        })
    }
}

/// Real-time end of the command queue.
pub(crate) struct TransportInbox {
    rx: Receiver<TransportCommand>,
    shared: Arc<TransportShared>,
}

impl TransportInbox {
    /// Applies every queued command to `transport`.
    pub(crate) fn drain_into(&self, transport: &mut Transport) {
        while let Ok(command) = self.rx.try_recv() {
            if transport.apply(command).is_err() {
                self.shared.note_rejected();
            }
        }
    }

    pub(crate) fn shared(&self) -> &TransportShared {
        &self.shared
    }
}

/// Creates a connected handle and inbox.
pub(crate) fn transport_channel(capacity: usize) -> (TransportHandle, TransportInbox) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let shared = Arc::new(TransportShared::default());
    (
        TransportHandle {
            tx,
            shared: Arc::clone(&shared),
        },
        TransportInbox { rx, shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempo() -> TempoMap {
        TempoMap::new(48000.0, 120.0)
    }

    fn ranges(plan: &BlockPlan) -> Vec<(u64, u64, usize)> {
        plan.sub_blocks()
            .iter()
            .map(|b| (b.info.position, b.info.position + b.len as u64, b.offset))
            .collect()
    }

    #[test]
    fn play_stop_returns_to_cue() {
        let mut t = Transport::new();
        t.seek(100).unwrap();
        t.play();
        let plan = t.plan(512, &tempo());
        t.commit(&plan);
        assert_eq!(t.position(), 612);
        t.stop();
        assert_eq!(t.position(), 100);
        assert_eq!(t.state(), PlayState::Stopped);
    }

    #[test]
    fn stop_holds_without_return_to_cue() {
        let mut t = Transport::new();
        t.set_return_to_cue(false);
        t.play();
        let plan = t.plan(256, &tempo());
        t.commit(&plan);
        t.stop();
        assert_eq!(t.position(), 256);
    }

    #[test]
    fn pause_holds_and_resumes() {
        let mut t = Transport::new();
        assert!(t.pause().is_err());
        t.play();
        t.commit(&t.plan(100, &tempo()));
        t.pause().unwrap();
        let plan = t.plan(100, &tempo());
        assert!(!plan.sub_blocks()[0].info.rolling);
        t.commit(&plan);
        assert_eq!(t.position(), 100);
        t.play();
        // Resuming from pause keeps the original cue.
        assert_eq!(t.cue(), 0);
    }

    #[test]
    fn loop_wrap_splits_block() {
        let mut t = Transport::new();
        t.set_loop(0, 1000).unwrap();
        t.set_loop_enabled(true);
        t.play();

        let first = t.plan(512, &tempo());
        assert_eq!(ranges(&first), vec![(0, 512, 0)]);
        t.commit(&first);

        let second = t.plan(512, &tempo());
        // 488 frames up to the loop end, then the remaining 24 from the loop start.
        assert_eq!(ranges(&second), vec![(512, 1000, 0), (0, 24, 488)]);
        t.commit(&second);
        assert_eq!(t.position(), 24);
    }

    #[test]
    fn no_wrap_when_already_past_loop_end() {
        let mut t = Transport::new();
        t.set_loop(0, 1000).unwrap();
        t.set_loop_enabled(true);
        t.seek(2000).unwrap();
        t.play();
        let plan = t.plan(512, &tempo());
        assert_eq!(ranges(&plan), vec![(2000, 2512, 0)]);
    }

    #[test]
    fn short_loop_wraps_repeatedly() {
        let mut t = Transport::new();
        t.set_loop(100, 164).unwrap();
        t.set_loop_enabled(true);
        t.seek(100).unwrap();
        t.play();
        let plan = t.plan(200, &tempo());
        assert_eq!(
            ranges(&plan),
            vec![(100, 164, 0), (100, 164, 64), (100, 164, 128), (100, 108, 192)]
        );
        assert_eq!(plan.frames(), 200);
    }

    #[test]
    fn loop_shorter_than_minimum_rejected() {
        let mut t = Transport::new();
        assert_eq!(
            t.set_loop(0, 10),
            Err(TransportError::InvalidRange { start: 0, end: 10 })
        );
    }

    #[test]
    fn seek_refused_while_recording() {
        let mut t = Transport::new();
        t.toggle_record();
        t.play();
        assert_eq!(t.seek(10), Err(TransportError::SeekWhileRecording));
        t.stop();
        assert!(t.seek(10).is_ok());
    }

    #[test]
    fn punch_splits_and_gates_capture() {
        let mut t = Transport::new();
        t.set_punch(100, 300).unwrap();
        t.set_punch_enabled(true);
        t.toggle_record();
        t.play();
        let plan = t.plan(512, &tempo());
        let blocks = plan.sub_blocks();
        assert_eq!(ranges(&plan), vec![(0, 100, 0), (100, 300, 100), (300, 512, 300)]);
        assert!(!blocks[0].info.capturing);
        assert!(blocks[1].info.capturing);
        assert!(!blocks[2].info.capturing);
        assert_eq!(blocks[1].pass_id, 1);
    }

    #[test]
    fn pass_id_increments_per_loop_while_recording() {
        let mut t = Transport::new();
        t.set_loop(0, 1000).unwrap();
        t.set_loop_enabled(true);
        t.toggle_record();
        t.play();
        t.commit(&t.plan(512, &tempo()));
        assert_eq!(t.pass_id(), 1);
        let plan = t.plan(512, &tempo());
        let ids: Vec<u64> = plan.sub_blocks().iter().map(|b| b.pass_id).collect();
        assert_eq!(ids, vec![1, 2]);
        t.commit(&plan);
        assert_eq!(t.pass_id(), 2);
    }

    #[test]
    fn tempo_change_splits_block() {
        let mut map = tempo();
        // 960 ticks at 120 BPM = 24000 samples.
        map.set_tempo(960, 60.0).unwrap();
        let mut t = Transport::new();
        t.seek(23900).unwrap();
        t.play();
        let plan = t.plan(256, &map);
        assert_eq!(ranges(&plan), vec![(23900, 24000, 0), (24000, 24156, 100)]);
        assert_eq!(plan.sub_blocks()[0].info.bpm, 120.0);
        assert_eq!(plan.sub_blocks()[1].info.bpm, 60.0);
    }

    #[test]
    fn stopped_plan_is_single_block() {
        let t = Transport::new();
        let plan = t.plan(128, &tempo());
        assert_eq!(plan.sub_blocks().len(), 1);
        assert!(!plan.sub_blocks()[0].info.rolling);
        assert_eq!(plan.end_position(), 0);
    }

    #[test]
    fn reset_keeps_return_to_cue() {
        let mut t = Transport::new();
        t.set_return_to_cue(false);
        t.seek(500).unwrap();
        t.toggle_record();
        t.reset();
        assert_eq!(t.position(), 0);
        assert!(!t.is_recording());
        t.play();
        t.commit(&t.plan(10, &tempo()));
        t.stop();
        assert_eq!(t.position(), 10);
    }

    #[test]
    fn handle_queues_and_inbox_applies() {
        let (handle, inbox) = transport_channel(8);
        let mut t = Transport::new();
        handle.seek(48).unwrap();
        handle.play().unwrap();
        inbox.drain_into(&mut t);
        assert_eq!(t.state(), PlayState::Playing);
        assert_eq!(t.position(), 48);

        inbox.shared().publish(&t, &tempo());
        let snap = handle.snapshot();
        assert_eq!(snap.state, PlayState::Playing);
        assert_eq!(snap.position, 48);
        assert!(snap.tick > 0.0);
    }

    #[test]
    fn handle_rejects_invalid_requests_early() {
        let (handle, _inbox) = transport_channel(8);
        assert!(matches!(
            handle.pause(),
            Err(TransportError::InvalidTransition { .. })
        ));
        assert!(handle.set_loop(10, 20).is_err());
        assert!(handle.set_punch(20, 10).is_err());
    }

    #[test]
    fn full_queue_reports() {
        let (handle, _inbox) = transport_channel(1);
        handle.play().unwrap();
        assert_eq!(handle.stop(), Err(TransportError::QueueFull));
    }

    #[test]
    fn rejected_commands_are_counted() {
        let (handle, inbox) = transport_channel(8);
        let mut t = Transport::new();
        handle.set_recording(true).unwrap();
        handle.play().unwrap();
        inbox.drain_into(&mut t);
        inbox.shared().publish(&t, &tempo());
        // Queued directly, bypassing the handle's early check.
        handle.send(TransportCommand::Seek(5)).unwrap();
        inbox.drain_into(&mut t);
        inbox.shared().publish(&t, &tempo());
        assert_eq!(handle.snapshot().rejected, 1);
        assert_eq!(t.position(), 0);
    }
}
