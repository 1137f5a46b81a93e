//! Recording capture.
//!
//! While the transport is capturing, every record-armed node copies the
//! signal it sees into lock-free `rtrb` rings. Input nodes are tapped at their
//! outputs; every other node at its inputs. The edit side drains the rings
//! with a [`Recorder`] and turns them into [`RecordedRegion`]s once a pass
//! ends.
//!
//! # Segments
//!
//! Each processed sub-block becomes one segment: planar samples, then events,
//! then a header carrying the pass id and timeline position. The header is
//! pushed last, so a consumer that sees it always finds the data. A segment
//! that does not fit is dropped whole and counted as an overrun.
//!
//! # Passes and modes
//!
//! A new pass starts whenever capture begins and on every loop wrap, so each
//! loop iteration is its own take. Audio always yields one region per pass.
//! Event regions follow the [`RecordingMode`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use crate::buffer::{Event, PortBuffer};
use crate::error::StructuralError;
use crate::graph::Graph;
use crate::id::NodeId;
use crate::transport::SubBlock;

/// How overlapping passes on the same node are materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Later passes replace earlier events inside their range. Earlier audio
    /// takes are muted.
    OverwriteEvents,
    /// Events of overlapping passes are merged into one region.
    #[default]
    MergeEvents,
    /// Every pass is its own region.
    Takes,
    /// Every pass is its own region; all but the last are muted.
    TakesMuted,
}

#[derive(Debug, Clone, Copy)]
struct SegmentHeader {
    pass_id: u64,
    position: u64,
    tick: f64,
    frames: u32,
    channels: u16,
    events: u32,
}

/// Real-time end of a capture, installed on an armed node.
pub struct CaptureTap {
    from_outputs: bool,
    audio: Vec<usize>,
    events: Vec<usize>,
    headers: Producer<SegmentHeader>,
    samples: Producer<f32>,
    event_data: Producer<Event>,
    overruns: Arc<AtomicU64>,
}

impl CaptureTap {
    /// True if the tap records the node's outputs rather than its inputs.
    #[inline]
    pub(crate) fn from_outputs(&self) -> bool {
        self.from_outputs
    }

    /// Copies one sub-block. Never blocks or allocates.
    pub(crate) fn capture(&mut self, ports: &[PortBuffer], sub: &SubBlock) {
        let len = sub.len;
        let channels = self.audio.len();
        let event_count: usize = self
            .events
            .iter()
            .filter_map(|&slot| ports.get(slot).and_then(PortBuffer::events))
            .map(|e| e.before(len).len())
            .sum();
        if self.headers.slots() == 0
            || self.samples.slots() < len * channels
            || self.event_data.slots() < event_count
        {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for &slot in &self.audio {
            let signal = ports.get(slot).and_then(PortBuffer::signal);
            for i in 0..len {
                let sample = signal.and_then(|s| s.get(i)).copied().unwrap_or(0.0);
                let _ = self.samples.push(sample);
            }
        }
        for &slot in &self.events {
            if let Some(events) = ports.get(slot).and_then(PortBuffer::events) {
                for event in events.before(len) {
                    let _ = self.event_data.push(*event);
                }
            }
        }
        let _ = self.headers.push(SegmentHeader {
            pass_id: sub.pass_id,
            position: sub.info.position,
            tick: sub.info.tick,
            frames: len as u32,
            channels: channels as u16,
            events: event_count as u32,
        });
    }
}

impl core::fmt::Debug for CaptureTap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CaptureTap")
            .field("from_outputs", &self.from_outputs)
            .field("audio", &self.audio)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

struct Sink {
    node: NodeId,
    has_events: bool,
    sample_rate: f64,
    headers: Consumer<SegmentHeader>,
    samples: Consumer<f32>,
    events: Consumer<Event>,
    overruns: Arc<AtomicU64>,
}

/// Event with its offset from the start of its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    /// Frames from region start.
    pub offset: u64,
    /// The event. Its `frame` field is not meaningful here.
    pub event: Event,
}

/// Data of a recorded region.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionContent {
    /// Planar audio, one vector per channel.
    Audio(Vec<Vec<f32>>),
    /// Events in time order.
    Events(Vec<TimedEvent>),
}

/// A materialised recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRegion {
    /// Recorded node.
    pub node: NodeId,
    /// Pass that produced the region (the last one for merged regions).
    pub pass_id: u64,
    /// Timeline position of the first frame.
    pub start_sample: u64,
    /// Musical position of the first frame.
    pub start_tick: f64,
    /// Length in frames.
    pub frames: u64,
    /// Sample rate of the audio.
    pub sample_rate: f64,
    /// Recorded data.
    pub content: RegionContent,
    /// Muted takes stay in the arrangement but are silent.
    pub muted: bool,
}

impl RecordedRegion {
    /// Timeline position one past the last frame.
    pub fn end_sample(&self) -> u64 {
        self.start_sample + self.frames
    }

    /// Audio channels, if this is an audio region.
    pub fn audio(&self) -> Option<&[Vec<f32>]> {
        match &self.content {
            RegionContent::Audio(channels) => Some(channels),
            RegionContent::Events(_) => None,
        }
    }

    /// Events, if this is an event region.
    pub fn events(&self) -> Option<&[TimedEvent]> {
        match &self.content {
            RegionContent::Events(events) => Some(events),
            RegionContent::Audio(_) => None,
        }
    }
}

/// One pass on one node, being assembled.
#[derive(Debug)]
struct Take {
    node: NodeId,
    pass_id: u64,
    start_sample: u64,
    start_tick: f64,
    sample_rate: f64,
    frames: u64,
    audio: Vec<Vec<f32>>,
    events: Vec<TimedEvent>,
    has_events: bool,
}

impl Take {
    fn end(&self) -> u64 {
        self.start_sample + self.frames
    }
}

/// Edit-side end of recording capture.
#[derive(Default)]
pub struct Recorder {
    sinks: Vec<Sink>,
    open: BTreeMap<NodeId, Take>,
    finished: Vec<Take>,
}

impl Recorder {
    /// Creates a recorder with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `node`, buffering up to `seconds` of audio between drains.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node does not exist,
    /// [`StructuralError::InvalidParameter`] for a non-positive duration.
    pub fn arm(&mut self, graph: &Graph, node: NodeId, seconds: f64) -> Result<(), StructuralError> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(StructuralError::InvalidParameter(format!(
                "record buffer of {seconds} s"
            )));
        }
        let (from_outputs, audio, events) = graph.capture_ports(node)?;
        if self.sinks.iter().any(|s| s.node == node) {
            self.disarm(graph, node)?;
        }

        let frames = ((seconds * graph.sample_rate()).ceil() as usize).max(graph.max_block() * 4);
        let (headers_tx, headers_rx) = RingBuffer::new((frames / 32).max(256));
        let (samples_tx, samples_rx) = RingBuffer::new((frames * audio.len()).max(1));
        let (events_tx, events_rx) = RingBuffer::new(graph.event_capacity() * 64);
        let overruns = Arc::new(AtomicU64::new(0));
        let has_events = !events.is_empty();

        let tap = CaptureTap {
            from_outputs,
            audio,
            events,
            headers: headers_tx,
            samples: samples_tx,
            event_data: events_tx,
            overruns: Arc::clone(&overruns),
        };
        // The previous tap, if any, is dropped here on the edit thread.
        drop(graph.set_capture(node, Some(tap))?);
        self.sinks.push(Sink {
            node,
            has_events,
            sample_rate: graph.sample_rate(),
            headers: headers_rx,
            samples: samples_rx,
            events: events_rx,
            overruns,
        });
        tracing::debug!("record_arm: {node} ({seconds} s buffer)");
        Ok(())
    }

    /// Disarms `node`, keeping what was already captured.
    ///
    /// # Errors
    ///
    /// [`StructuralError::UnknownId`] if the node is not in the graph.
    pub fn disarm(&mut self, graph: &Graph, node: NodeId) -> Result<(), StructuralError> {
        if graph.contains_node(node) {
            drop(graph.set_capture(node, None)?);
        }
        self.drain();
        let Some(pos) = self.sinks.iter().position(|s| s.node == node) else {
            return Err(StructuralError::UnknownId(node.into()));
        };
        self.sinks.remove(pos);
        if let Some(take) = self.open.remove(&node) {
            self.finished.push(take);
        }
        tracing::debug!("record_disarm: {node}");
        Ok(())
    }

    /// True if `node` is armed through this recorder.
    pub fn is_armed(&self, node: NodeId) -> bool {
        self.sinks.iter().any(|s| s.node == node)
    }

    /// Moves captured segments out of the rings. Returns the number of segments.
    pub fn drain(&mut self) -> usize {
        let mut segments = 0;
        for sink in &mut self.sinks {
            while let Ok(header) = sink.headers.pop() {
                segments += 1;
                let same_pass = self
                    .open
                    .get(&sink.node)
                    .is_some_and(|t| t.pass_id == header.pass_id);
                if !same_pass {
                    if let Some(done) = self.open.remove(&sink.node) {
                        self.finished.push(done);
                    }
                    self.open.insert(
                        sink.node,
                        Take {
                            node: sink.node,
                            pass_id: header.pass_id,
                            start_sample: header.position,
                            start_tick: header.tick,
                            sample_rate: sink.sample_rate,
                            frames: 0,
                            audio: vec![Vec::new(); usize::from(header.channels)],
                            events: Vec::new(),
                            has_events: sink.has_events,
                        },
                    );
                }
                let Some(take) = self.open.get_mut(&sink.node) else {
                    continue;
                };

                // Dropped segments leave a gap; fill it with silence.
                let offset = header.position.saturating_sub(take.start_sample);
                if offset > take.frames {
                    let gap = (offset - take.frames) as usize;
                    for channel in &mut take.audio {
                        channel.resize(channel.len() + gap, 0.0);
                    }
                    take.frames = offset;
                }
                for channel in &mut take.audio {
                    for _ in 0..header.frames {
                        channel.push(sink.samples.pop().unwrap_or(0.0));
                    }
                }
                for _ in 0..header.events {
                    if let Ok(event) = sink.events.pop() {
                        take.events.push(TimedEvent {
                            offset: take.frames + u64::from(event.frame),
                            event,
                        });
                    }
                }
                take.frames += u64::from(header.frames);
            }
        }
        segments
    }

    /// Closes every open pass. Call after capture stops.
    pub fn finish_pass(&mut self) {
        self.drain();
        let open = core::mem::take(&mut self.open);
        self.finished.extend(open.into_values());
    }

    /// Passes completed and not yet taken.
    pub fn finished_passes(&self) -> usize {
        self.finished.len()
    }

    /// Segments dropped because a ring was full.
    pub fn overruns(&self) -> u64 {
        self.sinks
            .iter()
            .map(|s| s.overruns.load(Ordering::Relaxed))
            .sum()
    }

    /// Materialises completed passes as regions and forgets them.
    pub fn take_regions(&mut self, mode: RecordingMode) -> Vec<RecordedRegion> {
        let mut takes = core::mem::take(&mut self.finished);
        takes.sort_by_key(|t| (t.node, t.pass_id));
        let mut regions = Vec::new();

        let mut start = 0;
        while start < takes.len() {
            let node = takes[start].node;
            let end = takes[start..]
                .iter()
                .position(|t| t.node != node)
                .map_or(takes.len(), |n| start + n);
            materialise(&takes[start..end], mode, &mut regions);
            start = end;
        }
        regions
    }
}

/// Regions for the passes of one node, in pass order.
fn materialise(takes: &[Take], mode: RecordingMode, out: &mut Vec<RecordedRegion>) {
    let last = takes.len().saturating_sub(1);
    let mute_earlier_audio = matches!(mode, RecordingMode::TakesMuted | RecordingMode::OverwriteEvents);

    for (i, take) in takes.iter().enumerate() {
        if !take.audio.is_empty() {
            out.push(RecordedRegion {
                node: take.node,
                pass_id: take.pass_id,
                start_sample: take.start_sample,
                start_tick: take.start_tick,
                frames: take.frames,
                sample_rate: take.sample_rate,
                content: RegionContent::Audio(take.audio.clone()),
                muted: mute_earlier_audio && i < last,
            });
        }
    }

    let event_takes: Vec<&Take> = takes.iter().filter(|t| t.has_events).collect();
    match mode {
        RecordingMode::Takes | RecordingMode::TakesMuted => {
            let last = event_takes.len().saturating_sub(1);
            for (i, take) in event_takes.iter().enumerate() {
                out.push(event_region(take, mode == RecordingMode::TakesMuted && i < last));
            }
        }
        RecordingMode::MergeEvents | RecordingMode::OverwriteEvents => {
            let overwrite = mode == RecordingMode::OverwriteEvents;
            let mut merged: Vec<RecordedRegion> = Vec::new();
            for take in event_takes {
                let (start, end) = (take.start_sample, take.end());
                // Every region the pass touches collapses into one.
                let (overlapping, rest): (Vec<_>, Vec<_>) = merged
                    .into_iter()
                    .partition(|r| r.start_sample < end && start < r.end_sample());
                merged = rest;
                let mut region = event_region(take, false);
                if overlapping.is_empty() {
                    merged.push(region);
                    continue;
                }
                let mut new_end = end;
                let mut events: Vec<(u64, Event)> = Vec::new();
                for earlier in &overlapping {
                    if earlier.start_sample < region.start_sample {
                        region.start_sample = earlier.start_sample;
                        region.start_tick = earlier.start_tick;
                    }
                    new_end = new_end.max(earlier.end_sample());
                    events.extend(
                        earlier
                            .events()
                            .unwrap_or_default()
                            .iter()
                            .map(|e| (earlier.start_sample + e.offset, e.event))
                            .filter(|(at, _)| !overwrite || *at < start || *at >= end),
                    );
                }
                events.extend(take.events.iter().map(|e| (start + e.offset, e.event)));
                // Stable: earlier passes stay first on equal positions.
                events.sort_by_key(|(at, _)| *at);
                let new_start = region.start_sample;
                region.frames = new_end - new_start;
                region.content = RegionContent::Events(
                    events
                        .into_iter()
                        .map(|(at, event)| TimedEvent {
                            offset: at - new_start,
                            event,
                        })
                        .collect(),
                );
                merged.push(region);
            }
            merged.sort_by_key(|r| r.start_sample);
            out.extend(merged);
        }
    }
}

fn event_region(take: &Take, muted: bool) -> RecordedRegion {
    RecordedRegion {
        node: take.node,
        pass_id: take.pass_id,
        start_sample: take.start_sample,
        start_tick: take.start_tick,
        frames: take.frames,
        sample_rate: take.sample_rate,
        content: RegionContent::Events(take.events.clone()),
        muted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use crate::transport::TransportInfo;

    fn sub(position: u64, len: usize, pass_id: u64) -> SubBlock {
        SubBlock {
            offset: 0,
            len,
            pass_id,
            info: TransportInfo {
                position,
                capturing: true,
                rolling: true,
                ..TransportInfo::default()
            },
        }
    }

    fn tap(audio_channels: usize, with_events: bool, frames: usize) -> (CaptureTap, Sink) {
        let (headers_tx, headers_rx) = RingBuffer::new(64);
        let (samples_tx, samples_rx) = RingBuffer::new(frames);
        let (events_tx, events_rx) = RingBuffer::new(64);
        let overruns = Arc::new(AtomicU64::new(0));
        let mut arena = crate::id::Arena::new();
        let node = NodeId(arena.insert(()));
        let events = if with_events { vec![audio_channels] } else { Vec::new() };
        (
            CaptureTap {
                from_outputs: false,
                audio: (0..audio_channels).collect(),
                events,
                headers: headers_tx,
                samples: samples_tx,
                event_data: events_tx,
                overruns: Arc::clone(&overruns),
            },
            Sink {
                node,
                has_events: with_events,
                sample_rate: 48000.0,
                headers: headers_rx,
                samples: samples_rx,
                events: events_rx,
                overruns,
            },
        )
    }

    fn recorder(sink: Sink) -> Recorder {
        let mut r = Recorder::new();
        r.sinks.push(sink);
        r
    }

    #[test]
    fn capture_and_drain_contiguous_pass() {
        let (mut tap, sink) = tap(1, false, 64);
        let ports = vec![PortBuffer::Signal(vec![0.5; 8])];
        tap.capture(&ports, &sub(100, 8, 1));
        tap.capture(&ports, &sub(108, 4, 1));
        let mut r = recorder(sink);
        assert_eq!(r.drain(), 2);
        r.finish_pass();
        let regions = r.take_regions(RecordingMode::Takes);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_sample, 100);
        assert_eq!(regions[0].frames, 12);
        assert_eq!(regions[0].audio().unwrap()[0].len(), 12);
    }

    #[test]
    fn overrun_drops_whole_segment() {
        let (mut tap, sink) = tap(2, false, 10);
        let ports = vec![PortBuffer::Signal(vec![1.0; 8]), PortBuffer::Signal(vec![1.0; 8])];
        tap.capture(&ports, &sub(0, 4, 1));
        // 8 more samples do not fit in the remaining 2.
        tap.capture(&ports, &sub(4, 4, 1));
        let mut r = recorder(sink);
        assert_eq!(r.overruns(), 1);
        assert_eq!(r.drain(), 1);
    }

    #[test]
    fn each_pass_is_a_new_audio_region() {
        let (mut tap, sink) = tap(1, false, 64);
        let ports = vec![PortBuffer::Signal(vec![0.25; 8])];
        tap.capture(&ports, &sub(0, 8, 1));
        tap.capture(&ports, &sub(0, 8, 2));
        let mut r = recorder(sink);
        r.finish_pass();
        let regions = r.take_regions(RecordingMode::TakesMuted);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].muted);
        assert!(!regions[1].muted);

        let (mut tap, sink) = self::tap(1, false, 64);
        tap.capture(&ports, &sub(0, 8, 1));
        tap.capture(&ports, &sub(0, 8, 2));
        let mut r = recorder(sink);
        r.finish_pass();
        let merged = r.take_regions(RecordingMode::MergeEvents);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|region| !region.muted));
    }

    fn event_ports(note: u8, frame: u32) -> Vec<PortBuffer> {
        let mut events = EventBuffer::with_capacity(4);
        events.push(Event::note_on(frame, 0, note, 100));
        vec![PortBuffer::Events(events)]
    }

    #[test]
    fn merge_and_overwrite_events() {
        for (mode, expected) in [
            (RecordingMode::MergeEvents, vec![60, 62]),
            (RecordingMode::OverwriteEvents, vec![62]),
        ] {
            let (mut tap, sink) = tap(0, true, 1);
            tap.capture(&event_ports(60, 2), &sub(0, 16, 1));
            tap.capture(&event_ports(62, 5), &sub(0, 16, 2));
            let mut r = recorder(sink);
            r.finish_pass();
            let regions = r.take_regions(mode);
            assert_eq!(regions.len(), 1, "{mode:?}");
            let notes: Vec<u8> = regions[0]
                .events()
                .unwrap()
                .iter()
                .map(|e| e.event.data[1])
                .collect();
            assert_eq!(notes, expected, "{mode:?}");
            assert_eq!(regions[0].pass_id, 2);
        }
    }

    #[test]
    fn pass_spanning_two_regions_joins_them() {
        for (mode, expected) in [
            (RecordingMode::MergeEvents, vec![60, 62, 61]),
            (RecordingMode::OverwriteEvents, vec![60, 62]),
        ] {
            let (mut tap, sink) = tap(0, true, 1);
            tap.capture(&event_ports(60, 2), &sub(0, 16, 1));
            tap.capture(&event_ports(61, 3), &sub(32, 16, 2));
            tap.capture(&event_ports(62, 0), &sub(8, 32, 3));
            let mut r = recorder(sink);
            r.finish_pass();
            let regions = r.take_regions(mode);
            assert_eq!(regions.len(), 1, "{mode:?}");
            assert_eq!(regions[0].start_sample, 0);
            assert_eq!(regions[0].frames, 48);
            assert_eq!(regions[0].pass_id, 3);
            let notes: Vec<u8> = regions[0]
                .events()
                .unwrap()
                .iter()
                .map(|e| e.event.data[1])
                .collect();
            assert_eq!(notes, expected, "{mode:?}");
        }
    }

    #[test]
    fn takes_keep_event_passes_apart() {
        let (mut tap, sink) = tap(0, true, 1);
        tap.capture(&event_ports(60, 2), &sub(0, 16, 1));
        tap.capture(&event_ports(62, 5), &sub(0, 16, 2));
        let mut r = recorder(sink);
        r.finish_pass();
        let regions = r.take_regions(RecordingMode::Takes);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].events().unwrap()[0].offset, 5);
    }
}
