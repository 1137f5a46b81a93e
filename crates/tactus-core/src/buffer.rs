//! Port buffers and compensation delay lines.
//!
//! Every port owns one [`PortBuffer`], allocated once at the engine's maximum
//! block size and reused for every block. A sub-block processes a prefix of it.
//!
//! [`SignalDelay`] and [`EventDelay`] are fixed-delay lines inserted by the
//! compiler on connections whose source arrives earlier than the longest path
//! into the same destination.

/// Fixed-size MIDI-style message stamped with a frame offset inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Frame offset from the start of the (sub-)block.
    pub frame: u32,
    /// Raw message bytes. Only the first `len` bytes are meaningful.
    pub data: [u8; 3],
    /// Number of valid bytes in `data`.
    pub len: u8,
}

impl Event {
    /// Three-byte channel message.
    pub fn midi(frame: u32, data: [u8; 3]) -> Self {
        Self {
            frame,
            data,
            len: 3,
        }
    }

    /// Note-on on `channel` (0-15).
    pub fn note_on(frame: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::midi(frame, [0x90 | (channel & 0x0f), note & 0x7f, velocity & 0x7f])
    }

    /// Note-off on `channel` (0-15).
    pub fn note_off(frame: u32, channel: u8, note: u8) -> Self {
        Self::midi(frame, [0x80 | (channel & 0x0f), note & 0x7f, 0])
    }

    /// Valid message bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.len.min(3))]
    }

    /// Copy of this event moved to another frame.
    #[inline]
    pub fn at(self, frame: u32) -> Self {
        Self { frame, ..self }
    }
}

/// Fixed-capacity, frame-ordered event list.
///
/// Capacity is reserved at construction and never grows, so inserting on the
/// processing path does not allocate. Events past capacity are dropped and
/// counted.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: Vec<Event>,
    capacity: usize,
    dropped: u32,
}

impl EventBuffer {
    /// Creates an empty buffer holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Inserts an event after any existing events on the same frame.
    ///
    /// Returns `false` and counts the drop if the buffer is full.
    pub fn push(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            return false;
        }
        let pos = self.events.partition_point(|e| e.frame <= event.frame);
        self.events.insert(pos, event);
        true
    }

    /// Merges all events from `other`, shifted by `offset` frames.
    ///
    /// Ties keep existing events first, so merging sources one after another
    /// yields frame order, then source order.
    pub fn merge_from(&mut self, other: &EventBuffer, offset: u32) {
        for event in &other.events {
            self.push(event.at(event.frame.saturating_add(offset)));
        }
    }

    /// Removes all events. The drop counter is kept.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Events in frame order.
    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }

    /// Iterator over events in frame order.
    pub fn iter(&self) -> core::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// Events before `frames`.
    pub fn before(&self, frames: usize) -> &[Event] {
        let end = self.events.partition_point(|e| (e.frame as usize) < frames);
        &self.events[..end]
    }

    /// Number of events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if no events are held.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped since the last [`take_dropped`](Self::take_dropped).
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Returns and resets the drop counter.
    pub fn take_dropped(&mut self) -> u32 {
        core::mem::take(&mut self.dropped)
    }
}

/// Buffer behind one port.
#[derive(Debug, Clone)]
pub enum PortBuffer {
    /// Mono `f32` samples (audio, CV, control).
    Signal(Vec<f32>),
    /// Frame-stamped events.
    Events(EventBuffer),
}

impl PortBuffer {
    /// Allocates a buffer for a port of `kind`.
    pub fn for_kind(kind: crate::PortKind, frames: usize, event_capacity: usize) -> Self {
        if kind.is_signal() {
            Self::Signal(vec![0.0; frames])
        } else {
            Self::Events(EventBuffer::with_capacity(event_capacity))
        }
    }

    /// Full signal buffer, or `None` for event ports.
    #[inline]
    pub fn signal(&self) -> Option<&[f32]> {
        match self {
            Self::Signal(samples) => Some(samples),
            Self::Events(_) => None,
        }
    }

    /// Mutable signal buffer, or `None` for event ports.
    #[inline]
    pub fn signal_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Self::Signal(samples) => Some(samples),
            Self::Events(_) => None,
        }
    }

    /// Event buffer, or `None` for signal ports.
    #[inline]
    pub fn events(&self) -> Option<&EventBuffer> {
        match self {
            Self::Events(events) => Some(events),
            Self::Signal(_) => None,
        }
    }

    /// Mutable event buffer, or `None` for signal ports.
    #[inline]
    pub fn events_mut(&mut self) -> Option<&mut EventBuffer> {
        match self {
            Self::Events(events) => Some(events),
            Self::Signal(_) => None,
        }
    }

    /// Zeroes the first `frames` samples, or drops all events.
    #[inline]
    pub fn clear(&mut self, frames: usize) {
        match self {
            Self::Signal(samples) => {
                let n = frames.min(samples.len());
                samples[..n].fill(0.0);
            }
            Self::Events(events) => events.clear(),
        }
    }

    /// Frames this buffer can hold. Event buffers are not frame-bounded.
    pub fn frames(&self) -> usize {
        match self {
            Self::Signal(samples) => samples.len(),
            Self::Events(_) => usize::MAX,
        }
    }

    /// Reallocates a signal buffer to `frames` zeroed samples.
    pub fn resize(&mut self, frames: usize) {
        if let Self::Signal(samples) = self {
            samples.clear();
            samples.resize(frames, 0.0);
        }
    }

    /// Copies like-kinded content from `other` for the first `frames` frames.
    pub fn copy_from(&mut self, other: &PortBuffer, frames: usize) {
        match (self, other) {
            (Self::Signal(dst), Self::Signal(src)) => {
                let n = frames.min(dst.len()).min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
            (Self::Events(dst), Self::Events(src)) => {
                dst.clear();
                dst.merge_from(src, 0);
            }
            _ => {}
        }
    }
}

/// Adds `src * gain` into `dst`.
#[inline]
pub fn accumulate(dst: &mut [f32], src: &[f32], gain: f32) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s * gain;
    }
}

/// Fixed-delay mono ring buffer for latency compensation.
///
/// When parallel paths into a summing input have different latencies, the
/// shorter ones are delayed so every signal arrives time-aligned.
#[derive(Debug, Clone)]
pub struct SignalDelay {
    buffer: Vec<f32>,
    write_pos: usize,
    delay_samples: usize,
}

impl SignalDelay {
    /// Creates a delay line. A delay of 0 is a no-op.
    pub fn new(delay_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; delay_samples.max(1)],
            write_pos: 0,
            delay_samples,
        }
    }

    /// Delay in samples.
    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    /// Pushes one sample and returns the sample from `delay_samples` ago.
    #[inline]
    pub fn tick(&mut self, input: f32) -> f32 {
        if self.delay_samples == 0 {
            return input;
        }
        let out = self.buffer[self.write_pos];
        self.buffer[self.write_pos] = input;
        self.write_pos = (self.write_pos + 1) % self.delay_samples;
        out
    }

    /// Delays a block in place.
    pub fn process_inplace(&mut self, block: &mut [f32]) {
        if self.delay_samples == 0 {
            return;
        }
        for sample in block.iter_mut() {
            *sample = self.tick(*sample);
        }
    }

    /// Clears the delay line to silence.
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}

/// Fixed-delay line for event connections.
///
/// Pending events keep frames relative to the start of the next block; each
/// block emits those that fall inside it and rebases the rest.
#[derive(Debug, Clone)]
pub struct EventDelay {
    pending: Vec<Event>,
    capacity: usize,
    delay_samples: u32,
    dropped: u32,
}

impl EventDelay {
    /// Creates an event delay holding up to `capacity` in-flight events.
    pub fn new(delay_samples: u32, capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            delay_samples,
            dropped: 0,
        }
    }

    /// Delay in samples.
    pub fn delay_samples(&self) -> u32 {
        self.delay_samples
    }

    /// Delays `input` events of a block of `frames` and merges due events into `out`.
    pub fn process(&mut self, input: &EventBuffer, frames: usize, out: &mut EventBuffer) {
        for event in input.before(frames) {
            if self.pending.len() >= self.capacity {
                self.dropped = self.dropped.saturating_add(1);
                continue;
            }
            self.pending
                .push(event.at(event.frame.saturating_add(self.delay_samples)));
        }
        let frames = frames as u32;
        for event in &self.pending {
            if event.frame < frames {
                out.push(*event);
            }
        }
        self.pending.retain_mut(|event| {
            if event.frame < frames {
                false
            } else {
                event.frame -= frames;
                true
            }
        });
    }

    /// Number of events dropped for lack of capacity.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Drops all pending events.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortKind;

    #[test]
    fn event_buffer_keeps_frame_order() {
        let mut buf = EventBuffer::with_capacity(8);
        buf.push(Event::note_on(10, 0, 60, 100));
        buf.push(Event::note_on(2, 0, 61, 100));
        buf.push(Event::note_on(10, 0, 62, 100));
        let frames: Vec<u32> = buf.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![2, 10, 10]);
        // Same-frame events keep arrival order.
        assert_eq!(buf.as_slice()[1].data[1], 60);
        assert_eq!(buf.as_slice()[2].data[1], 62);
    }

    #[test]
    fn event_buffer_overflow_counts() {
        let mut buf = EventBuffer::with_capacity(2);
        assert!(buf.push(Event::note_on(0, 0, 1, 1)));
        assert!(buf.push(Event::note_on(0, 0, 2, 1)));
        assert!(!buf.push(Event::note_on(0, 0, 3, 1)));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.take_dropped(), 1);
        assert_eq!(buf.dropped(), 0);
    }

    #[test]
    fn merge_orders_by_frame_then_source() {
        let mut a = EventBuffer::with_capacity(4);
        a.push(Event::note_on(5, 0, 1, 1));
        let mut b = EventBuffer::with_capacity(4);
        b.push(Event::note_on(5, 0, 2, 1));
        b.push(Event::note_on(1, 0, 3, 1));

        let mut out = EventBuffer::with_capacity(8);
        out.merge_from(&a, 0);
        out.merge_from(&b, 0);
        let notes: Vec<u8> = out.iter().map(|e| e.data[1]).collect();
        assert_eq!(notes, vec![3, 1, 2]);
    }

    #[test]
    fn port_buffer_clear_prefix() {
        let mut buf = PortBuffer::for_kind(PortKind::Audio, 8, 0);
        buf.signal_mut().unwrap().fill(1.0);
        buf.clear(4);
        assert_eq!(buf.signal().unwrap(), &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn signal_delay_shifts_impulse() {
        let mut delay = SignalDelay::new(3);
        let mut block = [1.0, 0.0, 0.0, 0.0, 0.0];
        delay.process_inplace(&mut block);
        assert_eq!(block, [0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn signal_delay_zero_is_passthrough() {
        let mut delay = SignalDelay::new(0);
        assert_eq!(delay.tick(0.5), 0.5);
    }

    #[test]
    fn signal_delay_persists_across_blocks() {
        let mut delay = SignalDelay::new(4);
        let mut first = [0.0, 0.0, 1.0];
        delay.process_inplace(&mut first);
        assert_eq!(first, [0.0; 3]);
        let mut second = [0.0, 0.0, 0.0, 0.0];
        delay.process_inplace(&mut second);
        assert_eq!(second, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn event_delay_crosses_block_boundary() {
        let mut delay = EventDelay::new(6, 8);
        let mut input = EventBuffer::with_capacity(4);
        input.push(Event::note_on(2, 0, 60, 100));

        let mut out = EventBuffer::with_capacity(4);
        delay.process(&input, 4, &mut out);
        assert!(out.is_empty());

        input.clear();
        delay.process(&input, 4, &mut out);
        assert!(out.is_empty());

        // 2 + 6 = 8, the first frame of the third block.
        delay.process(&input, 4, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out.as_slice()[0].frame, 0);
    }
}
