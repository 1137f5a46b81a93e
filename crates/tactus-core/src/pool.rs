//! Worker threads for running the work units of one stage concurrently.
//!
//! The real-time thread posts a stage on a shared board, wakes as many
//! workers as there are extra units, claims units itself and spins until every
//! unit has finished. Workers park between stages. Posting a stage never
//! allocates or takes a lock.
//!
//! Claims go through a single `u64` cursor holding `(sequence << 32) | next`,
//! so a late worker can never claim a unit of a stage that has already been
//! replaced.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;

use crate::publish::Versioned;
use crate::schedule::Schedule;
use crate::scheduler::{RtShared, execute_unit};
use crate::transport::{SubBlock, TransportInfo};

const ROLLING: u8 = 1;
const CAPTURING: u8 = 2;

/// [`SubBlock`] stored as atomics.
#[derive(Default)]
struct SharedSubBlock {
    offset: AtomicUsize,
    len: AtomicUsize,
    pass_id: AtomicU64,
    position: AtomicU64,
    tick: AtomicU64,
    ticks_per_sample: AtomicU64,
    bpm: AtomicU64,
    meter: AtomicU64,
    flags: AtomicU8,
}

impl SharedSubBlock {
    fn store(&self, sub: &SubBlock) {
        let info = &sub.info;
        self.offset.store(sub.offset, Ordering::Relaxed);
        self.len.store(sub.len, Ordering::Relaxed);
        self.pass_id.store(sub.pass_id, Ordering::Relaxed);
        self.position.store(info.position, Ordering::Relaxed);
        self.tick.store(info.tick.to_bits(), Ordering::Relaxed);
        self.ticks_per_sample
            .store(info.ticks_per_sample.to_bits(), Ordering::Relaxed);
        self.bpm.store(info.bpm.to_bits(), Ordering::Relaxed);
        self.meter.store(
            (u64::from(info.beats_per_bar) << 8) | u64::from(info.beat_unit),
            Ordering::Relaxed,
        );
        let flags = if info.rolling { ROLLING } else { 0 } | if info.capturing { CAPTURING } else { 0 };
        self.flags.store(flags, Ordering::Relaxed);
    }

    fn load(&self) -> SubBlock {
        let meter = self.meter.load(Ordering::Relaxed);
        let flags = self.flags.load(Ordering::Relaxed);
        SubBlock {
            offset: self.offset.load(Ordering::Relaxed),
            len: self.len.load(Ordering::Relaxed),
            pass_id: self.pass_id.load(Ordering::Relaxed),
            info: TransportInfo {
                position: self.position.load(Ordering::Relaxed),
                tick: f64::from_bits(self.tick.load(Ordering::Relaxed)),
                ticks_per_sample: f64::from_bits(self.ticks_per_sample.load(Ordering::Relaxed)),
                bpm: f64::from_bits(self.bpm.load(Ordering::Relaxed)),
                beats_per_bar: (meter >> 8) as u8,
                beat_unit: meter as u8,
                rolling: flags & ROLLING != 0,
                capturing: flags & CAPTURING != 0,
            },
        }
    }
}

#[derive(Default)]
struct JobSlot {
    stage: AtomicUsize,
    units: AtomicUsize,
}

struct Board {
    schedule: ArcSwapOption<Versioned<Schedule>>,
    sub: SharedSubBlock,
    // Alternating so a new stage never overwrites the one a late worker is reading.
    jobs: [JobSlot; 2],
    cursor: AtomicU64,
    remaining: AtomicUsize,
    shutdown: AtomicBool,
    rt: Arc<RtShared>,
}

impl Board {
    fn help(&self, seq: u32) {
        let slot = &self.jobs[(seq & 1) as usize];
        let stage = slot.stage.load(Ordering::Acquire);
        let units = slot.units.load(Ordering::Acquire);
        loop {
            let cursor = self.cursor.load(Ordering::Acquire);
            if (cursor >> 32) as u32 != seq {
                return;
            }
            let next = (cursor & 0xFFFF_FFFF) as usize;
            if next >= units {
                return;
            }
            if self
                .cursor
                .compare_exchange_weak(cursor, cursor + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let schedule = self.schedule.load();
            if let Some(schedule) = schedule.as_ref() {
                let sub = self.sub.load();
                execute_unit(schedule, stage, next, &sub, &self.rt);
            }
            self.remaining.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Threads that help the real-time thread run a stage.
pub(crate) struct WorkerPool {
    board: Arc<Board>,
    workers: Vec<JoinHandle<()>>,
    seq: u32,
}

impl WorkerPool {
    /// Spawns `threads` workers.
    pub(crate) fn new(threads: usize, rt: Arc<RtShared>) -> std::io::Result<Self> {
        let board = Arc::new(Board {
            schedule: ArcSwapOption::empty(),
            sub: SharedSubBlock::default(),
            jobs: [JobSlot::default(), JobSlot::default()],
            cursor: AtomicU64::new(0),
            remaining: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            rt,
        });
        let mut pool = Self {
            board,
            workers: Vec::with_capacity(threads),
            seq: 0,
        };
        for i in 0..threads {
            let board = Arc::clone(&pool.board);
            // On error the pool drops here and joins what was spawned.
            let handle = thread::Builder::new()
                .name(format!("tactus-worker-{i}"))
                .spawn(move || worker_loop(&board))?;
            pool.workers.push(handle);
        }
        tracing::debug!("worker_pool: {threads} threads");
        Ok(pool)
    }

    /// Number of worker threads.
    pub(crate) fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Replaces the schedule workers execute. Called at block boundaries only.
    pub(crate) fn set_schedule(&self, schedule: Arc<Versioned<Schedule>>) {
        self.board.schedule.store(Some(schedule));
    }

    /// Runs every unit of `stage` and returns when all have finished.
    pub(crate) fn run_stage(&mut self, stage: usize, units: usize, sub: &SubBlock) {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        let seq = self.seq;
        let board = &*self.board;
        let slot = &board.jobs[(seq & 1) as usize];
        slot.stage.store(stage, Ordering::Relaxed);
        slot.units.store(units, Ordering::Relaxed);
        board.sub.store(sub);
        board.remaining.store(units, Ordering::Relaxed);
        board.cursor.store(u64::from(seq) << 32, Ordering::Release);

        for worker in self.workers.iter().take(units.saturating_sub(1)) {
            worker.thread().unpark();
        }
        board.help(seq);
        while board.remaining.load(Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.board.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.thread().unpark();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker_pool: worker panicked");
            }
        }
    }
}

fn worker_loop(board: &Board) {
    let mut seen = 0u32;
    loop {
        if board.shutdown.load(Ordering::Acquire) {
            return;
        }
        let seq = (board.cursor.load(Ordering::Acquire) >> 32) as u32;
        if seq != seen {
            seen = seq;
            board.help(seq);
            continue;
        }
        thread::park();
    }
}
