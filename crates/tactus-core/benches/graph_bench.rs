//! Criterion benchmarks for the signal graph and scheduler.
//!
//! Measures engine overhead with a trivial `Gain` processor. Three axes:
//!
//! - **Compile** - ordering, latency compensation and stage partitioning
//! - **Process** - `Scheduler::process()` throughput for chains and wide mixes
//! - **Loop** - block splitting cost while the transport wraps every block
//!
//! Run with: `cargo bench -p tactus-core -- graph/`
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tactus_core::{
    BlockIo, Engine, EngineOptions, Graph, NodeId, PortSpec, ProcessContext, ProcessResult,
    Processor, Scheduler, StructuralError,
};

const SAMPLE_RATE: f64 = 48000.0;
const BLOCK_SIZE: usize = 256;
const BLOCK_SIZES: &[usize] = &[64, 128, 256, 512, 1024];

// ---------------------------------------------------------------------------
// Trivial Gain processor - isolates engine overhead from DSP cost
// ---------------------------------------------------------------------------

struct Gain(f32);

impl Processor for Gain {
    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> ProcessResult {
        let gain = self.0;
        let (input, output) = ctx.io(0, 0);
        for (o, i) in output.iter_mut().zip(input) {
            *o = i * gain;
        }
        ProcessResult::Ok
    }
}

// ---------------------------------------------------------------------------
// Session constructors
// ---------------------------------------------------------------------------

type Built = Result<(), StructuralError>;

fn link(graph: &mut Graph, from: NodeId, to: NodeId) -> Built {
    let src = graph.output(from, 0).unwrap();
    let dst = graph.input(to, 0).unwrap();
    graph.connect(src, dst, 1.0)?;
    Ok(())
}

fn linear(graph: &mut Graph, n: usize) -> Built {
    let mut prev = graph.add_input("in", 1);
    for i in 0..n {
        let node = graph.add_processor(format!("gain {i}"), Box::new(Gain(0.9)));
        link(graph, prev, node)?;
        prev = node;
    }
    let out = graph.add_output("out", 1);
    link(graph, prev, out)
}

/// `tracks` parallel chains of `depth` gains summed into one output.
fn mix(graph: &mut Graph, tracks: usize, depth: usize) -> Built {
    let input = graph.add_input("in", 1);
    let out = graph.add_output("out", 1);
    for t in 0..tracks {
        let mut prev = input;
        for d in 0..depth {
            let node = graph.add_processor(format!("t{t} g{d}"), Box::new(Gain(0.5)));
            link(graph, prev, node)?;
            prev = node;
        }
        link(graph, prev, out)?;
    }
    Ok(())
}

fn standalone(build: impl FnOnce(&mut Graph) -> Built) -> Graph {
    let mut graph = Graph::new(SAMPLE_RATE, BLOCK_SIZE).unwrap();
    build(&mut graph).unwrap();
    graph
}

fn session(
    max_block: usize,
    max_parallelism: usize,
    build: impl FnOnce(&mut Graph) -> Built,
) -> (Engine, Scheduler) {
    let (mut engine, scheduler) = Engine::new(EngineOptions {
        max_block,
        max_parallelism,
        ..EngineOptions::default()
    })
    .unwrap();
    engine.edit(build).unwrap();
    (engine, scheduler)
}

fn run(scheduler: &mut Scheduler, input: &[f32], output: &mut [f32]) {
    scheduler.process(&mut BlockIo {
        input: black_box(input),
        input_channels: 1,
        output,
        output_channels: 1,
        events: &[],
    });
}

// ---------------------------------------------------------------------------
// Compile benchmarks
// ---------------------------------------------------------------------------

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/compile");

    for &n in &[5usize, 20, 100] {
        let graph = standalone(|g| linear(g, n));
        group.bench_with_input(BenchmarkId::new("linear", n), &n, |b, _| {
            b.iter(|| black_box(graph.compile(1).unwrap()));
        });
    }

    // Wide mix - exercises stage partitioning and latency bookkeeping
    let graph = standalone(|g| mix(g, 32, 4));
    group.bench_function("mix_32x4_parallel_4", |b| {
        b.iter(|| black_box(graph.compile(4).unwrap()));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Process benchmarks - fixed block size 256
// ---------------------------------------------------------------------------

fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/process");

    let input = vec![0.5f32; BLOCK_SIZE];
    let mut output = vec![0.0f32; BLOCK_SIZE];

    for &n in &[5usize, 20] {
        let (_engine, mut scheduler) = session(BLOCK_SIZE, 1, |g| linear(g, n));
        group.bench_function(format!("linear_{n}_block256"), |b| {
            b.iter(|| {
                run(&mut scheduler, &input, &mut output);
                black_box(&output);
            });
        });
    }

    for &parallelism in &[1usize, 4] {
        let (_engine, mut scheduler) = session(BLOCK_SIZE, parallelism, |g| mix(g, 32, 4));
        group.bench_function(format!("mix_32x4_parallel_{parallelism}"), |b| {
            b.iter(|| {
                run(&mut scheduler, &input, &mut output);
                black_box(&output);
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Block size sweep and loop splitting
// ---------------------------------------------------------------------------

fn bench_block_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/block_sweep");

    for &block_size in BLOCK_SIZES {
        let input = vec![0.5f32; block_size];
        let mut output = vec![0.0f32; block_size];
        let (engine, mut scheduler) = session(block_size, 1, |g| linear(g, 5));
        engine.transport().play().unwrap();

        group.bench_with_input(BenchmarkId::new("linear_5", block_size), &block_size, |b, _| {
            b.iter(|| {
                run(&mut scheduler, &input, &mut output);
                black_box(&output);
            });
        });
    }

    group.finish();
}

fn bench_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph/loop");

    let input = vec![0.5f32; BLOCK_SIZE];
    let mut output = vec![0.0f32; BLOCK_SIZE];
    let (engine, mut scheduler) = session(BLOCK_SIZE, 1, |g| linear(g, 5));
    let transport = engine.transport();
    transport.set_loop(0, 100).unwrap();
    transport.set_loop_enabled(true).unwrap();
    transport.play().unwrap();

    group.bench_function("wrap_every_100_block256", |b| {
        b.iter(|| {
            run(&mut scheduler, &input, &mut output);
            black_box(&output);
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

criterion_group!(benches, bench_compile, bench_process, bench_block_sweep, bench_loop);
criterion_main!(benches);
