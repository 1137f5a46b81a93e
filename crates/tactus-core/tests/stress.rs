//! Concurrency stress tests: the scheduler renders on its own thread while the
//! edit thread rewires the graph, flips flags and drives the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use tactus_core::nodes::{Bus, Fader, SineSource};
use tactus_core::{Engine, EngineOptions, NodeId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn wire(engine: &mut Engine, from: NodeId, to: NodeId) {
    let src = engine.graph().output(from, 0).unwrap();
    let dst = engine.graph().input(to, 0).unwrap();
    engine.connect(src, dst, 0.25).unwrap();
}

fn run_churn(max_parallelism: usize, rounds: usize) {
    let (mut engine, mut scheduler) = Engine::new(EngineOptions {
        max_block: 128,
        max_parallelism,
        ..EngineOptions::default()
    })
    .unwrap();
    let out = engine.add_output("main", 2).unwrap();
    let bus = engine.add_processor("mix", Box::new(Bus::new(1))).unwrap();
    wire(&mut engine, bus, out);

    let running = Arc::new(AtomicBool::new(true));
    let blocks = Arc::new(AtomicU64::new(0));
    let audio = {
        let running = Arc::clone(&running);
        let blocks = Arc::clone(&blocks);
        thread::spawn(move || {
            let mut output = vec![0.0f32; 256 * 2];
            while running.load(Ordering::Acquire) {
                scheduler.render(&mut output, 2);
                assert!(output.iter().all(|s| s.is_finite()));
                blocks.fetch_add(1, Ordering::Relaxed);
            }
            scheduler
        })
    };

    let mut live: Vec<(NodeId, NodeId)> = Vec::new();
    for round in 0..rounds {
        let tone = engine
            .add_processor(
                format!("tone {round}"),
                Box::new(SineSource::new(100.0 + round as f64, 0.1)),
            )
            .unwrap();
        let fader = engine
            .add_processor(format!("fader {round}"), Box::new(Fader::new(1)))
            .unwrap();
        wire(&mut engine, tone, fader);
        wire(&mut engine, fader, bus);
        live.push((tone, fader));

        engine.set_bypass(fader, round % 3 == 0).unwrap();
        if round % 4 == 0 {
            engine.transport().play().unwrap();
        } else if round % 7 == 0 {
            engine.transport().stop().unwrap();
        }
        if live.len() > 8 {
            let (tone, fader) = live.remove(0);
            engine.remove_node(tone).unwrap();
            engine.remove_node(fader).unwrap();
        }
        engine.maintain();
        thread::yield_now();
    }

    // Let the audio thread acknowledge the last schedule before releasing.
    let target = blocks.load(Ordering::Relaxed) + 4;
    while blocks.load(Ordering::Relaxed) < target {
        thread::yield_now();
    }
    engine.maintain();
    running.store(false, Ordering::Release);
    let scheduler = audio.join().unwrap();

    let stats = scheduler.stats();
    assert_eq!(stats.retired_hits, 0);
    assert_eq!(stats.node_failures, 0);
    assert_eq!(engine.quarantined(), 0);
    assert_eq!(engine.graph().node_count(), 2 + 2 * live.len());
}

// ===========================================================================
// 1. Edit churn while rendering
// ===========================================================================

#[test]
fn edits_while_rendering_single_thread() {
    run_churn(1, 200);
}

#[test]
fn edits_while_rendering_with_workers() {
    run_churn(4, 200);
}

// ===========================================================================
// 2. Transport command flood
// ===========================================================================

#[test]
fn full_command_queue_rejects_without_blocking() {
    let (engine, mut scheduler) = Engine::new(EngineOptions {
        command_queue_capacity: 4,
        ..EngineOptions::default()
    })
    .unwrap();
    let transport = engine.transport().clone();
    let mut accepted = 0;
    for _ in 0..16 {
        if transport.play().is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 4);

    let mut output = vec![0.0f32; 512];
    scheduler.render(&mut output, 1);
    assert!(transport.play().is_ok());
}
