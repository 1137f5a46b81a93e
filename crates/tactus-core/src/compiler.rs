//! Graph compiler: cycle validation, stable ordering, latency compensation and
//! parallel partitioning.
//!
//! # Algorithm
//!
//! 1. Build the dependency graph. A connection is a dependency of its
//!    destination node unless that node is a feedback node.
//! 2. Kahn's algorithm with a min-heap keyed on creation order, so equal
//!    graphs always produce equal orders.
//! 3. Longest-path latency: a node's input latency is the maximum output
//!    latency among its dependencies; its output latency adds its own.
//!    Feedback nodes restart at zero.
//! 4. Every connection whose source arrives earlier than the destination's
//!    input latency gets a compensation delay of the difference. A line whose
//!    length is unchanged since the previous compile is reused as is.
//! 5. Processors are grouped into chains (each link being the other's sole
//!    processor dependency and sole dependent). Chains are levelled by their
//!    dependencies into stages, and each stage's chains are dealt round-robin
//!    into at most `max_parallelism` work units.
//!
//! Compilation allocates and takes blocking locks; it never runs on the
//! real-time thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{EventDelay, SignalDelay};
use crate::error::StructuralError;
use crate::graph::Graph;
use crate::id::{ConnectionId, NodeId};
use crate::node::NodeKind;
use crate::port::PortKind;
use crate::schedule::{DelayLine, FeedSource, PortFeed, Schedule, SharedDelay, Stage, Step, WorkUnit};

/// Rejects a connection `from → to` that would close a dependency cycle.
pub(crate) fn check_acyclic(graph: &Graph, from: NodeId, to: NodeId) -> Result<(), StructuralError> {
    if from == to {
        return Err(StructuralError::CycleDetected { from, to });
    }
    if graph.is_feedback(to) {
        return Ok(());
    }
    // A cycle exists if `to` can already reach `from`.
    if graph.can_reach(to, from) {
        return Err(StructuralError::CycleDetected { from, to });
    }
    Ok(())
}

/// Compiles `graph` into a [`Schedule`].
///
/// # Errors
///
/// [`StructuralError::CycleDetected`] if the topology contains a dependency
/// cycle. Connection-time validation normally prevents this.
pub fn compile(graph: &Graph, max_parallelism: usize) -> Result<Schedule, StructuralError> {
    let max_parallelism = max_parallelism.max(1);
    let ids = graph.node_ids();
    let n = ids.len();
    let index: HashMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let kinds: Vec<NodeKind> = ids
        .iter()
        .map(|&id| graph.node_kind(id).unwrap_or(NodeKind::Processor))
        .collect();
    let is_feedback = |i: usize| matches!(kinds[i], NodeKind::Feedback { .. });

    // --- Dependencies ---
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (_, c) in graph.connections.iter() {
        let (Some(&a), Some(&b)) = (index.get(&c.from), index.get(&c.to)) else {
            continue;
        };
        if is_feedback(b) || deps[b].contains(&a) {
            continue;
        }
        deps[b].push(a);
        dependents[a].push(b);
    }

    // --- Stable topological order ---
    let sorted = kahn_sort(&deps, &dependents).map_err(|stuck| StructuralError::CycleDetected {
        from: deps[stuck].first().map_or(ids[stuck], |&d| ids[d]),
        to: ids[stuck],
    })?;
    tracing::debug!("graph_sort: {} nodes in topo order", sorted.len());
    let mut position = vec![0usize; n];
    for (pos, &i) in sorted.iter().enumerate() {
        position[i] = pos;
    }

    // --- Latency ---
    let own_latency: Vec<u32> = ids
        .iter()
        .zip(&kinds)
        .map(|(&id, kind)| match kind {
            NodeKind::Processor => graph.node(id).map_or(0, |cell| cell.shared().latency()),
            _ => 0,
        })
        .collect();
    let mut input_latency = vec![0u32; n];
    let mut output_latency = vec![0u32; n];
    for &i in &sorted {
        input_latency[i] = deps[i].iter().map(|&d| output_latency[d]).max().unwrap_or(0);
        output_latency[i] = if is_feedback(i) {
            0
        } else {
            input_latency[i].saturating_add(own_latency[i])
        };
    }

    // --- Steps with feeds ---
    let mut steps = Vec::with_capacity(n);
    let mut compensation = 0usize;
    let mut previous = graph.compensation.lock();
    let mut lines: HashMap<ConnectionId, (u32, SharedDelay)> = HashMap::new();
    for &i in &sorted {
        let Ok(entry) = graph.entry(ids[i]) else {
            continue;
        };
        let mut feeds = Vec::with_capacity(entry.inputs.len());
        for (slot, &port_id) in entry.inputs.iter().enumerate() {
            let Some(port) = graph.port(port_id) else {
                continue;
            };
            let mut incoming: Vec<_> = entry
                .incoming
                .iter()
                .filter_map(|&id| graph.connections.get(id.0).map(|c| (id, c)))
                .filter(|(_, c)| c.dest == port_id && c.enabled)
                .collect();
            incoming.sort_by_key(|(_, c)| c.seq);

            let mut sources = Vec::with_capacity(incoming.len());
            for (id, c) in incoming {
                let (Some(&a), Some(src_port)) = (index.get(&c.from), graph.port(c.source)) else {
                    continue;
                };
                let delay = if is_feedback(i) {
                    0
                } else {
                    input_latency[i].saturating_sub(output_latency[a])
                };
                let delay = if delay > 0 {
                    compensation += 1;
                    let line = match previous.remove(&id) {
                        Some((length, line)) if length == delay => line,
                        _ => Arc::new(Mutex::new(match port.kind {
                            PortKind::Event => {
                                DelayLine::Events(EventDelay::new(delay, graph.event_capacity()))
                            }
                            _ => DelayLine::Signal(SignalDelay::new(delay as usize)),
                        })),
                    };
                    lines.insert(id, (delay, Arc::clone(&line)));
                    Some(line)
                } else {
                    None
                };
                sources.push(FeedSource {
                    step: position[a],
                    port: src_port.slot,
                    multiplier: c.multiplier,
                    delay,
                });
            }
            feeds.push(PortFeed {
                port: slot,
                sources,
                control: port.control.clone(),
            });
        }
        steps.push(Step {
            cell: entry.cell.clone(),
            feeds,
            latency: own_latency[i],
            input_latency: input_latency[i],
        });
    }
    *previous = lines;
    drop(previous);

    // --- Chains and stages ---
    let is_processor = |i: usize| matches!(kinds[i], NodeKind::Processor);
    let mut chains: Vec<Vec<usize>> = Vec::new();
    let mut chain_level: Vec<usize> = Vec::new();
    let mut chain_of = vec![usize::MAX; n];
    for &v in sorted.iter().filter(|&&v| is_processor(v)) {
        let proc_deps: Vec<usize> = deps[v].iter().copied().filter(|&d| is_processor(d)).collect();
        if let [u] = proc_deps[..] {
            let sole_dependent = dependents[u].iter().filter(|&&d| is_processor(d)).count() == 1;
            let chain = chain_of[u];
            if sole_dependent && chains[chain].last() == Some(&u) {
                chains[chain].push(v);
                chain_of[v] = chain;
                continue;
            }
        }
        let level = proc_deps
            .iter()
            .map(|&d| chain_level[chain_of[d]] + 1)
            .max()
            .unwrap_or(0);
        chain_of[v] = chains.len();
        chains.push(vec![v]);
        chain_level.push(level);
    }

    let levels = chain_level.iter().map(|&l| l + 1).max().unwrap_or(0);
    let mut stages = Vec::with_capacity(levels);
    for level in 0..levels {
        let members: Vec<&Vec<usize>> = chains
            .iter()
            .zip(&chain_level)
            .filter(|&(_, &l)| l == level)
            .map(|(c, _)| c)
            .collect();
        let unit_count = members.len().min(max_parallelism);
        let mut units: Vec<(Vec<usize>, Vec<NodeId>)> = vec![(Vec::new(), Vec::new()); unit_count];
        for (k, chain) in members.into_iter().enumerate() {
            let (unit_steps, unit_nodes) = &mut units[k % unit_count];
            for &v in chain {
                unit_steps.push(position[v]);
                unit_nodes.push(ids[v]);
            }
        }
        stages.push(Stage {
            units: units
                .into_iter()
                .map(|(s, nodes)| WorkUnit::new(s, nodes))
                .collect(),
        });
    }

    let by_kind = |pred: fn(&NodeKind) -> bool| -> Vec<usize> {
        sorted
            .iter()
            .enumerate()
            .filter(|&(_, &i)| pred(&kinds[i]))
            .map(|(pos, _)| pos)
            .collect()
    };
    let outputs = by_kind(|k| matches!(k, NodeKind::Output { .. }));
    let total_latency = outputs
        .iter()
        .map(|&pos| steps[pos].input_latency)
        .max()
        .unwrap_or(0);

    let schedule = Schedule {
        generation: graph.generation(),
        sample_rate: graph.sample_rate(),
        max_block: graph.max_block(),
        max_parallelism,
        order: sorted.iter().map(|&i| ids[i]).collect(),
        inputs: by_kind(|k| matches!(k, NodeKind::Input { .. })),
        outputs,
        feedback: by_kind(|k| matches!(k, NodeKind::Feedback { .. })),
        chains: chains
            .iter()
            .map(|c| c.iter().map(|&v| ids[v]).collect())
            .collect(),
        stages,
        steps,
        total_latency,
    };
    tracing::debug!(
        "graph_compile: generation {}, {} nodes, {} chains in {} stages, latency {} samples, {} compensation delays",
        schedule.generation,
        schedule.steps.len(),
        schedule.chains.len(),
        schedule.stages.len(),
        schedule.total_latency,
        compensation
    );
    Ok(schedule)
}

/// Kahn's algorithm with creation-order tie breaking.
///
/// Node indices are creation order, so a min-heap on the index gives a stable
/// order. On a cycle returns a node that never became ready.
fn kahn_sort(deps: &[Vec<usize>], dependents: &[Vec<usize>]) -> Result<Vec<usize>, usize> {
    let n = deps.len();
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
    let mut sorted = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        sorted.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }
    if sorted.len() == n {
        Ok(sorted)
    } else {
        Err((0..n).find(|&i| in_degree[i] > 0).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ProcessContext, ProcessResult, Processor};
    use crate::port::PortSpec;

    struct Lat(u32);

    impl Processor for Lat {
        fn ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::audio_in("in"), PortSpec::audio_out("out")]
        }

        fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> ProcessResult {
            ProcessResult::Ok
        }

        fn latency_samples(&self) -> u32 {
            self.0
        }
    }

    fn wire(g: &mut Graph, a: NodeId, b: NodeId) {
        let (out, input) = (g.output(a, 0).unwrap(), g.input(b, 0).unwrap());
        g.connect(out, input, 1.0).unwrap();
    }

    #[test]
    fn kahn_breaks_ties_by_creation() {
        let deps = vec![vec![], vec![], vec![1, 0]];
        let dependents = vec![vec![2], vec![2], vec![]];
        assert_eq!(kahn_sort(&deps, &dependents), Ok(vec![0, 1, 2]));
    }

    #[test]
    fn kahn_reports_cycle() {
        let deps = vec![vec![1], vec![0]];
        let dependents = vec![vec![1], vec![0]];
        assert!(kahn_sort(&deps, &dependents).is_err());
    }

    #[test]
    fn empty_graph_compiles() {
        let g = Graph::new(48000.0, 64).unwrap();
        let s = compile(&g, 4).unwrap();
        assert!(s.is_empty());
        assert!(s.stages().is_empty());
    }

    #[test]
    fn order_follows_dependencies_then_creation() {
        let mut g = Graph::new(48000.0, 64).unwrap();
        let c = g.add_processor("c", Box::new(Lat(0)));
        let a = g.add_processor("a", Box::new(Lat(0)));
        let b = g.add_processor("b", Box::new(Lat(0)));
        wire(&mut g, a, c);
        let s = compile(&g, 1).unwrap();
        // `c` is created first, so it runs as soon as `a` has.
        assert_eq!(s.order(), &[a, c, b]);
        assert_eq!(compile(&g, 1).unwrap().order(), s.order());
    }

    #[test]
    fn compensates_shorter_path() {
        let mut g = Graph::new(48000.0, 64).unwrap();
        let input = g.add_input("in", 1);
        let slow = g.add_processor("slow", Box::new(Lat(64)));
        let out = g.add_output("out", 1);
        let in_port = g.output(input, 0).unwrap();
        g.connect(in_port, g.input(slow, 0).unwrap(), 1.0).unwrap();
        g.connect(in_port, g.input(out, 0).unwrap(), 1.0).unwrap();
        wire(&mut g, slow, out);

        let s = compile(&g, 1).unwrap();
        assert_eq!(s.total_latency(), 64);
        assert_eq!(s.input_latency(out), Some(64));
        let step = &s.steps[s.step_index(out).unwrap()];
        let delays: Vec<Option<usize>> = step.feeds[0]
            .sources
            .iter()
            .map(|src| {
                src.delay.as_ref().map(|d| match &*d.lock() {
                    DelayLine::Signal(line) => line.delay_samples(),
                    DelayLine::Events(line) => line.delay_samples() as usize,
                })
            })
            .collect();
        // Direct path delayed by 64, processed path untouched.
        assert_eq!(delays, vec![Some(64), None]);
    }

    #[test]
    fn chains_and_stages() {
        // a → b → c, and d independent; e depends on c and d.
        let mut g = Graph::new(48000.0, 64).unwrap();
        let a = g.add_processor("a", Box::new(Lat(0)));
        let b = g.add_processor("b", Box::new(Lat(0)));
        let c = g.add_processor("c", Box::new(Lat(0)));
        let d = g.add_processor("d", Box::new(Lat(0)));
        let e = g.add_processor("e", Box::new(Lat(0)));
        wire(&mut g, a, b);
        wire(&mut g, b, c);
        wire(&mut g, c, e);
        wire(&mut g, d, e);

        let s = compile(&g, 4).unwrap();
        assert_eq!(s.chains(), &[vec![a, b, c], vec![d], vec![e]]);
        assert_eq!(s.stages().len(), 2);
        assert_eq!(s.stages()[0].units().len(), 2);
        assert_eq!(s.stages()[0].units()[0].nodes(), &[a, b, c]);
        assert_eq!(s.stages()[1].units()[0].nodes(), &[e]);

        let serial = compile(&g, 1).unwrap();
        assert_eq!(serial.stages()[0].units().len(), 1);
        assert_eq!(serial.stages()[0].units()[0].nodes(), &[a, b, c, d]);
    }

    #[test]
    fn feedback_edges_are_not_dependencies() {
        let mut g = Graph::new(48000.0, 64).unwrap();
        let a = g.add_processor("a", Box::new(Lat(0)));
        let fb = g.add_feedback("fb", 1, 128).unwrap();
        wire(&mut g, a, fb);
        wire(&mut g, fb, a);
        let s = compile(&g, 1).unwrap();
        assert_eq!(s.order(), &[fb, a]);
        assert_eq!(s.feedback, vec![0]);
    }

    #[test]
    fn disabled_connection_carries_nothing() {
        let mut g = Graph::new(48000.0, 64).unwrap();
        let a = g.add_processor("a", Box::new(Lat(0)));
        let b = g.add_processor("b", Box::new(Lat(0)));
        let (out, input) = (g.output(a, 0).unwrap(), g.input(b, 0).unwrap());
        let c = g.connect(out, input, 1.0).unwrap();
        g.set_connection_enabled(c, false).unwrap();
        let s = compile(&g, 1).unwrap();
        let step = &s.steps[s.step_index(b).unwrap()];
        assert!(step.feeds[0].sources.is_empty());
        // Order still respects the dormant dependency.
        assert_eq!(s.order(), &[a, b]);
    }
}
