//! Edit-side view of what went wrong on the real-time thread.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::error::ProcessError;
use crate::id::NodeId;
use crate::scheduler::{RtShared, SchedulerStats};

/// Failures of one node since the previous poll.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureSummary {
    /// Failing node.
    pub node: NodeId,
    /// First error seen in this poll.
    pub first: ProcessError,
    /// Reports received for the node in this poll.
    pub count: u64,
}

/// Drains failure reports and exposes scheduler counters.
pub struct EngineMonitor {
    failures: Receiver<ProcessError>,
    rt: Arc<RtShared>,
    totals: HashMap<NodeId, u64>,
    reported_events: u64,
}

impl EngineMonitor {
    pub(crate) fn new(failures: Receiver<ProcessError>, rt: Arc<RtShared>) -> Self {
        Self {
            failures,
            rt,
            totals: HashMap::new(),
            reported_events: 0,
        }
    }

    /// Drains queued failures, logs one warning per node and returns the summaries.
    pub fn poll(&mut self) -> Vec<FailureSummary> {
        let mut summaries: Vec<FailureSummary> = Vec::new();
        for error in self.failures.try_iter() {
            let node = error.node();
            *self.totals.entry(node).or_default() += 1;
            match summaries.iter_mut().find(|s| s.node == node) {
                Some(summary) => summary.count += 1,
                None => summaries.push(FailureSummary {
                    node,
                    first: error,
                    count: 1,
                }),
            }
        }
        for summary in &summaries {
            tracing::warn!(node = %summary.node, count = summary.count, "node_failure: {}", summary.first);
        }
        let stats = self.stats();
        if stats.dropped_reports > 0 && !summaries.is_empty() {
            tracing::warn!(dropped = stats.dropped_reports, "node_failure: reports dropped, queue full");
        }
        let lost = stats.dropped_events - self.reported_events;
        if lost > 0 {
            tracing::warn!(lost, total = stats.dropped_events, "event_overflow: port event buffers full");
            self.reported_events = stats.dropped_events;
        }
        summaries
    }

    /// Reports received for `node` since the engine started.
    pub fn total_failures(&self, node: NodeId) -> u64 {
        self.totals.get(&node).copied().unwrap_or(0)
    }

    /// Scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        self.rt.snapshot()
    }

    pub(crate) fn take_latency_changed(&self) -> bool {
        self.rt
            .stats
            .latency_changed
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }
}

impl core::fmt::Debug for EngineMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineMonitor")
            .field("pending", &self.failures.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
