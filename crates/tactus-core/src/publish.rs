//! Wait-free publication of immutable snapshots to the real-time thread.
//!
//! The edit side swaps a new `Arc` into an [`ArcSwap`]; the real-time side
//! loads it at a block boundary. Two rules keep the audio path free of
//! deallocation:
//!
//! - The publisher keeps every value it replaced in a retire list, so the
//!   subscriber never drops the last reference.
//! - The subscriber acknowledges the generation it runs. A retired value is
//!   released once the acknowledged generation reaches the generation that
//!   replaced it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

/// Value tagged with the generation it was published under.
#[derive(Debug)]
pub struct Versioned<T> {
    generation: u64,
    value: T,
}

impl<T> Versioned<T> {
    /// Publication generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> core::ops::Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

struct Shared<T> {
    slot: ArcSwap<Versioned<T>>,
    acked: AtomicU64,
}

/// Edit-side end.
pub(crate) struct Publisher<T> {
    shared: Arc<Shared<T>>,
    next_generation: u64,
    retired: Vec<(u64, Arc<Versioned<T>>)>,
}

/// Real-time end.
pub(crate) struct Subscriber<T> {
    shared: Arc<Shared<T>>,
    current: Arc<Versioned<T>>,
}

/// Creates a linked publisher and subscriber holding `initial` as generation 0.
pub(crate) fn channel<T>(initial: T) -> (Publisher<T>, Subscriber<T>) {
    let first = Arc::new(Versioned {
        generation: 0,
        value: initial,
    });
    let shared = Arc::new(Shared {
        slot: ArcSwap::new(Arc::clone(&first)),
        acked: AtomicU64::new(0),
    });
    (
        Publisher {
            shared: Arc::clone(&shared),
            next_generation: 1,
            retired: Vec::new(),
        },
        Subscriber {
            shared,
            current: first,
        },
    )
}

impl<T> Publisher<T> {
    /// Publishes `value` and returns its generation.
    pub(crate) fn publish(&mut self, value: T) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        let old = self.shared.slot.swap(Arc::new(Versioned { generation, value }));
        self.retired.push((generation, old));
        self.collect();
        generation
    }

    /// Latest published value.
    pub(crate) fn current(&self) -> Arc<Versioned<T>> {
        self.shared.slot.load_full()
    }

    /// Generation the subscriber last acknowledged.
    pub(crate) fn acknowledged(&self) -> u64 {
        self.shared.acked.load(Ordering::Acquire)
    }

    /// Releases retired values the subscriber can no longer hold.
    ///
    /// Returns the number released.
    pub(crate) fn collect(&mut self) -> usize {
        let acked = self.acknowledged();
        let before = self.retired.len();
        self.retired.retain(|(replaced_by, _)| *replaced_by > acked);
        before - self.retired.len()
    }

    /// Values waiting for acknowledgement.
    pub(crate) fn pending(&self) -> usize {
        self.retired.len()
    }
}

impl<T> Subscriber<T> {
    /// Picks up the latest value. Returns `true` if it changed.
    ///
    /// The previous value is dropped here; the publisher still holds it, so
    /// this is only a reference count decrement.
    #[inline]
    pub(crate) fn refresh(&mut self) -> bool {
        let generation = self.shared.slot.load().generation;
        if generation == self.current.generation {
            return false;
        }
        self.current = self.shared.slot.load_full();
        true
    }

    /// Confirms the current value is the only one still in use here.
    #[inline]
    pub(crate) fn acknowledge(&self) {
        self.shared
            .acked
            .store(self.current.generation, Ordering::Release);
    }

    /// Value in use.
    #[inline]
    pub(crate) fn current(&self) -> &Arc<Versioned<T>> {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_refresh_acknowledge() {
        let (mut tx, mut rx) = channel(1u32);
        assert_eq!(***rx.current(), 1);
        assert!(!rx.refresh());

        let generation = tx.publish(2);
        assert_eq!(generation, 1);
        assert_eq!(tx.pending(), 1);

        assert!(rx.refresh());
        assert_eq!(***rx.current(), 2);
        // Not released until acknowledged.
        assert_eq!(tx.collect(), 0);
        rx.acknowledge();
        assert_eq!(tx.collect(), 1);
        assert_eq!(tx.pending(), 0);
    }

    #[test]
    fn subscriber_never_holds_last_reference() {
        let (mut tx, mut rx) = channel(vec![0u8; 16]);
        tx.publish(vec![1u8; 16]);
        tx.publish(vec![2u8; 16]);
        let held = Arc::clone(rx.current());
        assert!(rx.refresh());
        // Publisher plus our clone.
        assert!(Arc::strong_count(&held) >= 2);
        rx.acknowledge();
        assert_eq!(tx.collect(), 2);
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn skipped_generations_release_together() {
        let (mut tx, mut rx) = channel(0u8);
        for v in 1..=5 {
            tx.publish(v);
        }
        assert_eq!(tx.pending(), 5);
        rx.refresh();
        assert_eq!(rx.current().generation(), 5);
        rx.acknowledge();
        tx.collect();
        assert_eq!(tx.pending(), 0);
        assert_eq!(tx.acknowledged(), 5);
    }
}
