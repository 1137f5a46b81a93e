//! Generation-checked handles and the arena that issues them.
//!
//! Nodes, ports and connections live in [`Arena`]s indexed by handles that carry
//! the slot's generation. Removing an entry bumps the slot generation, so a stale
//! handle held by an edit layer (for instance inside an undo record) resolves to
//! `None` instead of aliasing whatever reused the slot.

use core::fmt;

/// Index plus generation, shared by every typed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            /// Arena slot index.
            #[inline]
            pub fn index(self) -> usize {
                self.0.index as usize
            }

            /// Slot generation at the time the handle was issued.
            #[inline]
            pub fn generation(self) -> u32 {
                self.0.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}v{})", $label, self.0.index, self.0.generation)
            }
        }
    };
}

typed_handle!(
    /// Handle to a node in a [`Graph`](crate::Graph).
    NodeId,
    "NodeId"
);
typed_handle!(
    /// Handle to a port owned by a node.
    PortId,
    "PortId"
);
typed_handle!(
    /// Handle to a directed connection between two ports.
    ConnectionId,
    "ConnectionId"
);

/// Any graph handle, used when reporting unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyId {
    /// A node handle.
    Node(NodeId),
    /// A port handle.
    Port(PortId),
    /// A connection handle.
    Connection(ConnectionId),
}

impl fmt::Display for AnyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => id.fmt(f),
            Self::Port(id) => id.fmt(f),
            Self::Connection(id) => id.fmt(f),
        }
    }
}

impl From<NodeId> for AnyId {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<PortId> for AnyId {
    fn from(id: PortId) -> Self {
        Self::Port(id)
    }
}

impl From<ConnectionId> for AnyId {
    fn from(id: ConnectionId) -> Self {
        Self::Connection(id)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with generation-checked access and free-slot reuse.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> RawHandle {
        self.insert_with(|_| value)
    }

    /// Inserts a value built from the handle it will be stored under.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(RawHandle) -> T) -> RawHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = RawHandle {
                index,
                generation: slot.generation,
            };
            slot.value = Some(make(handle));
            return handle;
        }
        let handle = RawHandle {
            index: self.slots.len() as u32,
            generation: 0,
        };
        self.slots.push(Slot {
            generation: 0,
            value: Some(make(handle)),
        });
        handle
    }

    pub(crate) fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    pub(crate) fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    RawHandle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (RawHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|v| {
                (
                    RawHandle {
                        index: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));
        let b = arena.insert(2);
        // Same slot, new generation.
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn test_double_remove_is_noop() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut arena = Arena::new();
        let first = arena.insert(RawHandle {
            index: 99,
            generation: 99,
        });
        arena.remove(first);
        let h = arena.insert_with(|h| h);
        assert_eq!(arena.get(h), Some(&h));
    }

    #[test]
    fn test_display() {
        let id = NodeId(RawHandle {
            index: 3,
            generation: 1,
        });
        assert_eq!(id.to_string(), "NodeId(3v1)");
    }
}
