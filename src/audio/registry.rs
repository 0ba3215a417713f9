//! Owner-held registry of ring buffer readers
//!
//! The spatial mixer never holds a ring buffer directly. It records a
//! [`SourceHandle`] and resolves it against the registry on every render, so a
//! buffer torn down by the engine turns into a detached source instead of a
//! dangling reference.

use crate::audio::buffer::RingReader;

/// Generational index into a [`SourceRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    reader: Option<RingReader>,
}

/// Holds the consumer halves that render stages pull from
#[derive(Default)]
pub struct SourceRegistry {
    slots: Vec<Slot>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader, reusing a vacant slot when one exists
    pub fn insert(&mut self, reader: RingReader) -> SourceHandle {
        if let Some(index) = self.slots.iter().position(|s| s.reader.is_none()) {
            let slot = &mut self.slots[index];
            slot.reader = Some(reader);
            return SourceHandle {
                slot: index as u32,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot {
            generation: 0,
            reader: Some(reader),
        });
        SourceHandle {
            slot: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Resolve a handle; stale or removed handles yield `None`
    pub fn get_mut(&mut self, handle: SourceHandle) -> Option<&mut RingReader> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.reader.as_mut())
    }

    pub fn contains(&self, handle: SourceHandle) -> bool {
        self.slots
            .get(handle.slot as usize)
            .map(|s| s.generation == handle.generation && s.reader.is_some())
            .unwrap_or(false)
    }

    /// Take the reader out and invalidate every outstanding copy of `handle`
    pub fn remove(&mut self, handle: SourceHandle) -> Option<RingReader> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let reader = slot.reader.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(reader)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.reader.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
