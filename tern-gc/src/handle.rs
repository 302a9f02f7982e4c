use crate::error::{GcError, Result};
use std::fmt;

/// A stable reference to a heap object.
///
/// The index picks a slot in the [`HandleTable`]; the generation tells a live
/// slot apart from an earlier occupant, so a handle to a reclaimed object is
/// reported as [`GcError::StaleHandle`] rather than silently aliasing whatever
/// reused the slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot {
    Live { addr: usize, holds: u32 },
    Vacant { next: Option<u32> },
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Slot,
}

/// Maps handles to the current address of their object.
///
/// Only the collector moves objects, so only the collector calls
/// [`HandleTable::update`] and [`HandleTable::recycle`].
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: Vec<Entry>,
    free: Option<u32>,
    live: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live handles.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots ever created, live or vacant.
    pub fn slots(&self) -> usize {
        self.entries.len()
    }

    /// Mints a handle for the object at `addr`, holding it once. Vacated slots
    /// are reused most recent first.
    pub fn allocate_entry(&mut self, addr: usize) -> Handle {
        self.live += 1;

        if let Some(index) = self.free {
            let entry = &mut self.entries[index as usize];
            self.free = match entry.slot {
                Slot::Vacant { next } => next,
                Slot::Live { .. } => unreachable!("live slot {index} on the free list"),
            };
            entry.slot = Slot::Live { addr, holds: 1 };

            return Handle {
                index,
                generation: entry.generation,
            };
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Live { addr, holds: 1 },
        });

        Handle {
            index,
            generation: 0,
        }
    }

    fn entry(&self, handle: Handle) -> Result<(usize, u32)> {
        match self.entries.get(handle.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Live { addr, holds },
            }) if *generation == handle.generation => Ok((*addr, *holds)),
            _ => Err(GcError::StaleHandle(handle)),
        }
    }

    fn holds_mut(&mut self, handle: Handle) -> Result<&mut u32> {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Live { holds, .. },
            }) if *generation == handle.generation => Ok(holds),
            _ => Err(GcError::StaleHandle(handle)),
        }
    }

    #[inline]
    pub fn deref(&self, handle: Handle) -> Result<usize> {
        self.entry(handle).map(|(addr, _)| addr)
    }

    pub fn holds(&self, handle: Handle) -> Result<u32> {
        self.entry(handle).map(|(_, holds)| holds)
    }

    pub fn retain(&mut self, handle: Handle) -> Result<()> {
        let holds = self.holds_mut(handle)?;
        *holds += 1;
        Ok(())
    }

    /// Drops one hold. The object stays valid until a collection finds it
    /// unreachable.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        let holds = self.holds_mut(handle)?;
        if *holds == 0 {
            return Err(GcError::NotRooted(handle));
        }
        *holds -= 1;
        Ok(())
    }

    pub(crate) fn update(&mut self, index: u32, new_addr: usize) {
        match &mut self.entries[index as usize].slot {
            Slot::Live { addr, .. } => *addr = new_addr,
            Slot::Vacant { .. } => unreachable!("relocating through vacant slot {index}"),
        }
    }

    /// Vacates a slot. Every handle minted for it so far becomes stale.
    pub(crate) fn recycle(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(matches!(entry.slot, Slot::Live { .. }));

        entry.generation = entry.generation.wrapping_add(1);
        entry.slot = Slot::Vacant { next: self.free };
        self.free = Some(index);
        self.live -= 1;
    }

    /// The handle currently naming slot `index`, if it is live.
    pub(crate) fn handle_at(&self, index: u32) -> Option<Handle> {
        match self.entries.get(index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Live { .. },
            }) => Some(Handle {
                index,
                generation: *generation,
            }),
            _ => None,
        }
    }

    /// Live `(index, address)` pairs in slot order.
    pub(crate) fn live(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry.slot {
                Slot::Live { addr, .. } => Some((index as u32, addr)),
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles with at least one hold, in slot order.
    pub(crate) fn held(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry.slot {
                Slot::Live { holds, .. } if holds > 0 => Some(Handle {
                    index: index as u32,
                    generation: entry.generation,
                }),
                _ => None,
            })
    }
}
