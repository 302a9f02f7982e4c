use crate::error::{GcError, Result};
use tern_mmap::{MemoryMap, PAGE_BYTES};

/// Rounds `n` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A contiguous region handed out front to back by a bump pointer.
#[derive(Debug)]
pub struct Slab {
    map: MemoryMap,
    top: usize,
}

impl Slab {
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    pub fn used(&self) -> usize {
        self.top
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.top
    }

    pub fn base(&self) -> *mut u8 {
        self.map.data()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.map.contains(addr)
    }

    /// Reserves `size` bytes at `align` and returns their offset from [`Slab::base`].
    ///
    /// The base is page aligned, so offset alignment is address alignment for any
    /// `align` up to a page.
    pub fn bump_alloc(&mut self, size: usize, align: usize) -> Result<usize> {
        debug_assert!(align.is_power_of_two() && align <= PAGE_BYTES);

        let offset = align_up(self.top, align);
        match offset.checked_add(size) {
            Some(end) if end <= self.capacity() => {
                self.top = end;
                Ok(offset)
            }
            _ => Err(GcError::OutOfSlab {
                requested: size,
                available: self.remaining(),
            }),
        }
    }
}

/// Hands out slabs, rounding every request to the configured granularity, and
/// keeps a small pool of vacated default-size slabs for reuse.
pub struct SlabAllocator {
    granularity: usize,
    limit: usize,
    pool_limit: usize,
    pool: Vec<MemoryMap>,
    mapped: usize,
    acquired: u64,
    released: u64,
}

impl SlabAllocator {
    pub fn new(granularity: usize, limit: usize, pool_limit: usize) -> Self {
        debug_assert!(granularity > 0 && granularity % PAGE_BYTES == 0);

        Self {
            granularity,
            limit,
            pool_limit,
            pool: Vec::new(),
            mapped: 0,
            acquired: 0,
            released: 0,
        }
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Bytes currently mapped, including pooled slabs.
    pub fn bytes_mapped(&self) -> usize {
        self.mapped
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn slabs_acquired(&self) -> u64 {
        self.acquired
    }

    pub fn slabs_released(&self) -> u64 {
        self.released
    }

    /// Size of the slab [`SlabAllocator::acquire_slab`] maps for `min_bytes`.
    pub fn slab_size(&self, min_bytes: usize) -> usize {
        let slabs = min_bytes.max(1).div_ceil(self.granularity);
        slabs.saturating_mul(self.granularity)
    }

    /// Bytes that can still be mapped, counting pooled slabs as free.
    pub fn available(&self) -> usize {
        let committed = self.mapped - self.pool.len() * self.granularity;
        self.limit.saturating_sub(committed)
    }

    pub fn acquire_slab(&mut self, min_bytes: usize) -> Result<Slab> {
        let size = self.slab_size(min_bytes);

        if size == self.granularity {
            if let Some(map) = self.pool.pop() {
                tracing::trace!(size, "reusing pooled slab");
                self.acquired += 1;
                return Ok(Slab { map, top: 0 });
            }
        }

        // Pooled slabs count against the limit; give them up before failing.
        while self.mapped.saturating_add(size) > self.limit {
            match self.pool.pop() {
                Some(map) => self.mapped -= map.len(),
                None => {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        limit: self.limit,
                    })
                }
            }
        }

        let map = MemoryMap::new(size).map_err(|err| {
            tracing::warn!(size, %err, "mapping a slab failed");
            GcError::OutOfMemory {
                requested: size,
                limit: self.limit,
            }
        })?;

        self.mapped += size;
        self.acquired += 1;
        tracing::trace!(size, mapped = self.mapped, "mapped slab");

        Ok(Slab { map, top: 0 })
    }

    pub fn release_slab(&mut self, slab: Slab) {
        let size = slab.capacity();
        self.released += 1;

        if size == self.granularity && self.pool.len() < self.pool_limit {
            match slab.map.discard() {
                Ok(()) => {
                    self.pool.push(slab.map);
                    return;
                }
                Err(err) => tracing::warn!(%err, "discarding slab contents failed, unmapping"),
            }
        }

        self.mapped -= size;
        tracing::trace!(size, mapped = self.mapped, "unmapped slab");
    }
}
