//! Anonymous, page-aligned memory regions used as slab backing.
//!
//! On unix the region comes straight from `mmap` and goes back with `munmap`.
//! Under miri, and on targets without `mmap`, it falls back to the global
//! allocator with page alignment so the rest of the heap does not need to care.

use std::io;
#[cfg(all(not(miri), unix))]
use std::ptr;
use std::ptr::NonNull;

//TODO support windows (using 'windows' crate) instead of the allocator fallback
//TODO use libc::MAP_HUGETLB on supported platforms

pub const PAGE_BYTES: usize = 4096;

#[derive(Debug)]
pub struct MemoryMap {
    size: usize,
    data: NonNull<u8>,
}

impl MemoryMap {
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Does `addr` fall inside this mapping?
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.data.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    fn check_size(size: usize) -> io::Result<()> {
        if size == 0 || size % PAGE_BYTES != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapping size {size} is not a positive multiple of {PAGE_BYTES}"),
            ));
        }
        Ok(())
    }
}

#[cfg(any(miri, not(unix)))]
impl MemoryMap {
    fn layout(size: usize) -> io::Result<std::alloc::Layout> {
        std::alloc::Layout::from_size_align(size, PAGE_BYTES)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    }

    pub fn new(size: usize) -> io::Result<Self> {
        Self::check_size(size)?;
        let layout = Self::layout(size)?;

        let data = unsafe { std::alloc::alloc_zeroed(layout) };
        let data = NonNull::new(data)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))?;

        Ok(Self { size, data })
    }

    /// Gives the contents back; the next read of any byte sees zero.
    pub fn discard(&self) -> io::Result<()> {
        unsafe {
            self.data.as_ptr().write_bytes(0, self.size);
        }
        Ok(())
    }
}

#[cfg(any(miri, not(unix)))]
impl Drop for MemoryMap {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            unsafe {
                std::alloc::dealloc(self.data.as_ptr(), layout);
            }
        }
    }
}

#[cfg(all(not(miri), unix))]
impl MemoryMap {
    pub fn new(size: usize) -> io::Result<Self> {
        Self::check_size(size)?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let data = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self { size, data })
    }

    /// Hands the physical pages back to the OS while keeping the mapping.
    /// Private anonymous pages read back as zero afterwards.
    pub fn discard(&self) -> io::Result<()> {
        let result = unsafe {
            libc::madvise(self.data.as_ptr() as _, self.size, libc::MADV_DONTNEED)
        };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(all(not(miri), unix))]
impl Drop for MemoryMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.data.as_ptr() as _, self.size);
        }
    }
}
