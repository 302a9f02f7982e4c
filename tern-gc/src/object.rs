use crate::class::{ClassDescriptor, ClassId, WORD};
use crate::slab::align_up;
use std::ptr::NonNull;

pub(crate) const MARKED: u32 = 1 << 0;
/// Set on the new copy while a collection is sweeping.
pub(crate) const RELOCATED: u32 = 1 << 1;

/// Precedes every payload.
///
/// `forward` is zero except between relocation and sweeping, when the old copy
/// of a live object points at its new copy.
#[repr(C)]
pub(crate) struct Header {
    class: ClassId,
    flags: u32,
    handle: u32,
    extra: u32,
    forward: usize,
}

pub(crate) const HEADER_BYTES: usize = std::mem::size_of::<Header>();

/// Where an object of a given class starts, how far its payload sits from
/// the header and how many bytes the whole thing spans.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub align: usize,
    pub payload: usize,
    pub size: usize,
}

impl Layout {
    pub fn of(descriptor: &ClassDescriptor, extra: usize) -> Option<Layout> {
        if extra > u32::MAX as usize {
            return None;
        }

        let align = descriptor.align().max(WORD);
        let payload = align_up(HEADER_BYTES, align);
        let size = descriptor
            .payload_bytes(extra)?
            .checked_add(payload)?
            .checked_add(WORD - 1)?
            & !(WORD - 1);

        Some(Layout { align, payload, size })
    }
}

/// A pointer to a header inside an active or retiring slab.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct ObjRef(NonNull<Header>);

impl ObjRef {
    /// # Safety
    /// `addr` must be the start of an object written by [`ObjRef::init`] whose
    /// slab has not been released.
    #[inline]
    pub unsafe fn from_addr(addr: usize) -> ObjRef {
        debug_assert!(addr != 0 && addr % WORD == 0);
        ObjRef(NonNull::new_unchecked(addr as *mut Header))
    }

    /// Writes a fresh header and zeroes `payload_bytes` after it.
    ///
    /// # Safety
    /// `addr..addr + layout.size` must be unused memory in a live slab.
    pub unsafe fn init(addr: usize, layout: Layout, class: ClassId, extra: usize) -> ObjRef {
        let ptr = addr as *mut u8;
        ptr.write_bytes(0, layout.size);
        ptr.cast::<Header>().write(Header {
            class,
            flags: 0,
            handle: 0,
            extra: extra as u32,
            forward: 0,
        });
        ObjRef::from_addr(addr)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut Header {
        unsafe { self.0.as_mut() }
    }

    #[inline]
    pub fn class(self) -> ClassId {
        self.header().class
    }

    #[inline]
    pub fn extra(self) -> usize {
        self.header().extra as usize
    }

    #[inline]
    pub fn handle_index(self) -> u32 {
        self.header().handle
    }

    pub fn set_handle_index(mut self, index: u32) {
        self.header_mut().handle = index;
    }

    #[inline]
    pub fn flags(self) -> u32 {
        self.header().flags
    }

    #[inline]
    pub fn set_flags(mut self, flags: u32) {
        self.header_mut().flags = flags;
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.flags() & MARKED != 0
    }

    #[inline]
    pub fn forward(self) -> usize {
        self.header().forward
    }

    #[inline]
    pub fn set_forward(mut self, addr: usize) {
        self.header_mut().forward = addr;
    }

    #[inline]
    pub fn payload(self, layout_payload: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(layout_payload)) }
    }

    /// Reads the word at `offset` bytes into the payload.
    #[inline]
    pub fn read_word(self, payload: usize, offset: usize) -> usize {
        unsafe { self.payload(payload).as_ptr().add(offset).cast::<usize>().read() }
    }

    #[inline]
    pub fn write_word(self, payload: usize, offset: usize, value: usize) {
        unsafe {
            self.payload(payload)
                .as_ptr()
                .add(offset)
                .cast::<usize>()
                .write(value)
        }
    }

    /// Copies the whole object to `to`, which becomes a header with no flags set.
    ///
    /// # Safety
    /// `to..to + size` must be unused memory in a live slab, disjoint from `self`.
    pub unsafe fn copy_to(self, to: usize, size: usize) -> ObjRef {
        std::ptr::copy_nonoverlapping(self.addr() as *const u8, to as *mut u8, size);
        let copy = ObjRef::from_addr(to);
        copy.set_flags(0);
        copy.set_forward(0);
        copy
    }
}
