//! The heap and its stop-the-world mark-and-compact collector.
//!
//! A collection runs `Idle -> Marking -> Relocating -> Sweeping -> Idle` to
//! completion:
//!
//! 1. **Marking** sets the mark bit on everything reachable from the roots,
//!    breadth first, remembering discovery order.
//! 2. **Relocating** copies every marked object, in discovery order, into fresh
//!    slabs and leaves a forwarding address in the old header. Then every traced
//!    slot of every copy and every handle table entry is pointed at the new copies.
//! 3. **Sweeping** vacates the handles of unmarked objects and gives the old slabs
//!    back to the allocator.
//!
//! Target slabs are mapped while the old ones are still live. If that fails the
//! collection is abandoned before anything observable has changed.

use crate::class::{ClassDescriptor, ClassId, ClassRegistry, Tail, TraceEntry, WORD};
use crate::config::HeapConfig;
use crate::error::{GcError, Result};
use crate::handle::{Handle, HandleTable};
use crate::interner::Interner;
use crate::object::{Layout, ObjRef, MARKED, RELOCATED};
use crate::roots::{Root, RootScanner, RootSet, RootSource, ScannerId};
use crate::slab::{Slab, SlabAllocator};
use serde::Serialize;
use std::ptr::NonNull;
use std::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum GcPhase {
    Idle,
    Marking,
    Relocating,
    Sweeping,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GcStats {
    pub collections: u64,
    pub objects_allocated: u64,
    pub bytes_allocated: u64,
    pub bytes_copied: u64,
    pub objects_reclaimed: u64,
    /// Bytes that survived the last collection.
    pub live_bytes: usize,
    pub live_handles: usize,
    /// Explicitly registered roots.
    pub roots: usize,
    pub used_bytes: usize,
    pub slab_bytes: usize,
    pub mapped_bytes: usize,
    pub pooled_slabs: usize,
    pub slabs_acquired: u64,
    pub slabs_released: u64,
    pub array_reallocations: u64,
    pub table_resizes: u64,
    pub last_pause_micros: u64,
}

/// The process context for everything heap related: classes, slabs, handles,
/// interned strings and roots. Build one per runtime and pass it around.
pub struct Heap {
    config: HeapConfig,
    classes: ClassRegistry,
    slabs: SlabAllocator,
    space: Vec<Slab>,
    handles: HandleTable,
    interner: Interner,
    roots: RootSet,
    phase: GcPhase,
    threshold: usize,
    stats: GcStats,
}

fn mark_object(addr: usize, live: &mut Vec<ObjRef>) {
    let obj = unsafe { ObjRef::from_addr(addr) };
    if !obj.is_marked() {
        obj.set_flags(obj.flags() | MARKED);
        live.push(obj);
    }
}

fn bump_into(space: &mut [Slab], size: usize, align: usize) -> Option<usize> {
    let slab = space.last_mut()?;
    let offset = slab.bump_alloc(size, align).ok()?;
    Some(slab.base() as usize + offset)
}

/// Bumps the first object into a fresh slab and adds the slab to `space`.
/// Oversized slabs go behind the current one so its free tail stays in use.
fn install(
    space: &mut Vec<Slab>,
    granularity: usize,
    mut slab: Slab,
    size: usize,
    align: usize,
) -> Result<usize> {
    let offset = slab.bump_alloc(size, align)?;
    let addr = slab.base() as usize + offset;

    if slab.capacity() > granularity && !space.is_empty() {
        let current = space.len() - 1;
        space.insert(current, slab);
    } else {
        space.push(slab);
    }

    Ok(addr)
}

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            slabs: SlabAllocator::new(config.slab_bytes, config.max_heap_bytes, config.slab_pool),
            threshold: config.min_collect_bytes,
            config,
            classes: ClassRegistry::new(),
            space: Vec::new(),
            handles: HandleTable::new(),
            interner: Interner::new(),
            roots: RootSet::new(),
            phase: GcPhase::Idle,
            stats: GcStats::default(),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn register(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
    ) -> Result<ClassId> {
        self.classes.register(name, size, align, trace)
    }

    pub fn register_bytes(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
    ) -> Result<ClassId> {
        self.classes.register_bytes(name, size, align, trace)
    }

    pub fn lookup_class(&self, name: &str) -> Result<ClassId> {
        self.classes.lookup(name).map(ClassDescriptor::id)
    }

    /// Bytes bumped into the active slabs, padding included.
    pub fn used_bytes(&self) -> usize {
        self.space.iter().map(Slab::used).sum()
    }

    pub fn slab_bytes(&self) -> usize {
        self.space.iter().map(Slab::capacity).sum()
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            live_handles: self.handles.len(),
            roots: self.roots.len(),
            used_bytes: self.used_bytes(),
            slab_bytes: self.slab_bytes(),
            mapped_bytes: self.slabs.bytes_mapped(),
            pooled_slabs: self.slabs.pooled(),
            slabs_acquired: self.slabs.slabs_acquired(),
            slabs_released: self.slabs.slabs_released(),
            ..self.stats.clone()
        }
    }

    pub(crate) fn note_array_growth(&mut self) {
        self.stats.array_reallocations += 1;
    }

    pub(crate) fn note_table_resize(&mut self) {
        self.stats.table_resizes += 1;
    }

    // Allocation

    /// Allocates an instance of `class` with `extra` tail elements and returns a
    /// held handle to it. The payload starts zeroed; a reference run starts with
    /// its length word set to `extra` and every slot null.
    pub fn allocate(&mut self, class: ClassId, extra: usize) -> Result<Handle> {
        debug_assert_eq!(self.phase, GcPhase::Idle);

        let descriptor = self.classes.get(class);
        let run = descriptor.run_offset();
        let layout = Layout::of(descriptor, extra).ok_or(GcError::OutOfMemory {
            requested: usize::MAX,
            limit: self.config.max_heap_bytes,
        })?;

        let addr = self.reserve(layout.size, layout.align)?;

        let obj = unsafe { ObjRef::init(addr, layout, class, extra) };
        if let Some(offset) = run {
            obj.write_word(layout.payload, offset, extra);
        }

        let handle = self.handles.allocate_entry(addr);
        obj.set_handle_index(handle.index());

        self.stats.objects_allocated += 1;
        self.stats.bytes_allocated += layout.size as u64;

        Ok(handle)
    }

    fn reserve(&mut self, size: usize, align: usize) -> Result<usize> {
        if let Some(addr) = bump_into(&mut self.space, size, align) {
            return Ok(addr);
        }

        if self.should_collect(size) {
            match self.collect() {
                Ok(()) => {
                    if let Some(addr) = bump_into(&mut self.space, size, align) {
                        return Ok(addr);
                    }
                }
                // Too little headroom to relocate everything live; a new slab may still fit.
                Err(GcError::OutOfMemory { .. }) => {
                    tracing::debug!(size, "collection could not relocate, growing instead")
                }
                Err(err) => return Err(err),
            }
        }

        let slab = self.slabs.acquire_slab(size)?;
        install(&mut self.space, self.slabs.granularity(), slab, size, align)
    }

    /// Collect when the used bytes cross the adaptive threshold, or when mapping
    /// a slab for `size` would leave too little room under the limit to relocate
    /// the survivors later.
    fn should_collect(&self, size: usize) -> bool {
        let used = self.used_bytes();
        if used == 0 {
            return false;
        }

        let total = self.slab_bytes();
        let over_threshold =
            used >= self.threshold && used as f64 > self.config.high_water as f64 * total as f64;

        over_threshold || self.near_limit(size)
    }

    fn near_limit(&self, size: usize) -> bool {
        let relocation = self.slabs.slab_size(self.stats.live_bytes);

        match self.slabs.slab_size(size).checked_add(relocation) {
            Some(needed) => self.slabs.available() < needed,
            None => true,
        }
    }

    // Dereferencing

    fn object(&self, handle: Handle) -> Result<ObjRef> {
        let addr = self.handles.deref(handle)?;
        Ok(unsafe { ObjRef::from_addr(addr) })
    }

    fn layout(&self, obj: ObjRef) -> Layout {
        match Layout::of(self.classes.get(obj.class()), obj.extra()) {
            Some(layout) => layout,
            None => unreachable!("object at {:#x} was allocated without a layout", obj.addr()),
        }
    }

    fn class_name(&self, class: ClassId) -> String {
        self.classes.get(class).name().to_string()
    }

    fn expect_class(&self, handle: Handle, class: ClassId) -> Result<ObjRef> {
        let obj = self.object(handle)?;
        if obj.class() != class {
            return Err(GcError::WrongType {
                expected: self.class_name(class),
                found: self.class_name(obj.class()),
            });
        }
        Ok(obj)
    }

    fn address_of(&self, value: Option<Handle>) -> Result<usize> {
        match value {
            Some(handle) => self.handles.deref(handle),
            None => Ok(0),
        }
    }

    fn handle_of(&self, addr: usize) -> Option<Handle> {
        if addr == 0 {
            return None;
        }

        let obj = unsafe { ObjRef::from_addr(addr) };
        let handle = self.handles.handle_at(obj.handle_index());
        debug_assert!(handle.is_some(), "reference to a vacated object at {addr:#x}");
        handle
    }

    /// The payload address of `handle`'s object. Valid until the next allocation
    /// or collection.
    pub fn deref(&self, handle: Handle) -> Result<NonNull<u8>> {
        let obj = self.object(handle)?;
        Ok(obj.payload(self.layout(obj).payload))
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.handles.deref(handle).is_ok()
    }

    pub fn class_of(&self, handle: Handle) -> Result<ClassId> {
        self.object(handle).map(ObjRef::class)
    }

    pub fn descriptor(&self, handle: Handle) -> Result<&ClassDescriptor> {
        let obj = self.object(handle)?;
        Ok(self.classes.get(obj.class()))
    }

    /// Tail elements the object was allocated with.
    pub fn tail_len(&self, handle: Handle) -> Result<usize> {
        self.object(handle).map(ObjRef::extra)
    }

    /// Reads the reference at a [`TraceEntry::Ref`] offset.
    pub fn read_ref(&self, handle: Handle, offset: usize) -> Result<Option<Handle>> {
        let obj = self.object(handle)?;
        if !self.classes.get(obj.class()).is_ref_field(offset) {
            return Err(GcError::InvalidField {
                class: obj.class(),
                offset,
            });
        }

        let payload = self.layout(obj).payload;
        Ok(self.handle_of(obj.read_word(payload, offset)))
    }

    pub fn write_ref(&mut self, handle: Handle, offset: usize, value: Option<Handle>) -> Result<()> {
        let obj = self.object(handle)?;
        if !self.classes.get(obj.class()).is_ref_field(offset) {
            return Err(GcError::InvalidField {
                class: obj.class(),
                offset,
            });
        }

        let target = self.address_of(value)?;
        let payload = self.layout(obj).payload;
        obj.write_word(payload, offset, target);
        Ok(())
    }

    /// Reads an untraced word.
    pub fn read_word(&self, handle: Handle, offset: usize) -> Result<usize> {
        let obj = self.object(handle)?;
        if !self.classes.get(obj.class()).is_data_word(offset) {
            return Err(GcError::InvalidField {
                class: obj.class(),
                offset,
            });
        }

        Ok(obj.read_word(self.layout(obj).payload, offset))
    }

    pub fn write_word(&mut self, handle: Handle, offset: usize, value: usize) -> Result<()> {
        let obj = self.object(handle)?;
        if !self.classes.get(obj.class()).is_data_word(offset) {
            return Err(GcError::InvalidField {
                class: obj.class(),
                offset,
            });
        }

        obj.write_word(self.layout(obj).payload, offset, value);
        Ok(())
    }

    /// `(object, payload offset, run offset, run length)`.
    fn run(&self, handle: Handle) -> Result<(ObjRef, usize, usize, usize)> {
        let obj = self.object(handle)?;
        let descriptor = self.classes.get(obj.class());
        let offset = descriptor.run_offset().ok_or(GcError::InvalidField {
            class: obj.class(),
            offset: descriptor.size(),
        })?;

        let payload = self.layout(obj).payload;
        let len = obj.read_word(payload, offset);
        Ok((obj, payload, offset, len))
    }

    pub fn run_len(&self, handle: Handle) -> Result<usize> {
        self.run(handle).map(|(_, _, _, len)| len)
    }

    pub fn run_get(&self, handle: Handle, index: usize) -> Result<Option<Handle>> {
        let (obj, payload, offset, len) = self.run(handle)?;
        if index >= len {
            return Err(GcError::IndexOutOfRange { index, len });
        }

        Ok(self.handle_of(obj.read_word(payload, offset + WORD * (index + 1))))
    }

    pub fn run_set(&mut self, handle: Handle, index: usize, value: Option<Handle>) -> Result<()> {
        let (obj, payload, offset, len) = self.run(handle)?;
        if index >= len {
            return Err(GcError::IndexOutOfRange { index, len });
        }

        let target = self.address_of(value)?;
        obj.write_word(payload, offset + WORD * (index + 1), target);
        Ok(())
    }

    /// Copies the first `count` slots of one reference run into another.
    pub(crate) fn copy_run(&mut self, from: Handle, to: Handle, count: usize) -> Result<()> {
        let (source, source_payload, source_offset, source_len) = self.run(from)?;
        let (dest, dest_payload, dest_offset, dest_len) = self.run(to)?;
        if count > source_len || count > dest_len {
            return Err(GcError::IndexOutOfRange {
                index: count,
                len: source_len.min(dest_len),
            });
        }

        unsafe {
            let src = source.payload(source_payload).as_ptr().add(source_offset + WORD);
            let dst = dest.payload(dest_payload).as_ptr().add(dest_offset + WORD);
            std::ptr::copy_nonoverlapping(src, dst, count * WORD);
        }
        Ok(())
    }

    /// The byte tail of an object whose class was registered with
    /// [`Heap::register_bytes`], or a string.
    pub fn bytes(&self, handle: Handle) -> Result<&[u8]> {
        let obj = self.object(handle)?;
        let descriptor = self.classes.get(obj.class());
        if descriptor.tail() != Tail::Bytes {
            return Err(GcError::InvalidField {
                class: obj.class(),
                offset: descriptor.size(),
            });
        }

        let payload = self.layout(obj).payload;
        unsafe {
            let start = obj.payload(payload).as_ptr().add(descriptor.size());
            Ok(std::slice::from_raw_parts(start, obj.extra()))
        }
    }

    pub fn allocate_bytes(&mut self, class: ClassId, data: &[u8]) -> Result<Handle> {
        let descriptor = self.classes.get(class);
        if descriptor.tail() != Tail::Bytes {
            return Err(GcError::InvalidField {
                class,
                offset: descriptor.size(),
            });
        }
        let fixed = descriptor.size();

        let handle = self.allocate(class, data.len())?;
        unsafe {
            let start = self.deref(handle)?.as_ptr().add(fixed);
            std::ptr::copy_nonoverlapping(data.as_ptr(), start, data.len());
        }
        Ok(handle)
    }

    // Built-in classes

    fn alloc_scalar<T: Copy>(&mut self, class: ClassId, value: T) -> Result<Handle> {
        debug_assert!(std::mem::size_of::<T>() <= self.classes.get(class).size());

        let handle = self.allocate(class, 0)?;
        unsafe { self.deref(handle)?.as_ptr().cast::<T>().write(value) };
        Ok(handle)
    }

    fn scalar<T: Copy>(&self, handle: Handle, class: ClassId) -> Result<T> {
        let obj = self.expect_class(handle, class)?;
        let payload = obj.payload(self.layout(obj).payload);
        Ok(unsafe { payload.as_ptr().cast::<T>().read() })
    }

    pub fn alloc_int(&mut self, value: i64) -> Result<Handle> {
        self.alloc_scalar(ClassId::INT, value)
    }

    pub fn int(&self, handle: Handle) -> Result<i64> {
        self.scalar(handle, ClassId::INT)
    }

    pub fn alloc_float(&mut self, value: f64) -> Result<Handle> {
        self.alloc_scalar(ClassId::FLOAT, value)
    }

    pub fn float(&self, handle: Handle) -> Result<f64> {
        self.scalar(handle, ClassId::FLOAT)
    }

    pub fn alloc_bool(&mut self, value: bool) -> Result<Handle> {
        self.alloc_scalar(ClassId::BOOL, value as u8)
    }

    pub fn bool(&self, handle: Handle) -> Result<bool> {
        self.scalar::<u8>(handle, ClassId::BOOL).map(|byte| byte != 0)
    }

    pub fn alloc_char(&mut self, value: char) -> Result<Handle> {
        self.alloc_scalar(ClassId::CHAR, value as u32)
    }

    pub fn char(&self, handle: Handle) -> Result<char> {
        let code = self.scalar::<u32>(handle, ClassId::CHAR)?;
        char::from_u32(code).ok_or_else(|| GcError::Corrupt(format!("invalid char {code:#x} in {handle}")))
    }

    /// A fresh, uninterned string.
    pub fn alloc_string(&mut self, bytes: &[u8]) -> Result<Handle> {
        self.allocate_bytes(ClassId::STRING, bytes)
    }

    pub fn string(&self, handle: Handle) -> Result<&[u8]> {
        self.expect_class(handle, ClassId::STRING)?;
        self.bytes(handle)
    }

    pub fn cons(&mut self, car: Option<Handle>, cdr: Option<Handle>) -> Result<Handle> {
        // Both fields must survive a collection triggered by the allocation.
        let held: Vec<Handle> = car.into_iter().chain(cdr).collect();
        let cell = self.with_held(&held, |heap| heap.allocate(ClassId::CONS, 0))?;
        self.write_ref(cell, 0, car)?;
        self.write_ref(cell, WORD, cdr)?;
        Ok(cell)
    }

    pub fn car(&self, cell: Handle) -> Result<Option<Handle>> {
        self.expect_class(cell, ClassId::CONS)?;
        self.read_ref(cell, 0)
    }

    pub fn cdr(&self, cell: Handle) -> Result<Option<Handle>> {
        self.expect_class(cell, ClassId::CONS)?;
        self.read_ref(cell, WORD)
    }

    pub fn set_car(&mut self, cell: Handle, value: Option<Handle>) -> Result<()> {
        self.expect_class(cell, ClassId::CONS)?;
        self.write_ref(cell, 0, value)
    }

    pub fn set_cdr(&mut self, cell: Handle, value: Option<Handle>) -> Result<()> {
        self.expect_class(cell, ClassId::CONS)?;
        self.write_ref(cell, WORD, value)
    }

    /// Backing storage: `len` null slots.
    pub fn alloc_vector(&mut self, len: usize) -> Result<Handle> {
        self.allocate(ClassId::VECTOR, len)
    }

    // Holds and roots

    /// Adds a hold on `handle`, keeping it alive until a matching [`Heap::release`].
    pub fn retain(&mut self, handle: Handle) -> Result<()> {
        if self.is_interned(handle) {
            return Ok(());
        }
        self.handles.retain(handle)
    }

    /// Drops one hold on `handle`. The object is reclaimed by the next collection
    /// that cannot reach it. Interned strings are permanent, so releasing one is a no-op.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        if self.is_interned(handle) {
            return Ok(());
        }
        self.handles.release(handle)
    }

    /// Runs `f` with every handle in `held` retained, so allocations inside `f`
    /// cannot reclaim them. Fails with [`GcError::StaleHandle`] before running `f`
    /// if any of them is already gone.
    pub(crate) fn with_held<T>(
        &mut self,
        held: &[Handle],
        f: impl FnOnce(&mut Heap) -> Result<T>,
    ) -> Result<T> {
        for (i, &handle) in held.iter().enumerate() {
            if let Err(err) = self.retain(handle) {
                for &retained in &held[..i] {
                    self.release(retained)?;
                }
                return Err(err);
            }
        }

        let result = f(self);
        for &handle in held {
            self.release(handle)?;
        }
        result
    }

    pub fn holds(&self, handle: Handle) -> Result<u32> {
        self.handles.holds(handle)
    }

    pub fn register_root(&mut self, handle: Handle) -> Result<()> {
        self.register_root_from(RootSource::DEFAULT, handle)
    }

    pub fn register_root_from(&mut self, source: RootSource, handle: Handle) -> Result<()> {
        self.handles.deref(handle)?;
        self.roots.register(source, handle);
        Ok(())
    }

    pub fn unregister_root(&mut self, handle: Handle) -> Result<()> {
        self.unregister_root_from(RootSource::DEFAULT, handle)
    }

    pub fn unregister_root_from(&mut self, source: RootSource, handle: Handle) -> Result<()> {
        if self.roots.unregister(source, handle) {
            Ok(())
        } else {
            Err(GcError::NotRooted(handle))
        }
    }

    pub fn unregister_source(&mut self, source: RootSource) -> usize {
        self.roots.unregister_source(source)
    }

    /// Explicitly registered roots, in registration order.
    pub fn roots(&self) -> &[Root] {
        self.roots.roots()
    }

    pub fn add_scanner(&mut self, scanner: impl RootScanner + 'static) -> ScannerId {
        self.roots.add_scanner(Box::new(scanner))
    }

    pub fn remove_scanner(&mut self, id: ScannerId) -> bool {
        self.roots.remove_scanner(id).is_some()
    }

    /// Is `handle` kept alive by something other than tracing?
    pub fn is_rooted(&self, handle: Handle) -> bool {
        self.roots.contains(handle)
            || self.handles.holds(handle).map_or(false, |holds| holds > 0)
            || self.is_interned(handle)
    }

    // Interning

    /// The canonical string for `bytes`. The same bytes always give the same
    /// handle, and interned strings are never collected.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<Handle> {
        if let Some(handle) = self.interner.lookup(bytes) {
            return Ok(handle);
        }

        let handle = self.alloc_string(bytes)?;
        self.interner.insert(bytes, handle);
        // The interner roots it from here on.
        self.handles.release(handle)?;

        Ok(handle)
    }

    pub fn lookup_interned(&self, bytes: &[u8]) -> Option<Handle> {
        self.interner.lookup(bytes)
    }

    pub fn is_interned(&self, handle: Handle) -> bool {
        match self.string(handle) {
            Ok(bytes) => self.interner.lookup(bytes) == Some(handle),
            Err(_) => false,
        }
    }

    pub fn interned_count(&self) -> usize {
        self.interner.len()
    }

    fn interned_bytes(&self, handle: Handle) -> Result<&[u8]> {
        let bytes = self.string(handle)?;
        if self.interner.lookup(bytes) != Some(handle) {
            return Err(GcError::WrongType {
                expected: "interned core.String".into(),
                found: "uninterned core.String".into(),
            });
        }
        Ok(bytes)
    }

    /// The interned `namespace.name`.
    pub fn qualify(&mut self, namespace: Handle, name: Handle) -> Result<Handle> {
        if let Some(qualified) = self.interner.qualified(namespace, name) {
            return Ok(qualified);
        }

        let mut path = self.interned_bytes(namespace)?.to_vec();
        path.push(b'.');
        path.extend_from_slice(self.interned_bytes(name)?);

        let qualified = self.intern(&path)?;
        self.interner.insert_qualified(namespace, name, qualified);
        Ok(qualified)
    }

    /// Interns every segment and qualifies them left to right.
    pub fn qualify_path(&mut self, segments: &[&str]) -> Result<Handle> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| GcError::NotFound("empty qualified path".into()))?;

        let mut qualified = self.intern(first.as_bytes())?;
        for segment in rest {
            let name = self.intern(segment.as_bytes())?;
            qualified = self.qualify(qualified, name)?;
        }
        Ok(qualified)
    }

    /// The `(namespace, name)` pair `qualified` was composed from by [`Heap::qualify`].
    pub fn components(&self, qualified: Handle) -> Option<(Handle, Handle)> {
        self.interner.components(qualified)
    }

    // Collection

    /// Runs a full collection now.
    pub fn collect(&mut self) -> Result<()> {
        debug_assert_eq!(self.phase, GcPhase::Idle);

        let start = Instant::now();
        let used_before = self.used_bytes();

        self.phase = GcPhase::Marking;
        let (live, live_bytes) = self.mark();
        let marked = start.elapsed();

        self.phase = GcPhase::Relocating;
        let space = match self.relocate(&live) {
            Ok(space) => space,
            Err(err) => {
                self.phase = GcPhase::Idle;
                tracing::warn!(%err, live_bytes, "collection abandoned");
                return Err(err);
            }
        };
        self.fix_up(&live);
        let relocated = start.elapsed();

        self.phase = GcPhase::Sweeping;
        let reclaimed = self.sweep(space);
        self.phase = GcPhase::Idle;

        let pause = start.elapsed();
        self.threshold = ((live_bytes as f32 * self.config.growth_factor) as usize)
            .max(self.config.min_collect_bytes);

        self.stats.collections += 1;
        self.stats.bytes_copied += live_bytes as u64;
        self.stats.objects_reclaimed += reclaimed as u64;
        self.stats.live_bytes = live_bytes;
        self.stats.last_pause_micros = pause.as_micros() as u64;

        tracing::debug!(
            collection = self.stats.collections,
            used_before,
            live_bytes,
            live_objects = live.len(),
            reclaimed,
            threshold = self.threshold,
            ?marked,
            ?relocated,
            ?pause,
            "collected"
        );

        Ok(())
    }

    /// Visits the payload offset of every traced slot of `obj`.
    fn for_each_slot(&self, obj: ObjRef, payload: usize, mut visit: impl FnMut(usize)) {
        for entry in self.classes.get(obj.class()).trace() {
            match *entry {
                TraceEntry::Ref(offset) => visit(offset),
                TraceEntry::Run(offset) => {
                    let len = obj.read_word(payload, offset);
                    for index in 0..len {
                        visit(offset + WORD * (index + 1));
                    }
                }
            }
        }
    }

    /// Marks everything reachable and returns it in discovery order, with its
    /// total size.
    fn mark(&self) -> (Vec<ObjRef>, usize) {
        let mut roots = Vec::new();
        self.roots.enumerate(&mut roots);
        roots.extend(self.handles.held());
        roots.extend_from_slice(self.interner.handles());

        // `live` doubles as the worklist: everything from `scan` on is queued.
        let mut live = Vec::new();
        for handle in roots {
            match self.handles.deref(handle) {
                Ok(addr) => mark_object(addr, &mut live),
                Err(_) => tracing::warn!(%handle, "stale handle in the root set, skipping"),
            }
        }

        let mut scan = 0;
        let mut bytes = 0;
        while scan < live.len() {
            let obj = live[scan];
            scan += 1;

            let layout = self.layout(obj);
            bytes += layout.size;

            self.for_each_slot(obj, layout.payload, |offset| {
                let target = obj.read_word(layout.payload, offset);
                if target != 0 {
                    mark_object(target, &mut live);
                }
            });
        }

        (live, bytes)
    }

    /// Copies `live` into fresh slabs and forwards the old copies.
    fn relocate(&mut self, live: &[ObjRef]) -> Result<Vec<Slab>> {
        let granularity = self.slabs.granularity();
        let mut space = Vec::new();

        for &obj in live {
            let layout = self.layout(obj);

            let to = match bump_into(&mut space, layout.size, layout.align) {
                Some(addr) => addr,
                None => {
                    let installed = self.slabs.acquire_slab(layout.size).and_then(|slab| {
                        install(&mut space, granularity, slab, layout.size, layout.align)
                    });

                    match installed {
                        Ok(addr) => addr,
                        Err(err) => {
                            self.roll_back(live, space);
                            return Err(err);
                        }
                    }
                }
            };

            let copy = unsafe { obj.copy_to(to, layout.size) };
            copy.set_flags(RELOCATED);
            obj.set_forward(to);
        }

        Ok(space)
    }

    /// Undoes a partial relocation: the old copies were never modified apart
    /// from their headers.
    fn roll_back(&mut self, live: &[ObjRef], space: Vec<Slab>) {
        for &obj in live {
            obj.set_flags(obj.flags() & !MARKED);
            obj.set_forward(0);
        }

        for slab in space {
            self.slabs.release_slab(slab);
        }
    }

    /// Points every traced slot of the new copies, and every handle, at new copies.
    fn fix_up(&mut self, live: &[ObjRef]) {
        for &old in live {
            let new = unsafe { ObjRef::from_addr(old.forward()) };
            let payload = self.layout(new).payload;

            self.for_each_slot(new, payload, |offset| {
                let target = new.read_word(payload, offset);
                if target != 0 {
                    let forward = unsafe { ObjRef::from_addr(target) }.forward();
                    debug_assert!(forward != 0, "reference to unmarked object at {target:#x}");
                    new.write_word(payload, offset, forward);
                }
            });

            self.handles.update(new.handle_index(), new.addr());
        }
    }

    /// Vacates the handles of everything left behind and retires the old slabs.
    /// Returns how many objects were reclaimed.
    fn sweep(&mut self, space: Vec<Slab>) -> usize {
        let mut dead = Vec::new();
        for (index, addr) in self.handles.live() {
            let obj = unsafe { ObjRef::from_addr(addr) };
            if obj.flags() & RELOCATED != 0 {
                obj.set_flags(0);
            } else {
                dead.push(index);
            }
        }

        for &index in &dead {
            self.handles.recycle(index);
        }

        for slab in std::mem::replace(&mut self.space, space) {
            self.slabs.release_slab(slab);
        }

        dead.len()
    }

    // Diagnostics

    fn points_at_object(&self, addr: usize) -> bool {
        if addr % WORD != 0 || !self.space.iter().any(|slab| slab.contains(addr)) {
            return false;
        }

        let obj = unsafe { ObjRef::from_addr(addr) };
        obj.forward() == 0
            && self
                .handles
                .handle_at(obj.handle_index())
                .and_then(|handle| self.handles.deref(handle).ok())
                == Some(addr)
    }

    /// Checks that every handle names an object in the active slabs, that no
    /// header is left marked or forwarded, and that every traced slot is null or
    /// points at such an object.
    pub fn verify(&self) -> Result<()> {
        for (index, addr) in self.handles.live() {
            if !self.points_at_object(addr) {
                return Err(GcError::Corrupt(format!(
                    "handle slot {index} points at {addr:#x}, which is not a live object"
                )));
            }

            let obj = unsafe { ObjRef::from_addr(addr) };
            if obj.handle_index() != index {
                return Err(GcError::Corrupt(format!(
                    "object at {addr:#x} belongs to slot {}, not {index}",
                    obj.handle_index()
                )));
            }
            if obj.flags() != 0 {
                return Err(GcError::Corrupt(format!(
                    "object at {addr:#x} still has flags {:#x}",
                    obj.flags()
                )));
            }

            let payload = self.layout(obj).payload;
            let mut dangling = None;
            self.for_each_slot(obj, payload, |offset| {
                let target = obj.read_word(payload, offset);
                if dangling.is_none() && target != 0 && !self.points_at_object(target) {
                    dangling = Some((offset, target));
                }
            });

            if let Some((offset, target)) = dangling {
                return Err(GcError::Corrupt(format!(
                    "{} at {addr:#x}: slot {offset} dangles to {target:#x}",
                    self.class_name(obj.class())
                )));
            }
        }

        Ok(())
    }
}
