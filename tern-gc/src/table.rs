//! Hash tables keyed by heap objects.
//!
//! A `core.Hashtable` is three words: entry count, bucket capacity and a
//! reference to a [`GcArray`] of `2 * capacity` slots laid out as
//! `key, value, key, value, ...`. Collisions probe linearly, and removal shifts
//! the rest of the cluster back instead of leaving tombstones.
//!
//! Numbers, booleans, characters and strings are compared by content; anything
//! else by identity. Identity hashes come from the [`Handle`], which survives
//! compaction, so a collection never forces a rehash.

use crate::array::GcArray;
use crate::class::{ClassId, WORD};
use crate::error::{GcError, Result};
use crate::gc::Heap;
use crate::handle::Handle;
use fxhash::FxHasher;
use std::hash::{Hash, Hasher};

const COUNT: usize = 0;
const CAPACITY: usize = WORD;
const BUCKETS: usize = 2 * WORD;

fn hash_key(heap: &Heap, key: Handle) -> Result<u64> {
    let mut hasher = FxHasher::default();
    let class = heap.class_of(key)?;
    class.index().hash(&mut hasher);

    match class {
        ClassId::INT => heap.int(key)?.hash(&mut hasher),
        ClassId::FLOAT => heap.float(key)?.to_bits().hash(&mut hasher),
        ClassId::BOOL => heap.bool(key)?.hash(&mut hasher),
        ClassId::CHAR => heap.char(key)?.hash(&mut hasher),
        ClassId::STRING => heap.string(key)?.hash(&mut hasher),
        _ => key.hash(&mut hasher),
    }

    Ok(hasher.finish())
}

fn keys_equal(heap: &Heap, a: Handle, b: Handle) -> Result<bool> {
    if a == b {
        return Ok(true);
    }

    let class = heap.class_of(a)?;
    if class != heap.class_of(b)? {
        return Ok(false);
    }

    Ok(match class {
        ClassId::INT => heap.int(a)? == heap.int(b)?,
        ClassId::FLOAT => heap.float(a)?.to_bits() == heap.float(b)?.to_bits(),
        ClassId::BOOL => heap.bool(a)? == heap.bool(b)?,
        ClassId::CHAR => heap.char(a)? == heap.char(b)?,
        ClassId::STRING => heap.string(a)? == heap.string(b)?,
        _ => false,
    })
}

/// Result of probing for a key.
enum Probe {
    Found(usize),
    Vacant(usize),
}

/// A handle known to name a `core.Hashtable`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GcTable(Handle);

impl GcTable {
    /// An empty table with the configured initial capacity.
    pub fn new(heap: &mut Heap) -> Result<Self> {
        let capacity = heap.config().table_initial_capacity;
        Self::with_capacity(heap, capacity)
    }

    /// An empty table with at least `capacity` buckets, rounded up to a power of two.
    pub fn with_capacity(heap: &mut Heap, capacity: usize) -> Result<Self> {
        let too_big = GcError::OutOfMemory {
            requested: usize::MAX,
            limit: heap.config().max_heap_bytes,
        };
        let capacity = capacity
            .max(1)
            .checked_next_power_of_two()
            .filter(|capacity| capacity.checked_mul(2).is_some())
            .ok_or(too_big)?;

        let table = heap.allocate(ClassId::HASHTABLE, 0)?;
        let buckets = heap.with_held(&[table], |heap| GcArray::filled(heap, 2 * capacity));
        let buckets = match buckets {
            Ok(buckets) => buckets,
            Err(err) => {
                heap.release(table)?;
                return Err(err);
            }
        };

        heap.write_word(table, CAPACITY, capacity)?;
        heap.write_ref(table, BUCKETS, Some(buckets.handle()))?;
        heap.release(buckets.handle())?;

        Ok(GcTable(table))
    }

    pub fn from_handle(heap: &Heap, handle: Handle) -> Result<Self> {
        let class = heap.class_of(handle)?;
        if class != ClassId::HASHTABLE {
            return Err(GcError::WrongType {
                expected: heap.classes().get(ClassId::HASHTABLE).name().to_string(),
                found: heap.classes().get(class).name().to_string(),
            });
        }
        Ok(GcTable(handle))
    }

    pub fn handle(self) -> Handle {
        self.0
    }

    pub fn len(self, heap: &Heap) -> Result<usize> {
        heap.read_word(self.0, COUNT)
    }

    pub fn is_empty(self, heap: &Heap) -> Result<bool> {
        self.len(heap).map(|len| len == 0)
    }

    /// Buckets, not entries.
    pub fn capacity(self, heap: &Heap) -> Result<usize> {
        heap.read_word(self.0, CAPACITY)
    }

    fn buckets(self, heap: &Heap) -> Result<GcArray> {
        match heap.read_ref(self.0, BUCKETS)? {
            Some(handle) => Ok(GcArray::from_handle(heap, handle)?),
            None => Err(GcError::Corrupt(format!("table {} has no buckets", self.0))),
        }
    }

    fn probe(heap: &Heap, buckets: GcArray, capacity: usize, key: Handle) -> Result<Probe> {
        let mask = capacity - 1;
        let mut index = hash_key(heap, key)? as usize & mask;

        loop {
            match buckets.get(heap, 2 * index)? {
                None => return Ok(Probe::Vacant(index)),
                Some(existing) if keys_equal(heap, existing, key)? => return Ok(Probe::Found(index)),
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    fn find(self, heap: &Heap, key: Handle) -> Result<Option<(GcArray, usize)>> {
        let buckets = self.buckets(heap)?;
        match Self::probe(heap, buckets, self.capacity(heap)?, key)? {
            Probe::Found(index) => Ok(Some((buckets, index))),
            Probe::Vacant(_) => Ok(None),
        }
    }

    pub fn get(self, heap: &Heap, key: Handle) -> Result<Option<Handle>> {
        match self.find(heap, key)? {
            Some((buckets, index)) => buckets.get(heap, 2 * index + 1),
            None => Ok(None),
        }
    }

    pub fn contains_key(self, heap: &Heap, key: Handle) -> Result<bool> {
        self.find(heap, key).map(|found| found.is_some())
    }

    /// Maps `key` to `value` and returns the value it replaced. An equal key
    /// already in the table is kept; only its value changes.
    pub fn insert(self, heap: &mut Heap, key: Handle, value: Handle) -> Result<Option<Handle>> {
        // Check both before anything is modified.
        heap.class_of(value)?;
        if let Some((buckets, index)) = self.find(heap, key)? {
            let previous = buckets.get(heap, 2 * index + 1)?;
            buckets.set(heap, 2 * index + 1, Some(value))?;
            return Ok(previous);
        }

        let count = self.len(heap)?;
        let capacity = self.capacity(heap)?;
        if (count + 1) as f32 > capacity as f32 * heap.config().table_load_factor {
            let grown = capacity.checked_mul(2).ok_or(GcError::OutOfMemory {
                requested: usize::MAX,
                limit: heap.config().max_heap_bytes,
            })?;
            heap.with_held(&[self.0, key, value], |heap| self.resize(heap, grown))?;
        }

        let buckets = self.buckets(heap)?;
        match Self::probe(heap, buckets, self.capacity(heap)?, key)? {
            Probe::Vacant(index) => {
                buckets.set(heap, 2 * index, Some(key))?;
                buckets.set(heap, 2 * index + 1, Some(value))?;
            }
            Probe::Found(_) => unreachable!("key appeared during resize"),
        }

        heap.write_word(self.0, COUNT, count + 1)?;
        Ok(None)
    }

    fn resize(self, heap: &mut Heap, capacity: usize) -> Result<()> {
        let old_capacity = self.capacity(heap)?;
        let grown = GcArray::filled(heap, 2 * capacity)?;

        let old = self.buckets(heap)?;
        for index in 0..old_capacity {
            let Some(key) = old.get(heap, 2 * index)? else {
                continue;
            };
            let value = old.get(heap, 2 * index + 1)?;

            match Self::probe(heap, grown, capacity, key)? {
                Probe::Vacant(slot) => {
                    grown.set(heap, 2 * slot, Some(key))?;
                    grown.set(heap, 2 * slot + 1, value)?;
                }
                Probe::Found(_) => {
                    return Err(GcError::Corrupt(format!("table {} holds a key twice", self.0)))
                }
            }
        }

        heap.write_ref(self.0, BUCKETS, Some(grown.handle()))?;
        heap.write_word(self.0, CAPACITY, capacity)?;
        heap.release(grown.handle())?;
        heap.note_table_resize();

        tracing::trace!(table = %self.0, old_capacity, capacity, "resized table");
        Ok(())
    }

    /// Removes `key` and returns its value.
    pub fn remove(self, heap: &mut Heap, key: Handle) -> Result<Option<Handle>> {
        let Some((buckets, mut hole)) = self.find(heap, key)? else {
            return Ok(None);
        };

        let value = buckets.get(heap, 2 * hole + 1)?;
        let mask = self.capacity(heap)? - 1;

        // Pull later members of the cluster back over the hole when that does
        // not move them in front of their home bucket.
        let mut next = (hole + 1) & mask;
        while let Some(moving) = buckets.get(heap, 2 * next)? {
            let home = hash_key(heap, moving)? as usize & mask;
            if next.wrapping_sub(home) & mask >= next.wrapping_sub(hole) & mask {
                let moving_value = buckets.get(heap, 2 * next + 1)?;
                buckets.set(heap, 2 * hole, Some(moving))?;
                buckets.set(heap, 2 * hole + 1, moving_value)?;
                hole = next;
            }
            next = (next + 1) & mask;
        }

        buckets.set(heap, 2 * hole, None)?;
        buckets.set(heap, 2 * hole + 1, None)?;

        let count = self.len(heap)?;
        heap.write_word(self.0, COUNT, count - 1)?;
        Ok(value)
    }

    /// `(key, value)` pairs in bucket order.
    pub fn entries(self, heap: &Heap) -> Result<Vec<(Handle, Handle)>> {
        let buckets = self.buckets(heap)?;
        let mut entries = Vec::with_capacity(self.len(heap)?);

        for index in 0..self.capacity(heap)? {
            if let Some(key) = buckets.get(heap, 2 * index)? {
                let value = buckets.get(heap, 2 * index + 1)?.ok_or_else(|| {
                    GcError::Corrupt(format!("table {} has a key without a value", self.0))
                })?;
                entries.push((key, value));
            }
        }

        Ok(entries)
    }

    pub fn keys(self, heap: &Heap) -> Result<Vec<Handle>> {
        Ok(self.entries(heap)?.into_iter().map(|(key, _)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{init_tracing, small_heap};

    fn int_table(heap: &mut Heap, n: i64) -> GcTable {
        let table = GcTable::new(heap).unwrap();
        for i in 0..n {
            let key = heap.alloc_int(i).unwrap();
            let value = heap.alloc_int(i * i).unwrap();
            assert_eq!(table.insert(heap, key, value), Ok(None));
            heap.release(key).unwrap();
            heap.release(value).unwrap();
        }
        table
    }

    fn lookup(heap: &mut Heap, table: GcTable, i: i64) -> Option<i64> {
        let key = heap.alloc_int(i).unwrap();
        let found = table.get(heap, key).unwrap().map(|v| heap.int(v).unwrap());
        heap.release(key).unwrap();
        found
    }

    #[test]
    fn content_keys() {
        init_tracing();
        let mut heap = small_heap();
        let table = int_table(&mut heap, 100);

        assert_eq!(table.len(&heap), Ok(100));
        for i in 0..100 {
            assert_eq!(lookup(&mut heap, table, i), Some(i * i));
        }
        assert_eq!(lookup(&mut heap, table, 100), None);
        assert!(heap.stats().table_resizes > 0);
    }

    #[test]
    fn insert_replaces_values() {
        init_tracing();
        let mut heap = small_heap();
        let table = GcTable::new(&mut heap).unwrap();

        let key = heap.alloc_string(b"name").unwrap();
        let same = heap.alloc_string(b"name").unwrap();
        let first = heap.alloc_int(1).unwrap();
        let second = heap.alloc_int(2).unwrap();

        assert_eq!(table.insert(&mut heap, key, first), Ok(None));
        assert_eq!(table.insert(&mut heap, same, second), Ok(Some(first)));
        assert_eq!(table.len(&heap), Ok(1));
        assert_eq!(table.keys(&heap), Ok(vec![key]));
        assert_eq!(table.get(&heap, key), Ok(Some(second)));
    }

    #[test]
    fn identity_keys_survive_compaction() {
        init_tracing();
        let mut heap = small_heap();
        let table = GcTable::new(&mut heap).unwrap();

        let a = heap.cons(None, None).unwrap();
        let b = heap.cons(None, None).unwrap();
        let va = heap.alloc_int(1).unwrap();
        table.insert(&mut heap, a, va).unwrap();
        heap.release(va).unwrap();

        heap.collect().unwrap();
        heap.verify().unwrap();

        let found = table.get(&heap, a).unwrap().unwrap();
        assert_eq!(heap.int(found), Ok(1));
        assert_eq!(table.get(&heap, b), Ok(None));
        assert_eq!(table.contains_key(&heap, a), Ok(true));
    }

    #[test]
    fn kinds_do_not_collide() {
        init_tracing();
        let mut heap = small_heap();
        let table = GcTable::new(&mut heap).unwrap();

        let one = heap.alloc_int(1).unwrap();
        let one_point_oh = heap.alloc_float(1.0).unwrap();
        let yes = heap.alloc_bool(true).unwrap();
        let x = heap.alloc_char('x').unwrap();

        for &key in &[one, one_point_oh, yes, x] {
            table.insert(&mut heap, key, key).unwrap();
        }
        assert_eq!(table.len(&heap), Ok(4));
        for &key in &[one, one_point_oh, yes, x] {
            assert_eq!(table.get(&heap, key), Ok(Some(key)));
        }
    }

    #[test]
    fn removal_keeps_clusters_reachable() {
        init_tracing();
        let mut heap = small_heap();
        let table = int_table(&mut heap, 200);

        for i in (0..200).step_by(3) {
            let key = heap.alloc_int(i).unwrap();
            let removed = table.remove(&mut heap, key).unwrap();
            assert_eq!(removed.map(|v| heap.int(v).unwrap()), Some(i * i));
            assert_eq!(table.remove(&mut heap, key), Ok(None));
            heap.release(key).unwrap();
        }

        heap.collect().unwrap();
        for i in 0..200 {
            let expected = if i % 3 == 0 { None } else { Some(i * i) };
            assert_eq!(lookup(&mut heap, table, i), expected, "key {i}");
        }
        assert_eq!(table.len(&heap), Ok(200 - 67));
        assert_eq!(table.entries(&heap).unwrap().len(), 200 - 67);
    }

    #[test]
    fn released_tables_are_reclaimed() {
        init_tracing();
        let mut heap = small_heap();
        let table = int_table(&mut heap, 20);
        let entries = table.entries(&heap).unwrap();

        heap.release(table.handle()).unwrap();
        heap.collect().unwrap();

        assert!(!heap.is_live(table.handle()));
        for (key, value) in entries {
            assert!(!heap.is_live(key));
            assert!(!heap.is_live(value));
        }
    }

    #[test]
    fn impossible_capacities_are_out_of_memory() {
        init_tracing();
        let mut heap = small_heap();
        let live = heap.stats().live_handles;

        for capacity in [usize::MAX, usize::MAX / 2 + 2, 1 << (usize::BITS - 2)] {
            let err = GcTable::with_capacity(&mut heap, capacity).unwrap_err();
            assert!(matches!(err, GcError::OutOfMemory { .. }), "{capacity}: {err:?}");
        }

        heap.collect().unwrap();
        assert_eq!(heap.stats().live_handles, live);
    }

    #[test]
    fn stale_keys_are_rejected() {
        init_tracing();
        let mut heap = small_heap();
        let table = GcTable::new(&mut heap).unwrap();
        let key = heap.alloc_int(0).unwrap();
        let value = heap.alloc_int(1).unwrap();
        heap.release(key).unwrap();
        heap.collect().unwrap();

        assert_eq!(table.insert(&mut heap, key, value), Err(GcError::StaleHandle(key)));
        assert_eq!(table.get(&heap, key), Err(GcError::StaleHandle(key)));
        assert_eq!(table.len(&heap), Ok(0));
    }
}
