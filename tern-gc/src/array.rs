//! Growable arrays of references.
//!
//! A `core.Array` is three words: length, capacity and a reference to a
//! `core.Vector` holding the slots. Growing allocates a new vector twice the
//! size, copies the prefix over and drops the old one on the floor for the next
//! collection.

use crate::class::{ClassId, WORD};
use crate::error::{GcError, Result};
use crate::gc::Heap;
use crate::handle::Handle;

const LEN: usize = 0;
const CAPACITY: usize = WORD;
const BACKING: usize = 2 * WORD;

const MIN_CAPACITY: usize = 4;

/// A handle known to name a `core.Array`.
///
/// All operations go through the [`Heap`]; the wrapper itself is just a
/// [`Handle`] and is rooted, retained and released like any other.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GcArray(Handle);

impl GcArray {
    pub fn new(heap: &mut Heap) -> Result<Self> {
        Self::with_capacity(heap, 0)
    }

    /// An empty array with room for `capacity` elements. Like any allocation the
    /// returned handle is held once.
    pub fn with_capacity(heap: &mut Heap, capacity: usize) -> Result<Self> {
        let array = heap.allocate(ClassId::ARRAY, 0)?;
        if capacity == 0 {
            return Ok(GcArray(array));
        }

        let backing = heap.with_held(&[array], |heap| heap.alloc_vector(capacity));
        let backing = match backing {
            Ok(backing) => backing,
            Err(err) => {
                heap.release(array)?;
                return Err(err);
            }
        };

        heap.write_word(array, CAPACITY, capacity)?;
        heap.write_ref(array, BACKING, Some(backing))?;
        heap.release(backing)?;

        Ok(GcArray(array))
    }

    /// An array of `len` null elements.
    pub fn filled(heap: &mut Heap, len: usize) -> Result<Self> {
        let array = Self::with_capacity(heap, len)?;
        heap.write_word(array.0, LEN, len)?;
        Ok(array)
    }

    pub fn from_handle(heap: &Heap, handle: Handle) -> Result<Self> {
        let class = heap.class_of(handle)?;
        if class != ClassId::ARRAY {
            return Err(GcError::WrongType {
                expected: heap.classes().get(ClassId::ARRAY).name().to_string(),
                found: heap.classes().get(class).name().to_string(),
            });
        }
        Ok(GcArray(handle))
    }

    pub fn handle(self) -> Handle {
        self.0
    }

    pub fn len(self, heap: &Heap) -> Result<usize> {
        heap.read_word(self.0, LEN)
    }

    pub fn is_empty(self, heap: &Heap) -> Result<bool> {
        self.len(heap).map(|len| len == 0)
    }

    pub fn capacity(self, heap: &Heap) -> Result<usize> {
        heap.read_word(self.0, CAPACITY)
    }

    fn backing(self, heap: &Heap) -> Result<Handle> {
        heap.read_ref(self.0, BACKING)?
            .ok_or_else(|| GcError::Corrupt(format!("array {} has slots but no backing", self.0)))
    }

    fn check(self, heap: &Heap, index: usize) -> Result<()> {
        let len = self.len(heap)?;
        if index >= len {
            return Err(GcError::IndexOutOfRange { index, len });
        }
        Ok(())
    }

    pub fn get(self, heap: &Heap, index: usize) -> Result<Option<Handle>> {
        self.check(heap, index)?;
        heap.run_get(self.backing(heap)?, index)
    }

    pub fn set(self, heap: &mut Heap, index: usize, value: Option<Handle>) -> Result<()> {
        self.check(heap, index)?;
        let backing = self.backing(heap)?;
        heap.run_set(backing, index, value)
    }

    /// Appends `value`, doubling the capacity when full.
    pub fn push(self, heap: &mut Heap, value: Option<Handle>) -> Result<()> {
        let len = self.len(heap)?;
        if len == self.capacity(heap)? {
            let mut held = vec![self.0];
            held.extend(value);
            heap.with_held(&held, |heap| self.grow(heap, len))?;
        }

        let backing = self.backing(heap)?;
        heap.run_set(backing, len, value)?;
        heap.write_word(self.0, LEN, len + 1)
    }

    fn grow(self, heap: &mut Heap, len: usize) -> Result<()> {
        let old_capacity = self.capacity(heap)?;
        let capacity = (old_capacity * 2).max(MIN_CAPACITY);

        let grown = heap.alloc_vector(capacity)?;
        if len > 0 {
            let old = self.backing(heap)?;
            heap.copy_run(old, grown, len)?;
        }

        heap.write_ref(self.0, BACKING, Some(grown))?;
        heap.write_word(self.0, CAPACITY, capacity)?;
        heap.release(grown)?;
        heap.note_array_growth();

        tracing::trace!(array = %self.0, old_capacity, capacity, "grew array");
        Ok(())
    }

    /// Removes and returns the last element.
    pub fn pop(self, heap: &mut Heap) -> Result<Option<Handle>> {
        let len = self.len(heap)?;
        if len == 0 {
            return Err(GcError::IndexOutOfRange { index: 0, len: 0 });
        }

        let backing = self.backing(heap)?;
        let value = heap.run_get(backing, len - 1)?;
        // Popped elements must not stay reachable through the spare capacity.
        heap.run_set(backing, len - 1, None)?;
        heap.write_word(self.0, LEN, len - 1)?;
        Ok(value)
    }

    /// Removes every element, keeping the capacity.
    pub fn clear(self, heap: &mut Heap) -> Result<()> {
        let len = self.len(heap)?;
        if len > 0 {
            let backing = self.backing(heap)?;
            for index in 0..len {
                heap.run_set(backing, index, None)?;
            }
        }
        heap.write_word(self.0, LEN, 0)
    }

    /// The elements in index order.
    pub fn to_vec(self, heap: &Heap) -> Result<Vec<Option<Handle>>> {
        let len = self.len(heap)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let backing = self.backing(heap)?;
        (0..len).map(|index| heap.run_get(backing, index)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{init_tracing, small_heap};

    fn ints(heap: &mut Heap, array: GcArray) -> Vec<i64> {
        array
            .to_vec(heap)
            .unwrap()
            .into_iter()
            .map(|value| heap.int(value.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn push_get_set() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::new(&mut heap).unwrap();
        assert_eq!(array.capacity(&heap), Ok(0));

        for i in 0..10 {
            let n = heap.alloc_int(i).unwrap();
            array.push(&mut heap, Some(n)).unwrap();
            heap.release(n).unwrap();
        }

        assert_eq!(array.len(&heap), Ok(10));
        assert!(array.capacity(&heap).unwrap() >= 10);
        assert_eq!(ints(&mut heap, array), (0..10).collect::<Vec<_>>());

        array.set(&mut heap, 3, None).unwrap();
        assert_eq!(array.get(&heap, 3), Ok(None));
        assert_eq!(array.get(&heap, 10), Err(GcError::IndexOutOfRange { index: 10, len: 10 }));
        assert_eq!(
            array.set(&mut heap, 11, None),
            Err(GcError::IndexOutOfRange { index: 11, len: 10 })
        );
    }

    #[test]
    fn elements_survive_growth_and_collection() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::new(&mut heap).unwrap();

        for i in 0..100 {
            let n = heap.alloc_int(i * 3).unwrap();
            array.push(&mut heap, Some(n)).unwrap();
            heap.release(n).unwrap();

            if i % 25 == 0 {
                heap.collect().unwrap();
            }
        }

        heap.collect().unwrap();
        heap.verify().unwrap();
        assert_eq!(ints(&mut heap, array), (0..100).map(|i| i * 3).collect::<Vec<_>>());
    }

    #[test]
    fn pushed_value_is_kept_while_growing() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::with_capacity(&mut heap, 1).unwrap();

        let first = heap.alloc_int(1).unwrap();
        array.push(&mut heap, Some(first)).unwrap();
        heap.release(first).unwrap();

        // Not rooted by anything but the push itself.
        let second = heap.alloc_int(2).unwrap();
        heap.release(second).unwrap();
        array.push(&mut heap, Some(second)).unwrap();

        heap.collect().unwrap();
        assert_eq!(ints(&mut heap, array), vec![1, 2]);
        assert_eq!(heap.holds(array.handle()), Ok(1));
    }

    #[test]
    fn pop_and_clear() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::new(&mut heap).unwrap();
        assert_eq!(array.pop(&mut heap), Err(GcError::IndexOutOfRange { index: 0, len: 0 }));

        let a = heap.alloc_int(1).unwrap();
        let b = heap.alloc_int(2).unwrap();
        array.push(&mut heap, Some(a)).unwrap();
        array.push(&mut heap, Some(b)).unwrap();
        heap.release(a).unwrap();
        heap.release(b).unwrap();

        assert_eq!(array.pop(&mut heap), Ok(Some(b)));
        heap.collect().unwrap();
        assert!(!heap.is_live(b));
        assert!(heap.is_live(a));

        let capacity = array.capacity(&heap).unwrap();
        array.clear(&mut heap).unwrap();
        assert_eq!(array.is_empty(&heap), Ok(true));
        assert_eq!(array.capacity(&heap), Ok(capacity));
        heap.collect().unwrap();
        assert!(!heap.is_live(a));
    }

    #[test]
    fn filled_arrays_start_null() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::filled(&mut heap, 6).unwrap();
        assert_eq!(array.to_vec(&heap).unwrap(), vec![None; 6]);
    }

    #[test]
    fn from_handle_checks_the_class() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::new(&mut heap).unwrap();
        let n = heap.alloc_int(0).unwrap();

        assert_eq!(GcArray::from_handle(&heap, array.handle()), Ok(array));
        assert!(matches!(
            GcArray::from_handle(&heap, n),
            Err(GcError::WrongType { .. })
        ));
    }

    #[test]
    fn stale_values_are_rejected() {
        init_tracing();
        let mut heap = small_heap();
        let array = GcArray::new(&mut heap).unwrap();
        let n = heap.alloc_int(0).unwrap();
        heap.release(n).unwrap();
        heap.collect().unwrap();

        assert_eq!(array.push(&mut heap, Some(n)), Err(GcError::StaleHandle(n)));
        assert_eq!(array.len(&heap), Ok(0));
        assert_eq!(heap.holds(array.handle()), Ok(1));
    }
}
