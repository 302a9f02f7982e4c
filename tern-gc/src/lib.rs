//! Managed memory for a dynamic language runtime.
//!
//! Everything lives in a [`Heap`]: classes describe object layouts and which
//! words hold references, objects are bump allocated into slabs and named by
//! generation-checked [`Handle`]s, and a stop-the-world mark-and-compact
//! collector moves survivors into fresh slabs while keeping every handle valid.
//!
//! ```
//! use tern_gc::{Heap, HeapConfig};
//!
//! let mut heap = Heap::new(HeapConfig::default())?;
//! let name = heap.intern(b"print")?;
//! let cell = heap.cons(Some(name), None)?;
//! heap.collect()?;
//! assert_eq!(heap.car(cell)?, Some(name));
//! # Ok::<(), tern_gc::GcError>(())
//! ```

mod array;
mod class;
mod config;
mod error;
mod gc;
mod handle;
mod interner;
mod object;
mod roots;
mod slab;
mod table;

#[cfg(test)]
mod tests;

pub use array::GcArray;
pub use class::{ClassDescriptor, ClassId, ClassRegistry, Tail, TraceEntry, TraceSpec, MAX_TRACE_ENTRIES, WORD};
pub use config::HeapConfig;
pub use error::{GcError, Result};
pub use gc::{GcPhase, GcStats, Heap};
pub use handle::{Handle, HandleTable};
pub use roots::{Root, RootScanner, RootSource, ScannerId};
pub use table::GcTable;
