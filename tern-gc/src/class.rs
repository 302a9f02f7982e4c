//! Per-type layout metadata.
//!
//! A [`ClassDescriptor`] says how big an instance is, how it is aligned and which
//! of its words hold references. The collector never asks an object how to trace
//! itself; it looks the descriptor up by the [`ClassId`] stored in the header and
//! walks the [`TraceSpec`].

use crate::error::{GcError, Result};
use arrayvec::ArrayVec;
use fxhash::FxHashMap;
use std::fmt;
use tern_mmap::PAGE_BYTES;

/// Size of a reference slot and of the length words containers keep.
pub const WORD: usize = std::mem::size_of::<usize>();

pub const MAX_TRACE_ENTRIES: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    pub const INT: ClassId = ClassId(0);
    pub const FLOAT: ClassId = ClassId(1);
    pub const BOOL: ClassId = ClassId(2);
    pub const CHAR: ClassId = ClassId(3);
    pub const CONS: ClassId = ClassId(4);
    pub const STRING: ClassId = ClassId(5);
    pub const VECTOR: ClassId = ClassId(6);
    pub const ARRAY: ClassId = ClassId(7);
    pub const HASHTABLE: ClassId = ClassId(8);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One reference-bearing location inside an instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceEntry {
    /// A single reference at this payload offset.
    Ref(usize),
    /// A length word at this offset followed by that many references, running
    /// into the variable-length tail. Must be the last fixed word.
    Run(usize),
}

impl TraceEntry {
    pub fn offset(self) -> usize {
        match self {
            TraceEntry::Ref(offset) | TraceEntry::Run(offset) => offset,
        }
    }
}

pub type TraceSpec = ArrayVec<TraceEntry, MAX_TRACE_ENTRIES>;

/// What follows the fixed part of an instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tail {
    None,
    Bytes,
    Refs,
}

impl Tail {
    pub fn element_bytes(self) -> usize {
        match self {
            Tail::None => 0,
            Tail::Bytes => 1,
            Tail::Refs => WORD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    size: usize,
    align: usize,
    trace: TraceSpec,
    tail: Tail,
}

impl ClassDescriptor {
    fn new(
        id: ClassId,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
        bytes_tail: bool,
    ) -> Result<Self> {
        let invalid = |reason: String| GcError::InvalidDescriptor {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(invalid("name must be dot separated, non-empty segments".into()));
        }
        if !align.is_power_of_two() || align > PAGE_BYTES {
            return Err(invalid(format!("alignment {align} must be a power of two up to {PAGE_BYTES}")));
        }
        if trace.len() > MAX_TRACE_ENTRIES {
            return Err(invalid(format!(
                "{} trace entries, at most {MAX_TRACE_ENTRIES} allowed",
                trace.len()
            )));
        }
        if !trace.is_empty() && align < WORD {
            return Err(invalid(format!("classes with references need alignment of at least {WORD}")));
        }

        let mut checked = TraceSpec::new();
        let mut tail = if bytes_tail { Tail::Bytes } else { Tail::None };

        for &entry in trace {
            let offset = entry.offset();

            if offset % WORD != 0 {
                return Err(invalid(format!("offset {offset} is not word aligned")));
            }
            if offset.checked_add(WORD).map_or(true, |end| end > size) {
                return Err(invalid(format!("offset {offset} lies outside size {size}")));
            }
            if checked.iter().any(|e| e.offset() == offset) {
                return Err(invalid(format!("offset {offset} appears twice")));
            }

            if let TraceEntry::Run(_) = entry {
                if tail != Tail::None {
                    return Err(invalid("only one reference run or byte tail is allowed".into()));
                }
                if offset + WORD != size {
                    return Err(invalid(format!("reference run at {offset} must be the last word")));
                }
                tail = Tail::Refs;
            }

            checked.push(entry);
        }

        Ok(Self {
            id,
            name: name.to_string(),
            size,
            align,
            trace: checked,
            tail,
        })
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn tail(&self) -> Tail {
        self.tail
    }

    /// Offset of the run length word, if instances carry a reference run.
    pub fn run_offset(&self) -> Option<usize> {
        self.trace.iter().find_map(|entry| match entry {
            TraceEntry::Run(offset) => Some(*offset),
            TraceEntry::Ref(_) => None,
        })
    }

    pub fn is_ref_field(&self, offset: usize) -> bool {
        self.trace.contains(&TraceEntry::Ref(offset))
    }

    /// Is `offset..offset + WORD` a plain data word, clear of every traced slot?
    pub fn is_data_word(&self, offset: usize) -> bool {
        offset % WORD == 0
            && offset.checked_add(WORD).is_some_and(|end| end <= self.size)
            && !self.trace.iter().any(|entry| entry.offset() == offset)
    }

    /// Payload bytes for an instance with `extra` tail elements.
    pub fn payload_bytes(&self, extra: usize) -> Option<usize> {
        extra
            .checked_mul(self.tail.element_bytes())
            .and_then(|tail| tail.checked_add(self.size))
    }
}

impl fmt::Display for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Owns every descriptor for the lifetime of the heap. Append only.
pub struct ClassRegistry {
    classes: Vec<ClassDescriptor>,
    by_name: FxHashMap<String, ClassId>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    /// Creates a registry holding the built-in classes, at the ids named by the
    /// [`ClassId`] constants.
    pub fn new() -> Self {
        use TraceEntry::*;

        let mut registry = Self {
            classes: Vec::new(),
            by_name: FxHashMap::default(),
        };

        let builtins: [(&str, usize, usize, &[TraceEntry], bool); 9] = [
            ("core.Int", 8, 8, &[], false),
            ("core.Float", 8, 8, &[], false),
            ("core.Bool", 1, 1, &[], false),
            ("core.Char", 4, 4, &[], false),
            ("core.Cons", 2 * WORD, WORD, &[Ref(0), Ref(WORD)], false),
            ("core.String", 0, 1, &[], true),
            ("core.Vector", WORD, WORD, &[Run(0)], false),
            ("core.Array", 3 * WORD, WORD, &[Ref(2 * WORD)], false),
            ("core.Hashtable", 3 * WORD, WORD, &[Ref(2 * WORD)], false),
        ];

        for (name, size, align, trace, bytes_tail) in builtins {
            let registered = registry.insert(name, size, align, trace, bytes_tail);
            debug_assert!(registered.is_ok(), "builtin {name} rejected: {registered:?}");
        }

        registry
    }

    /// Registers a class whose instances are `size` bytes, plus a reference run
    /// when `trace` ends in [`TraceEntry::Run`].
    pub fn register(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
    ) -> Result<ClassId> {
        self.insert(name, size, align, trace, false)
    }

    /// Registers a class whose instances end in a run of raw bytes.
    pub fn register_bytes(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
    ) -> Result<ClassId> {
        self.insert(name, size, align, trace, true)
    }

    fn insert(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
        trace: &[TraceEntry],
        bytes_tail: bool,
    ) -> Result<ClassId> {
        if self.by_name.contains_key(name) {
            return Err(GcError::DuplicateType(name.to_string()));
        }

        let id = ClassId(self.classes.len() as u32);
        let descriptor = ClassDescriptor::new(id, name, size, align, trace, bytes_tail)?;

        tracing::trace!(%name, size, align, "registered class");
        self.by_name.insert(name.to_string(), id);
        self.classes.push(descriptor);

        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Result<&ClassDescriptor> {
        self.by_name
            .get(name)
            .map(|id| &self.classes[id.index()])
            .ok_or_else(|| GcError::NotFound(name.to_string()))
    }

    /// Panics if `id` did not come from this registry.
    #[inline]
    pub fn get(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.iter()
    }
}
