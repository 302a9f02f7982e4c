use crate::handle::Handle;
use fxhash::FxHashMap;

/// Bookkeeping for interned strings. The strings themselves live on the heap;
/// see [`Heap::intern`](crate::Heap::intern) and [`Heap::qualify`](crate::Heap::qualify).
#[derive(Default)]
pub struct Interner {
    map: FxHashMap<Box<[u8]>, Handle>,
    order: Vec<Handle>,
    qualified: FxHashMap<(Handle, Handle), Handle>,
    parts: FxHashMap<Handle, (Handle, Handle)>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, bytes: &[u8]) -> Option<Handle> {
        self.map.get(bytes).copied()
    }

    pub fn insert(&mut self, bytes: &[u8], handle: Handle) {
        debug_assert!(!self.map.contains_key(bytes));
        self.map.insert(bytes.into(), handle);
        self.order.push(handle);
    }

    pub fn qualified(&self, namespace: Handle, name: Handle) -> Option<Handle> {
        self.qualified.get(&(namespace, name)).copied()
    }

    pub fn insert_qualified(&mut self, namespace: Handle, name: Handle, qualified: Handle) {
        self.qualified.insert((namespace, name), qualified);
        self.parts.entry(qualified).or_insert((namespace, name));
    }

    /// The `(namespace, name)` pair `qualified` was first composed from.
    pub fn components(&self, qualified: Handle) -> Option<(Handle, Handle)> {
        self.parts.get(&qualified).copied()
    }

    /// Every interned handle, in intern order. These are permanent roots.
    pub fn handles(&self) -> &[Handle] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
