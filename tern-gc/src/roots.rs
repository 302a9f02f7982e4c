use crate::handle::Handle;

/// Tags who registered a root, so a whole frame or working set can be dropped at once.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct RootSource(pub u32);

impl RootSource {
    pub const DEFAULT: RootSource = RootSource(0);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Root {
    pub source: RootSource,
    pub handle: Handle,
}

/// Implemented by the embedder to report the handles it keeps outside the heap.
///
/// Called once per collection, before anything is marked. The scanner only
/// sees itself, never the heap, so it cannot allocate mid-collection.
pub trait RootScanner {
    fn enumerate_roots(&self, roots: &mut Vec<Handle>);
}

impl<F> RootScanner for F
where
    F: Fn(&mut Vec<Handle>),
{
    fn enumerate_roots(&self, roots: &mut Vec<Handle>) {
        self(roots)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ScannerId(u32);

#[derive(Default)]
pub struct RootSet {
    roots: Vec<Root>,
    scanners: Vec<(ScannerId, Box<dyn RootScanner>)>,
    next_scanner: u32,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn register(&mut self, source: RootSource, handle: Handle) {
        self.roots.push(Root { source, handle });
    }

    /// Removes the most recent registration of `handle` by `source`.
    pub fn unregister(&mut self, source: RootSource, handle: Handle) -> bool {
        let found = self
            .roots
            .iter()
            .rposition(|root| root.source == source && root.handle == handle);

        match found {
            Some(index) => {
                self.roots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes everything `source` registered and returns how many roots went.
    pub fn unregister_source(&mut self, source: RootSource) -> usize {
        let before = self.roots.len();
        self.roots.retain(|root| root.source != source);
        before - self.roots.len()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.roots.iter().any(|root| root.handle == handle)
    }

    pub fn roots(&self) -> &[Root] {
        &self.roots
    }

    pub fn add_scanner(&mut self, scanner: Box<dyn RootScanner>) -> ScannerId {
        let id = ScannerId(self.next_scanner);
        self.next_scanner += 1;
        self.scanners.push((id, scanner));
        id
    }

    pub fn remove_scanner(&mut self, id: ScannerId) -> Option<Box<dyn RootScanner>> {
        let index = self.scanners.iter().position(|(scanner, _)| *scanner == id)?;
        Some(self.scanners.remove(index).1)
    }

    /// Registered roots in registration order, then whatever each scanner
    /// reports, scanners in the order they were added.
    pub fn enumerate(&self, out: &mut Vec<Handle>) {
        out.extend(self.roots.iter().map(|root| root.handle));

        for (_, scanner) in &self.scanners {
            scanner.enumerate_roots(out);
        }
    }
}
