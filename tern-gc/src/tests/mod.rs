use crate::{GcArray, GcError, GcTable, Handle, Heap, HeapConfig, RootSource, TraceEntry, WORD};
use proptest::prelude::*;
use tern_mmap::PAGE_BYTES;

/// Routes `tracing` output through the test harness. `RUST_LOG=tern_gc=trace`
/// shows slab traffic.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small slabs and no minimum, so collections happen after a few hundred objects.
pub(crate) fn small_config() -> HeapConfig {
    HeapConfig {
        slab_bytes: 4 * PAGE_BYTES,
        max_heap_bytes: 64 * 1024 * 1024,
        min_collect_bytes: 0,
        ..Default::default()
    }
}

pub(crate) fn small_heap() -> Heap {
    Heap::new(small_config()).unwrap()
}

fn garbage(heap: &mut Heap, n: usize) {
    for i in 0..n {
        let h = match i % 3 {
            0 => heap.alloc_int(i as i64).unwrap(),
            1 => heap.alloc_string(format!("garbage {i}").as_bytes()).unwrap(),
            _ => heap.cons(None, None).unwrap(),
        };
        heap.release(h).unwrap();
    }
}

#[test]
fn cons_survives_allocation_pressure() {
    init_tracing();
    let mut heap = small_heap();

    let a = heap.alloc_int(17).unwrap();
    let b = heap.alloc_string(b"bee").unwrap();
    let cell = heap.cons(Some(a), Some(b)).unwrap();
    heap.register_root(cell).unwrap();
    for h in [a, b, cell] {
        heap.release(h).unwrap();
    }

    garbage(&mut heap, 10_000);
    assert!(heap.stats().collections > 0);

    let car = heap.car(cell).unwrap().unwrap();
    let cdr = heap.cdr(cell).unwrap().unwrap();
    assert_eq!(heap.int(car), Ok(17));
    assert_eq!(heap.string(cdr).unwrap(), b"bee");
    heap.verify().unwrap();
}

#[test]
fn interning_twice_gives_one_handle() {
    init_tracing();
    let mut heap = small_heap();

    let foo = heap.intern(b"foo").unwrap();
    garbage(&mut heap, 2_000);
    assert_eq!(heap.intern(b"foo"), Ok(foo));
    assert_eq!(heap.string(foo).unwrap(), b"foo");
    assert_eq!(heap.interned_count(), 1);

    // Interned strings outlive any number of releases.
    heap.release(foo).unwrap();
    heap.collect().unwrap();
    assert_eq!(heap.lookup_interned(b"foo"), Some(foo));
    assert!(heap.is_rooted(foo));
}

#[test]
fn released_array_takes_its_elements_along() {
    init_tracing();
    let mut heap = small_heap();

    let array = GcArray::new(&mut heap).unwrap();
    let mut elements = Vec::new();
    for i in 1..=1000 {
        let n = heap.alloc_int(i).unwrap();
        array.push(&mut heap, Some(n)).unwrap();
        heap.release(n).unwrap();
        elements.push(n);
    }
    assert_eq!(array.len(&heap), Ok(1000));

    heap.release(array.handle()).unwrap();
    heap.collect().unwrap();

    assert_eq!(array.len(&heap), Err(GcError::StaleHandle(array.handle())));
    for n in elements {
        assert_eq!(heap.int(n), Err(GcError::StaleHandle(n)));
    }
}

#[test]
fn chains_live_exactly_as_long_as_their_root() {
    init_tracing();
    let mut heap = small_heap();

    let tail = heap.alloc_int(-1).unwrap();
    let mut chain = vec![tail];
    let mut head = tail;
    for _ in 0..50 {
        let next = heap.cons(Some(head), None).unwrap();
        heap.release(head).unwrap();
        head = next;
        chain.push(head);
    }
    heap.register_root(head).unwrap();
    heap.release(head).unwrap();

    for _ in 0..5 {
        garbage(&mut heap, 500);
        heap.collect().unwrap();
        heap.verify().unwrap();
        assert!(chain.iter().all(|&h| heap.is_live(h)));
    }

    let mut cursor = head;
    for _ in 0..50 {
        cursor = heap.car(cursor).unwrap().unwrap();
    }
    assert_eq!(heap.int(cursor), Ok(-1));

    heap.unregister_root(head).unwrap();
    heap.collect().unwrap();
    for h in chain {
        assert_eq!(heap.deref(h), Err(GcError::StaleHandle(h)));
    }
}

#[test]
fn contents_outlive_addresses() {
    init_tracing();
    let mut heap = small_heap();

    let s = heap.alloc_string(b"stable contents").unwrap();
    let f = heap.alloc_float(6.25).unwrap();
    let before = [heap.deref(s).unwrap(), heap.deref(f).unwrap()];

    garbage(&mut heap, 100);
    heap.collect().unwrap();

    let after = [heap.deref(s).unwrap(), heap.deref(f).unwrap()];
    assert_ne!(before, after);
    assert_eq!(heap.string(s).unwrap(), b"stable contents");
    assert_eq!(heap.float(f), Ok(6.25));
}

#[test]
fn qualified_names() {
    init_tracing();
    let mut heap = small_heap();

    let core = heap.intern(b"core").unwrap();
    let list = heap.intern(b"List").unwrap();
    let qualified = heap.qualify(core, list).unwrap();

    assert_eq!(heap.string(qualified).unwrap(), b"core.List");
    assert_eq!(heap.qualify(core, list), Ok(qualified));
    assert_eq!(heap.intern(b"core.List"), Ok(qualified));
    assert_eq!(heap.components(qualified), Some((core, list)));

    let path = heap.qualify_path(&["core", "List", "push"]).unwrap();
    assert_eq!(heap.string(path).unwrap(), b"core.List.push");
    let (namespace, name) = heap.components(path).unwrap();
    assert_eq!(namespace, qualified);
    assert_eq!(heap.string(name).unwrap(), b"push");

    assert!(matches!(heap.qualify_path(&[]), Err(GcError::NotFound(_))));

    let loose = heap.alloc_string(b"loose").unwrap();
    assert!(matches!(heap.qualify(core, loose), Err(GcError::WrongType { .. })));
}

#[test]
fn registry_rejects_bad_classes() {
    init_tracing();
    let mut heap = small_heap();

    assert_eq!(
        heap.register("core.Cons", 16, 8, &[]),
        Err(GcError::DuplicateType("core.Cons".into()))
    );
    assert!(matches!(
        heap.register("test.Outside", 8, 8, &[TraceEntry::Ref(8)]),
        Err(GcError::InvalidDescriptor { .. })
    ));
    assert_eq!(
        heap.lookup_class("test.Missing"),
        Err(GcError::NotFound("test.Missing".into()))
    );
}

#[test]
fn frames_as_root_sources() {
    init_tracing();
    let mut heap = small_heap();
    let globals = GcTable::new(&mut heap).unwrap();
    heap.register_root(globals.handle()).unwrap();
    heap.release(globals.handle()).unwrap();

    for depth in 0..3u32 {
        let frame = RootSource(depth + 1);
        let local = heap.alloc_int(depth as i64).unwrap();
        heap.register_root_from(frame, local).unwrap();
        heap.release(local).unwrap();

        let key = heap.intern(format!("depth{depth}").as_bytes()).unwrap();
        globals.insert(&mut heap, key, local).unwrap();

        garbage(&mut heap, 300);
        assert_eq!(heap.unregister_source(frame), 1);
    }

    heap.collect().unwrap();
    heap.verify().unwrap();
    assert_eq!(globals.len(&heap), Ok(3));
    for depth in 0..3 {
        let key = heap.lookup_interned(format!("depth{depth}").as_bytes()).unwrap();
        let local = globals.get(&heap, key).unwrap().unwrap();
        assert_eq!(heap.int(local), Ok(depth));
    }
}

#[test]
fn array_growth_is_logarithmic() {
    init_tracing();
    let mut heap = small_heap();

    for n in [10usize, 100, 1000, 5000] {
        let before = heap.stats().array_reallocations;
        let array = GcArray::new(&mut heap).unwrap();
        for i in 0..n {
            array.push(&mut heap, None).unwrap();
            assert_eq!(array.len(&heap), Ok(i + 1));
        }

        let grown = heap.stats().array_reallocations - before;
        let bound = (n as f64).log2().ceil() as u64;
        assert!(grown <= bound, "{n} pushes grew {grown} times");
        heap.release(array.handle()).unwrap();
    }
}

#[test]
fn embedder_objects_with_runs() {
    init_tracing();
    let mut heap = small_heap();
    // A closure: code pointer, then captured upvalues.
    let closure = heap
        .register("test.Closure", 2 * WORD, WORD, &[TraceEntry::Run(WORD)])
        .unwrap();

    let upvalues: Vec<Handle> = (0..8).map(|i| heap.alloc_int(i * 10).unwrap()).collect();
    let obj = heap.allocate(closure, upvalues.len()).unwrap();
    heap.write_word(obj, 0, 0xc0de).unwrap();
    for (i, &up) in upvalues.iter().enumerate() {
        heap.run_set(obj, i, Some(up)).unwrap();
        heap.release(up).unwrap();
    }

    garbage(&mut heap, 3_000);
    heap.collect().unwrap();
    heap.verify().unwrap();

    assert_eq!(heap.read_word(obj, 0), Ok(0xc0de));
    for (i, &up) in upvalues.iter().enumerate() {
        assert_eq!(heap.run_get(obj, i), Ok(Some(up)));
        assert_eq!(heap.int(up), Ok(i as i64 * 10));
    }
}

#[test]
fn handles_are_recycled_with_new_generations() {
    init_tracing();
    let mut heap = small_heap();

    let old = heap.alloc_int(1).unwrap();
    heap.release(old).unwrap();
    heap.collect().unwrap();

    let new = heap.alloc_int(2).unwrap();
    assert_eq!(new.index(), old.index());
    assert_ne!(new, old);
    assert_eq!(heap.int(old), Err(GcError::StaleHandle(old)));
    assert_eq!(heap.int(new), Ok(2));
}

proptest! {
    #[test]
    fn interning_is_canonical(words in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 1..40)) {
        let mut heap = small_heap();

        let first: Vec<Handle> = words.iter().map(|w| heap.intern(w).unwrap()).collect();
        heap.collect().unwrap();
        let second: Vec<Handle> = words.iter().map(|w| heap.intern(w).unwrap()).collect();

        prop_assert_eq!(&first, &second);
        for (word, &handle) in words.iter().zip(&first) {
            prop_assert_eq!(heap.string(handle).unwrap(), word.as_slice());
        }
        for (i, a) in words.iter().enumerate() {
            for (j, b) in words.iter().enumerate() {
                prop_assert_eq!(a == b, first[i] == first[j]);
            }
        }
    }

    #[test]
    fn tables_match_a_model(ops in prop::collection::vec((any::<bool>(), 0i64..32, any::<i64>()), 1..200)) {
        let mut heap = small_heap();
        let table = GcTable::new(&mut heap).unwrap();
        let mut model = std::collections::HashMap::new();

        for (insert, key, value) in ops {
            let k = heap.alloc_int(key).unwrap();
            if insert {
                let v = heap.alloc_int(value).unwrap();
                let previous = table.insert(&mut heap, k, v).unwrap().map(|p| heap.int(p).unwrap());
                prop_assert_eq!(previous, model.insert(key, value));
                heap.release(v).unwrap();
            } else {
                let removed = table.remove(&mut heap, k).unwrap().map(|p| heap.int(p).unwrap());
                prop_assert_eq!(removed, model.remove(&key));
            }
            heap.release(k).unwrap();
        }

        heap.collect().unwrap();
        heap.verify().unwrap();
        prop_assert_eq!(table.len(&heap).unwrap(), model.len());
        for (key, value) in model {
            let k = heap.alloc_int(key).unwrap();
            let found = table.get(&heap, k).unwrap().map(|v| heap.int(v).unwrap());
            prop_assert_eq!(found, Some(value));
        }
    }
}
