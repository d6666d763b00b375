//! Finalizer registration, chaining and dispatch.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};

use gc_object::{Allocator, GcConfig, MarkSweep, Obj, Strategy};

fn allocator() -> Allocator {
    Allocator::new(MarkSweep::new(config()))
}

fn config() -> GcConfig {
    GcConfig::builder()
        .scan_stack(false)
        .collect_threshold(0)
        .build()
        .unwrap()
}

struct Tracked(&'static AtomicUsize);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_unreachable_object_is_finalized_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = allocator();

    let addr = alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap().addr();
    assert_eq!(alloc.registry().finalizer_count(addr as *const u8), 1);

    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    // Kept for the cycle that finalized it.
    assert!(alloc.size_of_block(addr as *const u8).is_some());

    alloc.collect();
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    assert_eq!(alloc.size_of_block(addr as *const u8), None);
}

#[test]
fn test_rooted_object_is_not_finalized() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = allocator();

    let obj = alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    let root = alloc.root(obj);
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);

    let second = root.clone();
    drop(root);
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);

    drop(second);
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
}

/// Two parts of one block, each registering its own teardown.
#[repr(C)]
struct Composite {
    tag: u64,
    first: Part,
    second: Part,
}

struct Part {
    id: usize,
    log: &'static Mutex<Vec<usize>>,
}

impl Drop for Part {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(self.id);
    }
}

#[test]
fn test_chained_finalizers_run_newest_first() {
    static LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    let alloc = allocator();

    let block = alloc
        .allocate(std::mem::size_of::<Composite>(), Strategy::Collected)
        .unwrap()
        .cast::<Composite>();
    let base = block.as_ptr().cast::<u8>();
    unsafe {
        block.as_ptr().write(Composite {
            tag: 7,
            first: Part { id: 1, log: &LOG },
            second: Part { id: 2, log: &LOG },
        });
        let registry = alloc.registry();
        assert!(registry.register_finalizer(NonNull::from(&mut (*block.as_ptr()).first)));
        assert!(registry.register_finalizer(NonNull::from(&mut (*block.as_ptr()).second)));
        assert_eq!((*block.as_ptr()).tag, 7);
    }
    assert_eq!(alloc.registry().finalizer_count(base), 2);

    alloc.collect();
    assert_eq!(*LOG.lock().unwrap(), vec![2, 1]);

    alloc.collect();
    assert_eq!(*LOG.lock().unwrap(), vec![2, 1]);
}

#[test]
fn test_explicit_delete_prevents_finalization() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = allocator();

    let obj = alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    unsafe { alloc.delete_object(obj, Strategy::Collected) };
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);

    // The slot may be reused; nothing stale may fire on it.
    let reused = alloc.new_object(7u64, Strategy::Collected).unwrap();
    let _root = alloc.root(reused);
    alloc.collect();
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deregistered_object_is_never_finalized() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = allocator();

    let obj = alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    assert!(alloc.registry().deregister_finalizer(obj.as_ptr().cast()));
    assert!(!alloc.registry().deregister_finalizer(obj.as_ptr().cast()));

    alloc.collect();
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
}

#[test]
fn test_untracked_pointer_is_ignored() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = allocator();

    let mut local = Tracked(&DROPS);
    let registry = alloc.registry();
    assert!(!unsafe { registry.register_finalizer(NonNull::from(&mut local)) });
    assert_eq!(registry.finalizer_count(std::ptr::addr_of!(local).cast()), 0);
    assert!(!registry.deregister_finalizer(std::ptr::addr_of!(local).cast()));

    // Registry state is unaffected.
    let obj = alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    assert_eq!(alloc.registry().finalizer_count(obj.as_ptr().cast()), 1);
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);

    drop(local);
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
}

static REENTRANT: LazyLock<Allocator> = LazyLock::new(allocator);
static DEREGISTERED_SELF: AtomicBool = AtomicBool::new(true);
static REENTRANT_RUNS: AtomicUsize = AtomicUsize::new(0);

unsafe fn deregister_self(base: NonNull<u8>, _data: usize) {
    REENTRANT_RUNS.fetch_add(1, Ordering::SeqCst);
    let cleared = REENTRANT.registry().deregister_finalizer(base.as_ptr());
    DEREGISTERED_SELF.store(cleared, Ordering::SeqCst);
}

#[test]
fn test_deregister_inside_running_finalizer_is_ignored() {
    let block = REENTRANT.allocate(32, Strategy::Collected).unwrap();
    unsafe {
        assert!(REENTRANT.registry().register_finalizer_with(block, deregister_self));
        assert!(REENTRANT.registry().register_finalizer_with(block, deregister_self));
    }

    REENTRANT.collect();
    assert_eq!(REENTRANT_RUNS.load(Ordering::SeqCst), 2);
    assert!(!DEREGISTERED_SELF.load(Ordering::SeqCst));
}

#[test]
fn test_finalization_follows_reference_order() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());

    struct Inner {
        value: u32,
    }
    impl Drop for Inner {
        fn drop(&mut self) {
            self.value = 0;
            LOG.lock().unwrap().push("inner");
        }
    }

    struct Outer {
        inner: Obj<Inner>,
    }
    impl Drop for Outer {
        fn drop(&mut self) {
            assert_eq!(unsafe { self.inner.as_ref() }.value, 9);
            LOG.lock().unwrap().push("outer");
        }
    }

    let alloc = allocator();
    let inner = alloc.new_object(Inner { value: 9 }, Strategy::Collected).unwrap();
    alloc.new_object(Outer { inner }, Strategy::Collected).unwrap();

    alloc.collect();
    assert_eq!(*LOG.lock().unwrap(), vec!["outer"]);
    alloc.collect();
    assert_eq!(*LOG.lock().unwrap(), vec!["outer", "inner"]);
}

#[test]
fn test_finalizable_cycle_is_kept() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Node {
        _tracked: Tracked,
        peer: Option<Obj<Node>>,
    }

    let alloc = allocator();
    let a = alloc
        .new_object(Node { _tracked: Tracked(&DROPS), peer: None }, Strategy::Collected)
        .unwrap();
    let b = alloc
        .new_object(Node { _tracked: Tracked(&DROPS), peer: Some(a) }, Strategy::Collected)
        .unwrap();
    unsafe { a.as_mut().peer = Some(b) };

    alloc.collect();
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
    assert!(alloc.size_of_block(a.as_ptr().cast()).is_some());
}

#[test]
fn test_finalize_on_demand() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let alloc = Allocator::new(MarkSweep::new(
        GcConfig::builder()
            .scan_stack(false)
            .collect_threshold(0)
            .finalize_on_demand(true)
            .build()
            .unwrap(),
    ));

    alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    alloc.new_object(Tracked(&DROPS), Strategy::Collected).unwrap();
    assert!(!alloc.collector().should_invoke_finalizers());

    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);
    assert!(alloc.collector().should_invoke_finalizers());
    assert_eq!(alloc.collector().last_metrics().finalizers_queued, 2);

    // Queued blocks stay alive across collections until their chains run.
    alloc.collect();
    assert_eq!(DROPS.load(Ordering::SeqCst), 0);

    assert_eq!(alloc.collector().invoke_finalizers(), 2);
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    assert!(!alloc.collector().should_invoke_finalizers());
    assert_eq!(alloc.collector().invoke_finalizers(), 0);
}

#[test]
fn test_finalizer_may_allocate() {
    static INNER_DROPS: AtomicUsize = AtomicUsize::new(0);
    static ALLOC: LazyLock<Allocator> = LazyLock::new(allocator);

    struct Spawner;
    impl Drop for Spawner {
        fn drop(&mut self) {
            ALLOC.new_object(Tracked(&INNER_DROPS), Strategy::Collected).unwrap();
        }
    }

    ALLOC.new_object(Spawner, Strategy::Collected).unwrap();
    ALLOC.collect();
    assert_eq!(INNER_DROPS.load(Ordering::SeqCst), 0);
    ALLOC.collect();
    assert_eq!(INNER_DROPS.load(Ordering::SeqCst), 1);
}
