//! Mutator thread registry and stop-the-world suspension.
//!
//! Every thread that allocates, roots or collects registers itself with its
//! stack bounds. A collection that scans stacks stops every other
//! registered thread before marking and resumes them once the mark phase
//! is done:
//!
//! 1. The collector takes the registry lock and sends each thread the
//!    suspend signal.
//! 2. The handler records its stack pointer, moves the thread to
//!    [`THREAD_STATE_SAFEPOINT`] and parks in `sigsuspend`.
//! 3. The collector scans each parked stack from the recorded pointer to
//!    the stack base. The interrupted register state lives in the signal
//!    frame inside that range.
//! 4. Dropping the [`StoppedWorld`] bumps the resume generation, sends the
//!    restart signal and waits until every thread is back to
//!    [`THREAD_STATE_EXECUTING`].
//!
//! Suspension needs `pthread_getattr_np`, so it is Linux only. Elsewhere no
//! thread registers and only the collecting thread's registers are seen.
//!
//! # Lock Ordering
//!
//! The registry lock is taken after the collector's state lock and held
//! for the whole stop. Nothing a parked thread might hold may be locked
//! while the world is stopped.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, MutexGuard};

use crate::stack::{get_stack_bounds, StackBounds};

/// Running mutator code.
pub const THREAD_STATE_EXECUTING: u8 = 0;
/// Parked in the suspend handler; its stack may be scanned.
pub const THREAD_STATE_SAFEPOINT: u8 = 1;

/// Per-thread record shared with collectors.
pub struct ThreadControlBlock {
    #[cfg(target_os = "linux")]
    pthread: libc::pthread_t,
    bounds: StackBounds,
    /// Stack pointer recorded by the suspend handler.
    stack_pointer: AtomicUsize,
    state: AtomicU8,
}

impl ThreadControlBlock {
    #[cfg(target_os = "linux")]
    fn current(bounds: StackBounds) -> Self {
        Self {
            // SAFETY: always safe to call.
            pthread: unsafe { libc::pthread_self() },
            bounds,
            stack_pointer: AtomicUsize::new(bounds.bottom),
            state: AtomicU8::new(THREAD_STATE_EXECUTING),
        }
    }

    /// Stack bounds captured at registration.
    pub const fn bounds(&self) -> StackBounds {
        self.bounds
    }
}

/// Every registered mutator thread.
#[derive(Default)]
pub struct ThreadRegistry {
    pub threads: Vec<Arc<ThreadControlBlock>>,
}

static THREAD_REGISTRY: LazyLock<Mutex<ThreadRegistry>> =
    LazyLock::new(|| Mutex::new(ThreadRegistry::default()));

/// The process-wide thread registry.
pub fn thread_registry() -> &'static Mutex<ThreadRegistry> {
    &THREAD_REGISTRY
}

thread_local! {
    /// This thread's control block. Read from the suspend handler, so it
    /// must stay a const-initialized `Cell` with no destructor.
    static CURRENT_TCB: Cell<*const ThreadControlBlock> = const { Cell::new(ptr::null()) };
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

/// Unregisters the thread when its thread-locals are torn down.
struct Registration(Arc<ThreadControlBlock>);

impl Drop for Registration {
    fn drop(&mut self) {
        let mut registry = thread_registry().lock();
        registry.threads.retain(|tcb| !Arc::ptr_eq(tcb, &self.0));
        let _ = CURRENT_TCB.try_with(|current| current.set(ptr::null()));
    }
}

fn current_tcb() -> *const ThreadControlBlock {
    CURRENT_TCB.try_with(Cell::get).unwrap_or(ptr::null())
}

/// Whether the calling thread is registered.
pub fn is_current_thread_registered() -> bool {
    !current_tcb().is_null()
}

/// Register the calling thread so collections on other threads scan its
/// stack.
///
/// Threads that allocate, root or collect are registered automatically.
/// A thread that only receives handles from others must call this before
/// holding them on its stack. Returns `true` if the thread was registered
/// by this call.
pub fn register_current_thread() -> bool {
    if is_current_thread_registered() {
        return false;
    }
    REGISTRATION
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return false;
            }
            let Some(tcb) = new_control_block() else {
                return false;
            };
            CURRENT_TCB.with(|current| current.set(Arc::as_ptr(&tcb)));
            thread_registry().lock().threads.push(Arc::clone(&tcb));
            *slot = Some(Registration(tcb));

            #[cfg(feature = "tracing")]
            tracing::trace!("mutator_thread_registered");
            true
        })
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn new_control_block() -> Option<Arc<ThreadControlBlock>> {
    let bounds = get_stack_bounds()?;
    signals::install();
    Some(Arc::new(ThreadControlBlock::current(bounds)))
}

#[cfg(not(target_os = "linux"))]
const fn new_control_block() -> Option<Arc<ThreadControlBlock>> {
    None
}

/// Stack bounds of the calling thread, cached when it is registered.
pub fn current_stack_bounds() -> Option<StackBounds> {
    let tcb = current_tcb();
    if tcb.is_null() {
        get_stack_bounds()
    } else {
        // SAFETY: the block is kept alive by this thread's registration.
        Some(unsafe { &*tcb }.bounds())
    }
}

/// Every registered thread except the caller, parked until this is dropped.
pub struct StoppedWorld {
    _registry: MutexGuard<'static, ThreadRegistry>,
    stopped: Vec<Arc<ThreadControlBlock>>,
}

impl StoppedWorld {
    /// Number of threads parked by this stop.
    pub fn stopped_threads(&self) -> usize {
        self.stopped.len()
    }

    /// Feed every word of every parked stack to `scan_fn`.
    pub fn scan_stacks<F>(&self, mut scan_fn: F)
    where
        F: FnMut(usize),
    {
        for tcb in &self.stopped {
            let mut current =
                tcb.stack_pointer.load(Ordering::Acquire) & !(std::mem::align_of::<usize>() - 1);
            while current < tcb.bounds.bottom {
                // SAFETY: the thread is parked, and the range from its
                // recorded stack pointer to its stack base is mapped.
                let word = unsafe { std::ptr::read_volatile(current as *const usize) };
                scan_fn(word);
                current += std::mem::size_of::<usize>();
            }
        }
    }
}

impl Drop for StoppedWorld {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        signals::resume(&self.stopped);
    }
}

/// Park every registered thread other than the caller.
pub fn stop_the_world() -> StoppedWorld {
    let registry = thread_registry().lock();
    let current = current_tcb();
    #[cfg_attr(not(target_os = "linux"), allow(unused_mut))]
    let mut stopped = Vec::with_capacity(registry.threads.len());

    #[cfg(target_os = "linux")]
    {
        for tcb in &registry.threads {
            if ptr::eq(Arc::as_ptr(tcb), current) {
                continue;
            }
            if signals::suspend(tcb) {
                stopped.push(Arc::clone(tcb));
            }
        }
        for tcb in &stopped {
            while tcb.state.load(Ordering::Acquire) != THREAD_STATE_SAFEPOINT {
                std::thread::yield_now();
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = current;

    StoppedWorld {
        _registry: registry,
        stopped,
    }
}

#[cfg(target_os = "linux")]
mod signals {
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Once, OnceLock};

    use super::{ThreadControlBlock, CURRENT_TCB, THREAD_STATE_EXECUTING, THREAD_STATE_SAFEPOINT};

    const SUSPEND_SIGNAL: libc::c_int = libc::SIGPWR;
    const RESTART_SIGNAL: libc::c_int = libc::SIGXCPU;

    /// Bumped once per resume; parked threads wait for it to change.
    static RESUME_GENERATION: AtomicUsize = AtomicUsize::new(0);
    /// Everything blocked except the restart signal.
    static SUSPEND_MASK: OnceLock<libc::sigset_t> = OnceLock::new();

    pub fn install() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            // SAFETY: plain libc signal setup on zeroed structures.
            unsafe {
                let mut mask: libc::sigset_t = std::mem::zeroed();
                libc::sigfillset(&raw mut mask);
                libc::sigdelset(&raw mut mask, RESTART_SIGNAL);
                let _ = SUSPEND_MASK.set(mask);

                install_handler(SUSPEND_SIGNAL, suspend_handler as libc::sighandler_t);
                install_handler(RESTART_SIGNAL, restart_handler as libc::sighandler_t);
            }
        });
    }

    unsafe fn install_handler(signal: libc::c_int, handler: libc::sighandler_t) {
        // SAFETY: forwarded from the caller.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&raw mut action.sa_mask);
            if libc::sigaction(signal, &raw const action, ptr::null_mut()) != 0 {
                #[cfg(feature = "tracing")]
                tracing::warn!(signal, "failed to install thread suspension handler");
            }
        }
    }

    /// Returns `false` if the thread could not be signalled.
    pub fn suspend(tcb: &ThreadControlBlock) -> bool {
        // SAFETY: registered threads unregister before they exit, and the
        // registry lock is held, so `pthread` names a live thread.
        unsafe { libc::pthread_kill(tcb.pthread, SUSPEND_SIGNAL) == 0 }
    }

    pub fn resume(stopped: &[Arc<ThreadControlBlock>]) {
        RESUME_GENERATION.fetch_add(1, Ordering::AcqRel);
        for tcb in stopped {
            // SAFETY: as in `suspend`.
            unsafe { libc::pthread_kill(tcb.pthread, RESTART_SIGNAL) };
        }
        for tcb in stopped {
            while tcb.state.load(Ordering::Acquire) != THREAD_STATE_EXECUTING {
                std::thread::yield_now();
            }
        }
    }

    extern "C" fn suspend_handler(_signal: libc::c_int) {
        // SAFETY: errno is thread-local.
        let saved_errno = unsafe { *libc::__errno_location() };

        let tcb = CURRENT_TCB.try_with(std::cell::Cell::get).unwrap_or(ptr::null());
        if !tcb.is_null() {
            if let Some(mask) = SUSPEND_MASK.get() {
                // SAFETY: a registered thread's block outlives its registration.
                park(unsafe { &*tcb }, mask);
            }
        }

        // SAFETY: as above.
        unsafe { *libc::__errno_location() = saved_errno };
    }

    #[inline(never)]
    fn park(tcb: &ThreadControlBlock, mask: &libc::sigset_t) {
        let generation = RESUME_GENERATION.load(Ordering::Acquire);

        let marker = 0usize;
        tcb.stack_pointer
            .store(ptr::addr_of!(marker) as usize, Ordering::Relaxed);
        tcb.state.store(THREAD_STATE_SAFEPOINT, Ordering::Release);

        while RESUME_GENERATION.load(Ordering::Acquire) == generation {
            // SAFETY: `mask` is a valid signal set.
            unsafe { libc::sigsuspend(mask) };
        }

        std::hint::black_box(&marker);
        tcb.state.store(THREAD_STATE_EXECUTING, Ordering::Release);
    }

    extern "C" fn restart_handler(_signal: libc::c_int) {}
}
