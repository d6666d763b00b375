//! Conservative stack scanning for root tracking.
//!
//! Spills the callee-saved registers onto the stack and hands every word
//! between the current stack pointer and the stack base to a callback.
//! Other threads' stacks are scanned while they are parked; see
//! [`crate::threads`].

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Retrieve the stack bounds for the current thread.
#[cfg(target_os = "linux")]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        Some(StackBounds {
            bottom: (stackaddr as usize) + stacksize,
            top: stackaddr as usize,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
///
/// Not available on this platform; stack scanning is skipped.
#[cfg(not(target_os = "linux"))]
pub const fn get_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spill CPU registers onto the stack and feed every stack word to `scan_fn`.
///
/// Returns `false` if the stack bounds of the current thread are unknown,
/// in which case only the spilled registers were scanned.
#[inline(never)]
pub fn spill_registers_and_scan<F>(mut scan_fn: F) -> bool
where
    F: FnMut(usize),
{
    #[cfg(target_arch = "x86_64")]
    let mut regs = [0usize; 6];
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(target_arch = "x86_64")]
    std::hint::black_box(&regs);

    // Other architectures: a large enough dummy array forces spills.
    #[cfg(not(target_arch = "x86_64"))]
    let regs = [0usize; 32];
    #[cfg(not(target_arch = "x86_64"))]
    std::hint::black_box(&regs);

    for r in &regs {
        scan_fn(*r);
    }

    let Some(bounds) = crate::threads::current_stack_bounds() else {
        return false;
    };

    // The current stack pointer is approximately the address of a local.
    let sp = std::ptr::addr_of!(scan_fn) as usize;
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);
    debug_assert!(current >= bounds.top);

    // The stack grows downwards (high to low addresses).
    while current < bounds.bottom {
        // SAFETY: we are reading the valid stack range of the current thread.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        scan_fn(word);
        current += std::mem::size_of::<usize>();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stack_bounds_contain_local() {
        let local = 0u64;
        let addr = std::ptr::addr_of!(local) as usize;
        let bounds = get_stack_bounds().expect("linux exposes stack bounds");
        assert!(bounds.top < addr && addr < bounds.bottom);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_scan_sees_stack_value() {
        let marker: usize = 0x5EED_F00D;
        let marker = std::hint::black_box(marker);
        let mut seen = false;
        assert!(spill_registers_and_scan(|word| seen |= word == marker));
        std::hint::black_box(marker);
        assert!(seen);
    }
}
