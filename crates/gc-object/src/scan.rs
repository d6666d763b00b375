//! Conservative scanning of arbitrary memory regions.

/// Feed every pointer-aligned word of a memory region to `visit`.
///
/// The scan is conservative: any word may be a pointer, so integers that
/// happen to look like heap addresses keep their target alive.
///
/// # Safety
///
/// `region_ptr` must be valid for reading `region_len` bytes.
pub unsafe fn scan_region_conservatively<F>(region_ptr: *const u8, region_len: usize, mut visit: F)
where
    F: FnMut(usize),
{
    if region_ptr.is_null() || region_len == 0 {
        return;
    }

    let mut current = region_ptr as usize;
    let end = current + region_len;

    let align = std::mem::align_of::<usize>();
    if current % align != 0 {
        current += align - (current % align);
    }

    while current + std::mem::size_of::<usize>() <= end {
        // SAFETY: the caller guarantees the region is valid for reading.
        let word = unsafe { (current as *const usize).read() };
        visit(word);
        current += align;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visits_every_aligned_word() {
        let words = [1usize, 2, 3, 4];
        let mut seen = Vec::new();
        unsafe {
            scan_region_conservatively(words.as_ptr().cast(), std::mem::size_of_val(&words), |w| {
                seen.push(w);
            });
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unaligned_start_is_rounded_up() {
        let words = [10usize, 20, 30];
        let mut seen = Vec::new();
        unsafe {
            let start = words.as_ptr().cast::<u8>().add(1);
            scan_region_conservatively(start, std::mem::size_of_val(&words) - 1, |w| seen.push(w));
        }
        assert_eq!(seen, vec![20, 30]);
    }

    #[test]
    fn test_empty_region() {
        let mut calls = 0;
        unsafe { scan_region_conservatively(std::ptr::null(), 64, |_| calls += 1) };
        assert_eq!(calls, 0);
    }
}
