//! The `new`/`dispose` heap.
//!
//! Allocations carry an 8-byte size header so `dispose` can rebuild
//! the layout; the pointer handed to the program points past it.

use std::alloc::{alloc_zeroed, dealloc, Layout};

const HEADER: usize = 8;

fn layout_for(total: usize) -> Layout {
    Layout::from_size_align(total, 8).expect("heap: bad allocation size")
}

/// Allocate `size` zeroed bytes.
#[no_mangle]
pub extern "C" fn __new(size: i64) -> *mut u8 {
    let size = size.max(0) as usize;
    let total = HEADER + size.max(1);
    unsafe {
        let raw = alloc_zeroed(layout_for(total));
        if raw.is_null() {
            eprintln!("new: out of memory ({} bytes)", size);
            std::process::abort();
        }
        (raw as *mut u64).write(total as u64);
        raw.add(HEADER)
    }
}

/// Free a pointer produced by `__new`. Null is a no-op.
///
/// # Safety
/// `p` must be null or a pointer previously returned by `__new` that
/// has not been disposed yet.
#[no_mangle]
pub unsafe extern "C" fn __dispose(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let raw = p.sub(HEADER);
    let total = (raw as *const u64).read() as usize;
    dealloc(raw, layout_for(total));
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_new_is_zeroed_and_disposable() {
        let p = super::__new(16);
        unsafe {
            for i in 0..16 {
                assert_eq!(*p.add(i), 0);
            }
            *p = 42;
            super::__dispose(p);
        }
    }

    #[test]
    fn test_dispose_null_is_noop() {
        unsafe { super::__dispose(std::ptr::null_mut()) };
    }
}
