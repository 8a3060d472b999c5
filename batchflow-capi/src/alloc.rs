//! Paired allocate/free helpers for memory handed across the boundary
//!
//! Every block starts with a hidden header holding its total size, so
//! [`bf_free`] needs nothing but the pointer.

use std::alloc::{self, Layout};
use std::ffi::{c_char, c_void};
use std::mem;

use batchflow_core::{Error, Result};

const HEADER: usize = 16;

/// Allocate `n` bytes aligned to 16 bytes. Returns null on failure.
#[no_mangle]
pub extern "C" fn bf_alloc(n: usize) -> *mut c_void {
    let Some(total) = n.checked_add(HEADER) else {
        return std::ptr::null_mut();
    };
    let Ok(layout) = Layout::from_size_align(total, HEADER) else {
        return std::ptr::null_mut();
    };
    // The layout is never zero-sized.
    let base = unsafe { alloc::alloc(layout) };
    if base.is_null() {
        return std::ptr::null_mut();
    }
    unsafe {
        base.cast::<usize>().write(total);
        base.add(HEADER).cast()
    }
}

/// Free memory returned by [`bf_alloc`] or by any call documented as
/// caller-freed. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer obtained from [`bf_alloc`] that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn bf_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let base = ptr.cast::<u8>().sub(HEADER);
        let total = base.cast::<usize>().read();
        alloc::dealloc(base, Layout::from_size_align_unchecked(total, HEADER));
    }
}

/// Copy `values` into a fresh [`bf_alloc`] block
pub(crate) fn alloc_slice<T: Copy>(values: &[T]) -> Result<*mut T> {
    debug_assert!(mem::align_of::<T>() <= HEADER);
    let bytes = mem::size_of_val(values);
    let ptr = bf_alloc(bytes).cast::<T>();
    if ptr.is_null() {
        return Err(Error::MemoryAllocationFailed {
            requested: bytes,
            memory: "host".into(),
        });
    }
    unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), ptr, values.len()) };
    Ok(ptr)
}

/// Copy `s` into a fresh NUL-terminated [`bf_alloc`] block
pub(crate) fn alloc_c_string(s: &str) -> Result<*mut c_char> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    Ok(alloc_slice(&bytes)?.cast())
}
