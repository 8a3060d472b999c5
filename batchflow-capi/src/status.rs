//! Status codes and per-thread error messages

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};

use batchflow_core::{Error, ErrorKind, Result};
use tracing::{error, warn};

/// Success
pub const BF_OK: c_int = 0;

/// Malformed graph, bad parameter or feed contract violation
pub const BF_ERROR_CONFIGURATION: c_int = 1;

/// Call made in the wrong state
pub const BF_ERROR_SEQUENCING: c_int = 2;

/// An operator failed while processing data
pub const BF_ERROR_OPERATOR: c_int = 3;

/// Allocation failure
pub const BF_ERROR_RESOURCE: c_int = 4;

/// Internal failure, including a caught panic
pub const BF_ERROR_INTERNAL: c_int = 5;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning its result into a status code. Panics are caught and
/// reported as internal errors.
pub(crate) fn guard<F>(f: F) -> c_int
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {
            clear_last_error();
            BF_OK
        }
        Ok(Err(e)) => {
            let code = e.kind().code();
            if e.kind() == ErrorKind::Operator {
                error!(error = %e, "call failed");
            } else {
                warn!(error = %e, "call failed");
            }
            set_last_error(&e.to_string());
            code
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "panic caught at the C boundary");
            set_last_error(&format!("internal error: {message}"));
            BF_ERROR_INTERNAL
        }
    }
}

/// Message of the last failed call on this thread, or null if the last
/// call succeeded. Valid until the next call on this thread.
#[no_mangle]
pub extern "C" fn bf_get_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(std::ptr::null(), |s| s.as_ptr()))
}

/// Borrow a NUL-terminated UTF-8 string.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::InvalidArgument(format!("{what} is not valid UTF-8")))
}

/// Borrow `len` bytes.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes for `'a`.
pub(crate) unsafe fn byte_slice<'a>(ptr: *const c_char, len: usize, what: &str) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{what} is null")));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) })
}

/// Store `value` through an out-pointer.
///
/// # Safety
///
/// `out` must be null or valid for writes.
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T) -> Result<()> {
    if out.is_null() {
        return Err(Error::InvalidArgument("output pointer is null".into()));
    }
    unsafe { out.write(value) };
    Ok(())
}

/// Convert a caller count or index to `usize`
pub(crate) fn to_usize(value: c_int, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidArgument(format!("{what} must not be negative, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_error() -> Option<String> {
        let ptr = bf_get_last_error();
        (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    #[test]
    fn test_codes_follow_error_kinds() {
        assert_eq!(BF_ERROR_CONFIGURATION, ErrorKind::Configuration.code());
        assert_eq!(BF_ERROR_SEQUENCING, ErrorKind::Sequencing.code());
        assert_eq!(BF_ERROR_OPERATOR, ErrorKind::Operator.code());
        assert_eq!(BF_ERROR_RESOURCE, ErrorKind::Resource.code());
        assert_eq!(BF_ERROR_INTERNAL, ErrorKind::Internal.code());
    }

    #[test]
    fn test_guard_records_and_clears_last_error() {
        let status = guard(|| Err(Error::UnknownName("nope".into())));
        assert_eq!(status, BF_ERROR_CONFIGURATION);
        assert!(last_error().unwrap().contains("nope"));

        assert_eq!(guard(|| Ok(())), BF_OK);
        assert!(last_error().is_none());
    }

    #[test]
    fn test_guard_catches_panics() {
        let status = guard(|| panic!("boom"));
        assert_eq!(status, BF_ERROR_INTERNAL);
        assert!(last_error().unwrap().contains("boom"));
    }

    #[test]
    fn test_negative_counts_are_rejected() {
        assert_eq!(to_usize(3, "n").unwrap(), 3);
        assert!(to_usize(-1, "n").is_err());
    }
}
