//! Process-wide memory pool control

use std::os::raw::c_int;

use tracing::debug;

use crate::status::guard;

/// Return every unreferenced pooled block to the system.
#[no_mangle]
pub extern "C" fn bf_release_unused_memory() -> c_int {
    guard(|| {
        let released = batchflow_core::release_unused_memory();
        debug!(released, "released unused memory");
        Ok(())
    })
}

/// Reserve `bytes` in the pool of `device_id`; a negative id selects the
/// default device.
#[no_mangle]
pub extern "C" fn bf_preallocate_device_memory(bytes: usize, device_id: c_int) -> c_int {
    guard(|| batchflow_core::preallocate_device_memory(bytes, device_id))
}

/// Reserve `bytes` in the pinned host pool.
#[no_mangle]
pub extern "C" fn bf_preallocate_pinned_memory(bytes: usize) -> c_int {
    guard(|| batchflow_core::preallocate_pinned_memory(bytes))
}
