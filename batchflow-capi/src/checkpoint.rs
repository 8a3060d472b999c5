//! Checkpoint capture and restore

use std::ffi::c_char;
use std::os::raw::c_int;

use batchflow_core::{Error, ExternalContext, Result};

use crate::alloc::{alloc_slice, bf_free};
use crate::handle::{handle, BfPipeline};
use crate::status::{byte_slice, guard};
use crate::types::{BfExternalContextCheckpoint, BfExternalContextField};

unsafe fn field_bytes(field: &BfExternalContextField, what: &str) -> Result<Vec<u8>> {
    Ok(unsafe { byte_slice(field.data, field.size, what)? }.to_vec())
}

/// Serialize the pipeline state as of the last consumed output, together
/// with `external_context` (may be null). The blob is caller-freed with
/// `bf_free`.
///
/// # Safety
///
/// `handle` must be a live handle; `checkpoint` and `n` valid for writes;
/// `external_context` null or valid for reads.
#[no_mangle]
pub unsafe extern "C" fn bf_get_serialized_checkpoint(
    handle_ptr: *mut BfPipeline,
    external_context: *const BfExternalContextCheckpoint,
    checkpoint: *mut *mut c_char,
    n: *mut usize,
) -> c_int {
    guard(|| {
        if checkpoint.is_null() || n.is_null() {
            return Err(Error::InvalidArgument("output pointer is null".into()));
        }
        let h = unsafe { handle(handle_ptr)? };
        let context = match unsafe { external_context.as_ref() } {
            Some(ctx) => ExternalContext {
                pipeline_data: unsafe { field_bytes(&ctx.pipeline_data, "pipeline data")? },
                iterator_data: unsafe { field_bytes(&ctx.iterator_data, "iterator data")? },
            },
            None => ExternalContext::default(),
        };
        let bytes = h.pipeline.serialized_checkpoint(&context)?;
        let blob = alloc_slice(&bytes)?;
        unsafe {
            checkpoint.write(blob.cast());
            n.write(bytes.len());
        }
        Ok(())
    })
}

/// Restore operator state before the first prefetch or run. The stored
/// external context is written to `external_context` unless it is null;
/// free its fields with [`bf_destroy_external_context_checkpoint`].
///
/// # Safety
///
/// `handle` must be a live handle, `checkpoint` valid for reads of `n`
/// bytes and `external_context` null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_restore_from_serialized_checkpoint(
    handle_ptr: *mut BfPipeline,
    checkpoint: *const c_char,
    n: usize,
    external_context: *mut BfExternalContextCheckpoint,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let bytes = unsafe { byte_slice(checkpoint, n, "checkpoint")? };
        let context = h.pipeline.restore_from_serialized_checkpoint(bytes)?;
        if !external_context.is_null() {
            let pipeline_data = BfExternalContextField::from_bytes(&context.pipeline_data)?;
            let iterator_data = match BfExternalContextField::from_bytes(&context.iterator_data) {
                Ok(field) => field,
                Err(e) => {
                    unsafe { bf_free(pipeline_data.data.cast()) };
                    return Err(e);
                }
            };
            unsafe {
                external_context.write(BfExternalContextCheckpoint {
                    pipeline_data,
                    iterator_data,
                });
            }
        }
        Ok(())
    })
}

/// Free the fields of an external context filled by
/// [`bf_restore_from_serialized_checkpoint`] and reset them to empty.
///
/// # Safety
///
/// `external_context` must be null or hold fields allocated by this
/// library and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn bf_destroy_external_context_checkpoint(
    external_context: *mut BfExternalContextCheckpoint,
) {
    let Some(ctx) = (unsafe { external_context.as_mut() }) else {
        return;
    };
    for field in [&mut ctx.pipeline_data, &mut ctx.iterator_data] {
        unsafe { bf_free(field.data.cast()) };
        field.data = std::ptr::null_mut();
        field.size = 0;
    }
}
