//! Output introspection, copies, traces and metadata
//!
//! Per-iteration queries read the newest held output and fail with a
//! sequencing status when nothing is held.

use std::ffi::{c_char, c_void};
use std::os::raw::{c_int, c_uint};

use batchflow_core::{Error, Result};

use crate::alloc::{alloc_slice, bf_free};
use crate::handle::{handle, BfPipeline};
use crate::status::{c_str, guard, to_usize, write_out};
use crate::types::{storage_device, BfExecutorMetadata, BfReaderMetadata, BF_EXT_FORCE_SYNC, BF_USE_COPY_KERNEL};

/// Returned for an undeclared dtype
pub const BF_NO_TYPE: c_int = -1;

fn shape_to_c(shape: &[usize]) -> Result<Vec<i64>> {
    shape
        .iter()
        .map(|&d| i64::try_from(d).map_err(|_| Error::InvalidArgument(format!("extent {d} exceeds int64"))))
        .collect()
}

/// Hand a shape to the caller as a `bf_alloc` array
unsafe fn write_shape(shape: &[usize], shape_out: *mut *mut i64, ndim_out: *mut c_int) -> Result<()> {
    if shape_out.is_null() || ndim_out.is_null() {
        return Err(Error::InvalidArgument("output pointer is null".into()));
    }
    let ndim = c_int::try_from(shape.len())
        .map_err(|_| Error::InvalidArgument("too many dimensions".into()))?;
    let array = alloc_slice(&shape_to_c(shape)?)?;
    unsafe {
        shape_out.write(array);
        ndim_out.write(ndim);
    }
    Ok(())
}

fn copy_flags(dst_type: c_int, flags: c_uint) -> Result<()> {
    storage_device(dst_type)?;
    if flags & !(BF_EXT_FORCE_SYNC | BF_USE_COPY_KERNEL) != 0 {
        return Err(Error::InvalidArgument(format!("unsupported copy flags {flags:#x}")));
    }
    Ok(())
}

/// Number of pipeline outputs.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_num_output(handle_ptr: *mut BfPipeline, out: *mut c_uint) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let n = c_uint::try_from(h.pipeline.num_outputs()).unwrap_or(c_uint::MAX);
        unsafe { write_out(out, n) }
    })
}

/// Name of output `i`, valid until the handle is deleted.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_output_name(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    out: *mut *const c_char,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = h.pipeline.output_name(to_usize(i, "output index")?)?.to_owned();
        let ptr = h.c_name(&name)?;
        unsafe { write_out(out, ptr) }
    })
}

/// Device tag of output `i`.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_output_device(handle_ptr: *mut BfPipeline, i: c_int, out: *mut c_int) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let device = h.pipeline.output_device(to_usize(i, "output index")?)?;
        unsafe { write_out(out, device.code()) }
    })
}

/// Declared dtype code of output `i`, [`BF_NO_TYPE`] if undeclared.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_declared_output_dtype(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let dtype = h.pipeline.declared_output_dtype(to_usize(i, "output index")?)?;
        unsafe { write_out(out, dtype.map_or(BF_NO_TYPE, |d| d.code())) }
    })
}

/// Declared sample dimensionality of output `i`, `-1` if undeclared.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_declared_output_ndim(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let ndim = h.pipeline.declared_output_ndim(to_usize(i, "output index")?)?;
        unsafe { write_out(out, ndim.map_or(-1, |n| c_int::try_from(n).unwrap_or(c_int::MAX))) }
    })
}

/// 1 if every sample of held output `i` has the same shape, else 0.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_output_has_uniform_shape(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let uniform = h.pipeline.output_has_uniform_shape(to_usize(i, "output index")?)?;
        unsafe { write_out(out, c_int::from(uniform)) }
    })
}

/// Dense shape `[batch, d0, ...]` of held output `i`, which must be
/// uniform. The array is caller-freed with `bf_free`.
///
/// # Safety
///
/// `handle` must be a live handle; both outputs valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_shape_at(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    shape_out: *mut *mut i64,
    ndim_out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let shape = h
            .pipeline
            .output_shape(to_usize(i, "output index")?)?
            .ok_or_else(|| Error::InvalidArgument(format!("output {i} has non-uniform sample shapes")))?;
        unsafe { write_shape(&shape, shape_out, ndim_out) }
    })
}

/// Shape of sample `k` of held output `i`, caller-freed with `bf_free`.
///
/// # Safety
///
/// `handle` must be a live handle; both outputs valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_shape_at_sample(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    k: c_int,
    shape_out: *mut *mut i64,
    ndim_out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let shape = h
            .pipeline
            .output_sample_shape(to_usize(i, "output index")?, to_usize(k, "sample index")?)?;
        unsafe { write_shape(shape, shape_out, ndim_out) }
    })
}

/// Dtype code of held output `i`.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_type_at(handle_ptr: *mut BfPipeline, i: c_int, out: *mut c_int) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let dtype = h.pipeline.output_dtype(to_usize(i, "output index")?)?;
        unsafe { write_out(out, dtype.code()) }
    })
}

macro_rules! output_count {
    ($(#[$doc:meta])* $name:ident => $method:ident) => {
        $(#[$doc])*
        ///
        /// # Safety
        ///
        /// `handle` must be a live handle and `out` valid for writes.
        #[no_mangle]
        pub unsafe extern "C" fn $name(handle_ptr: *mut BfPipeline, i: c_int, out: *mut usize) -> c_int {
            guard(|| {
                let h = unsafe { handle(handle_ptr)? };
                let value = h.pipeline.$method(to_usize(i, "output index")?)?;
                unsafe { write_out(out, value) }
            })
        }
    };
}

output_count!(
    /// Number of samples in held output `i`
    bf_num_tensors => output_num_tensors
);
output_count!(
    /// Number of elements in held output `i`
    bf_num_elements => output_num_elements
);
output_count!(
    /// Payload bytes of held output `i`
    bf_tensor_size => output_nbytes
);
output_count!(
    /// Sample dimensionality of held output `i`
    bf_max_dim_tensors => output_sample_dim
);

/// Copy held output `i` densely into `dst`, which must hold
/// `bf_tensor_size` bytes. The output must have a uniform shape. Copies
/// complete before the call returns.
///
/// # Safety
///
/// `handle` must be a live handle and `dst` valid for writes of the
/// output's size.
#[no_mangle]
pub unsafe extern "C" fn bf_output_copy(
    handle_ptr: *mut BfPipeline,
    dst: *mut c_void,
    i: c_int,
    dst_type: c_int,
    flags: c_uint,
) -> c_int {
    guard(|| {
        copy_flags(dst_type, flags)?;
        let h = unsafe { handle(handle_ptr)? };
        let i = to_usize(i, "output index")?;
        let len = h.pipeline.output_nbytes(i)?;
        if dst.is_null() && len > 0 {
            return Err(Error::InvalidArgument("destination is null".into()));
        }
        let dst: &mut [u8] = if len == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(dst.cast(), len) }
        };
        h.pipeline.output_copy(i, dst)
    })
}

/// Copy each sample of held output `i` to its own destination; a null
/// destination skips the sample.
///
/// # Safety
///
/// `dsts` must hold one pointer per sample, each null or valid for writes
/// of that sample's size.
#[no_mangle]
pub unsafe extern "C" fn bf_output_copy_samples(
    handle_ptr: *mut BfPipeline,
    dsts: *mut *mut c_void,
    i: c_int,
    dst_type: c_int,
    flags: c_uint,
) -> c_int {
    guard(|| {
        copy_flags(dst_type, flags)?;
        let h = unsafe { handle(handle_ptr)? };
        let i = to_usize(i, "output index")?;
        let tensor = h.pipeline.output_tensor(i)?;
        let n = tensor.num_samples();
        if dsts.is_null() && n > 0 {
            return Err(Error::InvalidArgument("destination array is null".into()));
        }
        let ptrs: &[*mut c_void] = if n == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(dsts, n) }
        };
        let mut targets: Vec<Option<&mut [u8]>> = Vec::with_capacity(n);
        for (k, &ptr) in ptrs.iter().enumerate() {
            if ptr.is_null() {
                targets.push(None);
            } else {
                let len = tensor.sample_nbytes(k)?;
                targets.push(Some(unsafe { std::slice::from_raw_parts_mut(ptr.cast(), len) }));
            }
        }
        h.pipeline.output_copy_samples(i, &mut targets)
    })
}

/// Legacy form of [`bf_output_copy`]; copies are always complete on
/// return, so `non_blocking` is ignored.
///
/// # Safety
///
/// As for [`bf_output_copy`].
#[no_mangle]
pub unsafe extern "C" fn bf_copy_tensor_list_n_to(
    handle_ptr: *mut BfPipeline,
    dst: *mut c_void,
    i: c_int,
    dst_type: c_int,
    _non_blocking: c_int,
) -> c_int {
    unsafe { bf_output_copy(handle_ptr, dst, i, dst_type, 0) }
}

/// 1 if `operator` published `key` for the held iteration, else 0.
///
/// # Safety
///
/// `handle` must be a live handle, names NUL-terminated and `out` valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_has_operator_trace(
    handle_ptr: *mut BfPipeline,
    operator_name: *const c_char,
    trace_name: *const c_char,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let operator = unsafe { c_str(operator_name, "operator name")? };
        let key = unsafe { c_str(trace_name, "trace name")? };
        let present = h.pipeline.has_operator_trace(operator, key)?;
        unsafe { write_out(out, c_int::from(present)) }
    })
}

/// Trace value, valid until the next output, share or release.
///
/// # Safety
///
/// As for [`bf_has_operator_trace`].
#[no_mangle]
pub unsafe extern "C" fn bf_get_operator_trace(
    handle_ptr: *mut BfPipeline,
    operator_name: *const c_char,
    trace_name: *const c_char,
    out: *mut *const c_char,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let operator = unsafe { c_str(operator_name, "operator name")? };
        let key = unsafe { c_str(trace_name, "trace name")? };
        let ptr = h.c_trace(operator, key)?;
        unsafe { write_out(out, ptr) }
    })
}

/// Epoch and sharding information of a reader.
///
/// # Safety
///
/// `handle` must be a live handle, `reader_name` NUL-terminated and `out`
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_reader_metadata(
    handle_ptr: *mut BfPipeline,
    reader_name: *const c_char,
    out: *mut BfReaderMetadata,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(reader_name, "reader name")? };
        let meta = h.pipeline.reader_metadata(name)?;
        unsafe { write_out(out, BfReaderMetadata::from(meta)) }
    })
}

/// Backend code of an operator (0 CPU, 1 GPU, 2 mixed).
///
/// # Safety
///
/// `handle` must be a live handle, `operator_name` NUL-terminated and
/// `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_operator_backend(
    handle_ptr: *mut BfPipeline,
    operator_name: *const c_char,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(operator_name, "operator name")? };
        let backend = h.pipeline.operator_backend(name)?;
        unsafe { write_out(out, backend.code()) }
    })
}

/// Per-operator output sizes, empty unless memory statistics were
/// enabled. The array is released with [`bf_free_executor_metadata`].
///
/// # Safety
///
/// `handle` must be a live handle; both outputs valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_executor_metadata(
    handle_ptr: *mut BfPipeline,
    meta_out: *mut *mut BfExecutorMetadata,
    n_out: *mut usize,
) -> c_int {
    guard(|| {
        if meta_out.is_null() || n_out.is_null() {
            return Err(Error::InvalidArgument("output pointer is null".into()));
        }
        let h = unsafe { handle(handle_ptr)? };
        let stats = h.pipeline.executor_metadata();
        let mut entries = Vec::with_capacity(stats.len());
        for op in &stats {
            match BfExecutorMetadata::from_stats(op) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    for entry in &mut entries {
                        unsafe { entry.free_fields() };
                    }
                    return Err(e);
                }
            }
        }
        let n = entries.len();
        let array = if n == 0 {
            std::ptr::null_mut()
        } else {
            let bytes = n * std::mem::size_of::<BfExecutorMetadata>();
            let ptr = crate::alloc::bf_alloc(bytes).cast::<BfExecutorMetadata>();
            if ptr.is_null() {
                for entry in &mut entries {
                    unsafe { entry.free_fields() };
                }
                return Err(Error::MemoryAllocationFailed {
                    requested: bytes,
                    memory: "host".into(),
                });
            }
            for (k, entry) in entries.into_iter().enumerate() {
                unsafe { ptr.add(k).write(entry) };
            }
            ptr
        };
        unsafe {
            meta_out.write(array);
            n_out.write(n);
        }
        Ok(())
    })
}

/// Free an array returned by [`bf_get_executor_metadata`].
///
/// # Safety
///
/// `meta` must be null or an array of `n` entries returned by
/// [`bf_get_executor_metadata`], not freed yet.
#[no_mangle]
pub unsafe extern "C" fn bf_free_executor_metadata(meta: *mut BfExecutorMetadata, n: usize) {
    if meta.is_null() {
        return;
    }
    for k in 0..n {
        unsafe { (*meta.add(k)).free_fields() };
    }
    unsafe { bf_free(meta.cast()) };
}
