//! Feeding external inputs
//!
//! Data is described by a device tag, a dtype code, `batch_size *
//! sample_dim` shape extents and an optional layout string. The batch size
//! is the one set with `bf_set_external_input_batch_size`, or the maximum
//! batch size.
//!
//! Sync variants return once the caller's memory may be reused, except for
//! no-copy feeds: adopted memory must stay valid and unmodified until the
//! output consuming it has been released.

use std::ffi::{c_char, c_void};
use std::os::raw::{c_int, c_uint};

use batchflow_core::{
    Buffer, DataType, Error, Event, ExternalBatch, FeedData, Pipeline, Result, TensorLayout,
};

use crate::handle::{handle, BfPipeline};
use crate::status::{c_str, guard, to_usize, write_out};
use crate::types::{feed_options, source_memory, storage_device};

/// Completion of an asynchronous feed
pub struct BfEvent(Event);

/// Where the caller's samples live
#[derive(Clone, Copy)]
enum Source {
    Contiguous(*const c_void),
    Scattered(*const *const c_void),
}

struct Description {
    device: c_int,
    dtype: c_int,
    shapes: *const i64,
    sample_dim: c_int,
    layout: *const c_char,
}

/// Wrap caller memory as an [`ExternalBatch`] for `name`.
///
/// # Safety
///
/// Every pointer in `source` and `desc` must be valid for the sizes the
/// shapes imply, for as long as the pipeline may read them.
unsafe fn external_batch(
    pipeline: &Pipeline,
    name: &str,
    source: Source,
    desc: &Description,
) -> Result<ExternalBatch> {
    let batch_size = pipeline.external_input_batch_size(name)?;
    let sample_dim = to_usize(desc.sample_dim, "sample_dim")?;
    let dtype = DataType::from_code(desc.dtype)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown dtype code {}", desc.dtype)))?;
    let memory = source_memory(storage_device(desc.device)?, pipeline.config().device_id);

    let extents = batch_size * sample_dim;
    let shapes: Vec<usize> = if extents == 0 {
        Vec::new()
    } else {
        if desc.shapes.is_null() {
            return Err(Error::InvalidArgument("shapes pointer is null".into()));
        }
        unsafe { std::slice::from_raw_parts(desc.shapes, extents) }
            .iter()
            .map(|&d| usize::try_from(d).map_err(|_| Error::InvalidArgument(format!("negative extent {d}"))))
            .collect::<Result<_>>()?
    };
    let sample_bytes: Vec<usize> = (0..batch_size)
        .map(|k| {
            shapes[k * sample_dim..(k + 1) * sample_dim]
                .iter()
                .product::<usize>()
                * dtype.size()
        })
        .collect();

    let data = match source {
        Source::Contiguous(ptr) => {
            let total = sample_bytes.iter().sum();
            FeedData::Contiguous(unsafe { Buffer::from_raw_parts(ptr.cast(), total, memory)? })
        }
        Source::Scattered(ptrs) => {
            if ptrs.is_null() && batch_size > 0 {
                return Err(Error::InvalidArgument("sample pointer array is null".into()));
            }
            let ptrs = if batch_size == 0 {
                &[][..]
            } else {
                unsafe { std::slice::from_raw_parts(ptrs, batch_size) }
            };
            let buffers = ptrs
                .iter()
                .zip(&sample_bytes)
                .map(|(&ptr, &len)| unsafe { Buffer::from_raw_parts(ptr.cast(), len, memory) })
                .collect::<Result<Vec<_>>>()?;
            FeedData::Scattered(buffers)
        }
    };

    let layout = if desc.layout.is_null() {
        TensorLayout::empty()
    } else {
        TensorLayout::new(unsafe { c_str(desc.layout, "layout")? })?
    };
    Ok(ExternalBatch {
        data,
        shapes,
        sample_dim,
        dtype,
        layout,
    })
}

/// Shared body of every feed entry point
unsafe fn feed(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    source: Source,
    desc: &Description,
    flags: c_uint,
    event_out: Option<*mut *mut BfEvent>,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let options = feed_options(flags)?;
        let batch = unsafe { external_batch(&h.pipeline, name, source, desc)? };
        match event_out {
            None => h.pipeline.feed_input(name, batch, options),
            Some(out) => {
                if out.is_null() {
                    return Err(Error::InvalidArgument("event output pointer is null".into()));
                }
                let event = h.pipeline.feed_input_async(name, batch, options)?;
                unsafe { write_out(out, Box::into_raw(Box::new(BfEvent(event)))) }
            }
        }
    })
}

/// Override the batch size of the next feed on `name`.
///
/// # Safety
///
/// `handle` must be a live handle and `name` a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn bf_set_external_input_batch_size(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    batch_size: c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        h.pipeline
            .set_external_input_batch_size(name, to_usize(batch_size, "batch size")?)
    })
}

/// Tag the next feed on `name` with a data id, published as the
/// `next_output_data_id` trace of the input.
///
/// # Safety
///
/// `handle` must be a live handle; `name` and `data_id` NUL-terminated
/// strings.
#[no_mangle]
pub unsafe extern "C" fn bf_set_external_input_data_id(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    data_id: *const c_char,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let data_id = unsafe { c_str(data_id, "data id")? };
        h.pipeline.set_external_input_data_id(name, data_id)
    })
}

/// Number of feeds `name` needs before the next prefetch or run.
///
/// # Safety
///
/// `handle` must be a live handle, `name` a NUL-terminated string and
/// `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_input_feed_count(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let count = h.pipeline.input_feed_count(name)?;
        unsafe { write_out(out, c_int::try_from(count).unwrap_or(c_int::MAX)) }
    })
}

/// Feed one contiguous batch.
///
/// # Safety
///
/// `data` must hold every sample back to back; `shapes` must hold
/// `batch_size * sample_dim` extents; `layout` may be null.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn bf_set_external_input(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    device: c_int,
    data: *const c_void,
    dtype: c_int,
    shapes: *const i64,
    sample_dim: c_int,
    layout: *const c_char,
    flags: c_uint,
) -> c_int {
    let desc = Description { device, dtype, shapes, sample_dim, layout };
    unsafe { feed(handle_ptr, name, Source::Contiguous(data), &desc, flags, None) }
}

/// Feed one contiguous batch without waiting for the copy. The caller
/// must keep `data` unmodified until the event stored in `event_out` is
/// set, then destroy the event with [`bf_event_destroy`].
///
/// # Safety
///
/// As for [`bf_set_external_input`]; `event_out` must be valid for writes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn bf_set_external_input_async(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    device: c_int,
    data: *const c_void,
    dtype: c_int,
    shapes: *const i64,
    sample_dim: c_int,
    layout: *const c_char,
    flags: c_uint,
    event_out: *mut *mut BfEvent,
) -> c_int {
    let desc = Description { device, dtype, shapes, sample_dim, layout };
    unsafe { feed(handle_ptr, name, Source::Contiguous(data), &desc, flags, Some(event_out)) }
}

/// Feed one batch given as one pointer per sample.
///
/// # Safety
///
/// `data` must hold `batch_size` sample pointers, each valid for its
/// sample's size; otherwise as for [`bf_set_external_input`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn bf_set_external_input_tensors(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    device: c_int,
    data: *const *const c_void,
    dtype: c_int,
    shapes: *const i64,
    sample_dim: c_int,
    layout: *const c_char,
    flags: c_uint,
) -> c_int {
    let desc = Description { device, dtype, shapes, sample_dim, layout };
    unsafe { feed(handle_ptr, name, Source::Scattered(data), &desc, flags, None) }
}

/// Asynchronous form of [`bf_set_external_input_tensors`].
///
/// # Safety
///
/// As for [`bf_set_external_input_tensors`] and
/// [`bf_set_external_input_async`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn bf_set_external_input_tensors_async(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    device: c_int,
    data: *const *const c_void,
    dtype: c_int,
    shapes: *const i64,
    sample_dim: c_int,
    layout: *const c_char,
    flags: c_uint,
    event_out: *mut *mut BfEvent,
) -> c_int {
    let desc = Description { device, dtype, shapes, sample_dim, layout };
    unsafe { feed(handle_ptr, name, Source::Scattered(data), &desc, flags, Some(event_out)) }
}

/// Block until the feed behind `event` no longer reads caller memory.
///
/// # Safety
///
/// `event` must be null or a live event.
#[no_mangle]
pub unsafe extern "C" fn bf_event_wait(event: *const BfEvent) {
    if let Some(event) = unsafe { event.as_ref() } {
        event.0.wait();
    }
}

/// 1 if the event is set, else 0.
///
/// # Safety
///
/// `event` must be null or a live event.
#[no_mangle]
pub unsafe extern "C" fn bf_event_query(event: *const BfEvent) -> c_int {
    unsafe { event.as_ref() }.map_or(0, |event| c_int::from(event.0.is_set()))
}

/// Destroy an event. Null is ignored.
///
/// # Safety
///
/// `event` must be null or a live event; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn bf_event_destroy(event: *mut BfEvent) {
    if !event.is_null() {
        drop(unsafe { Box::from_raw(event) });
    }
}

/// Number of external inputs.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_num_external_input(handle_ptr: *mut BfPipeline, out: *mut c_int) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let n = c_int::try_from(h.pipeline.num_external_inputs()).unwrap_or(c_int::MAX);
        unsafe { write_out(out, n) }
    })
}

/// Name of the `i`-th external input in lexicographic order, valid until
/// the handle is deleted.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_external_input_name(
    handle_ptr: *mut BfPipeline,
    i: c_int,
    out: *mut *const c_char,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = h.pipeline.external_input_name(to_usize(i, "input index")?)?.to_owned();
        let ptr = h.c_name(&name)?;
        unsafe { write_out(out, ptr) }
    })
}

/// Layout required by `name`, empty when undetermined; valid until the
/// handle is deleted.
///
/// # Safety
///
/// `handle` must be a live handle, `name` NUL-terminated and `out` valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_external_input_layout(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    out: *mut *const c_char,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let layout = h.pipeline.external_input_layout(name)?.as_str().to_owned();
        let ptr = h.c_name(&layout)?;
        unsafe { write_out(out, ptr) }
    })
}

/// Dtype code required by `name`, `BF_NO_TYPE` when undetermined.
///
/// # Safety
///
/// As for [`bf_get_external_input_layout`].
#[no_mangle]
pub unsafe extern "C" fn bf_get_external_input_type(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let dtype = h.pipeline.external_input_dtype(name)?;
        unsafe { write_out(out, dtype.map_or(crate::output::BF_NO_TYPE, DataType::code)) }
    })
}

/// Sample dimensionality required by `name`, `-1` when undetermined.
///
/// # Safety
///
/// As for [`bf_get_external_input_layout`].
#[no_mangle]
pub unsafe extern "C" fn bf_get_external_input_ndim(
    handle_ptr: *mut BfPipeline,
    name: *const c_char,
    out: *mut c_int,
) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let name = unsafe { c_str(name, "input name")? };
        let ndim = h.pipeline.external_input_ndim(name)?;
        unsafe { write_out(out, ndim) }
    })
}
