//! Pipeline handle lifecycle and execution

use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::os::raw::{c_int, c_uint};

use batchflow_core::{ConfigOverrides, Error, Pipeline, Result};
use tracing::debug;

use crate::status::{byte_slice, guard, to_usize, write_out};
use crate::types::executor_config;

/// Opaque pipeline handle
pub struct BfPipeline {
    pub(crate) pipeline: Pipeline,
    names: HashMap<String, CString>,
    traces: HashMap<(String, String), CString>,
}

fn intern<K>(cache: &mut HashMap<K, CString>, key: K, value: &str) -> Result<*const c_char>
where
    K: std::hash::Hash + Eq,
{
    if let Some(s) = cache.get(&key) {
        return Ok(s.as_ptr());
    }
    let s = CString::new(value)
        .map_err(|_| Error::InvalidArgument(format!("'{value}' contains a NUL byte")))?;
    let ptr = s.as_ptr();
    cache.insert(key, s);
    Ok(ptr)
}

impl BfPipeline {
    fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            names: HashMap::new(),
            traces: HashMap::new(),
        }
    }

    /// C copy of a name, valid until the handle is deleted
    pub(crate) fn c_name(&mut self, name: &str) -> Result<*const c_char> {
        intern(&mut self.names, name.to_owned(), name)
    }

    /// C copy of a trace value, valid until the held outputs change
    pub(crate) fn c_trace(&mut self, operator: &str, key: &str) -> Result<*const c_char> {
        let value = self.pipeline.operator_trace(operator, key)?;
        intern(&mut self.traces, (operator.to_owned(), key.to_owned()), value)
    }

    fn outputs_changed(&mut self) {
        self.traces.clear();
    }
}

/// Borrow the handle behind `ptr`.
///
/// # Safety
///
/// `ptr` must be null or a live handle not borrowed elsewhere.
pub(crate) unsafe fn handle<'a>(ptr: *mut BfPipeline) -> Result<&'a mut BfPipeline> {
    unsafe { ptr.as_mut() }.ok_or_else(|| Error::InvalidArgument("pipeline handle is null".into()))
}

unsafe fn serialized<'a>(ptr: *const c_char, length: c_int) -> Result<&'a str> {
    let bytes = unsafe { byte_slice(ptr, to_usize(length, "serialized length")?, "serialized pipeline")? };
    std::str::from_utf8(bytes)
        .map_err(|_| Error::InvalidArgument("serialized pipeline is not valid UTF-8".into()))
}

fn optional_count(value: c_int) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Initialize the library: logging from the environment, core and
/// reference operators. Must precede any pipeline creation; idempotent.
#[no_mangle]
pub extern "C" fn bf_initialize() -> c_int {
    guard(|| {
        batchflow_core::logging::init_logging_from_env();
        batchflow_ops::init()
    })
}

/// Create a pipeline from its serialized graph.
///
/// `max_batch_size` and `num_threads` replace the serialized values unless
/// negative. `device_id` always replaces the serialized value; a negative
/// id builds a CPU-only pipeline. Queue depths are read according to
/// `BF_EXEC_SEPARATED` in `exec_flags`.
///
/// # Safety
///
/// `out` must be valid for writes and `serialized_pipeline` valid for
/// reads of `length` bytes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn bf_create_pipeline(
    out: *mut *mut BfPipeline,
    serialized_pipeline: *const c_char,
    length: c_int,
    max_batch_size: c_int,
    num_threads: c_int,
    device_id: c_int,
    exec_flags: c_uint,
    prefetch_queue_depth: c_int,
    cpu_prefetch_queue_depth: c_int,
    gpu_prefetch_queue_depth: c_int,
    enable_memory_stats: c_int,
) -> c_int {
    guard(|| {
        let json = unsafe { serialized(serialized_pipeline, length)? };
        let overrides = ConfigOverrides {
            max_batch_size: optional_count(max_batch_size),
            num_threads: optional_count(num_threads),
            device_id: Some(device_id),
            executor: Some(executor_config(
                exec_flags,
                prefetch_queue_depth,
                cpu_prefetch_queue_depth,
                gpu_prefetch_queue_depth,
            )?),
            enable_checkpointing: None,
            enable_memory_stats: Some(enable_memory_stats != 0),
        };
        let pipeline = Pipeline::from_serialized(json, &overrides)?;
        debug!(pipeline = %pipeline.id(), "handle created");
        unsafe { write_out(out, Box::into_raw(Box::new(BfPipeline::new(pipeline))))? };
        Ok(())
    })
}

/// Create a pipeline with every parameter taken from the serialized graph.
///
/// # Safety
///
/// As for [`bf_create_pipeline`].
#[no_mangle]
pub unsafe extern "C" fn bf_deserialize_default(
    out: *mut *mut BfPipeline,
    serialized_pipeline: *const c_char,
    length: c_int,
) -> c_int {
    guard(|| {
        let json = unsafe { serialized(serialized_pipeline, length)? };
        let pipeline = Pipeline::deserialize_default(json)?;
        unsafe { write_out(out, Box::into_raw(Box::new(BfPipeline::new(pipeline))))? };
        Ok(())
    })
}

/// 1 if the bytes describe a pipeline this library can build, else 0.
///
/// # Safety
///
/// `serialized_pipeline` must be valid for reads of `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn bf_is_deserializable(serialized_pipeline: *const c_char, length: c_int) -> c_int {
    match unsafe { serialized(serialized_pipeline, length) } {
        Ok(json) => c_int::from(batchflow_core::is_deserializable(json)),
        Err(_) => 0,
    }
}

/// Destroy a handle, draining in-flight work. Null is ignored.
///
/// # Safety
///
/// `handle` must be null or a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn bf_delete_pipeline(handle: *mut BfPipeline) -> c_int {
    guard(|| {
        if !handle.is_null() {
            drop(unsafe { Box::from_raw(handle) });
        }
        Ok(())
    })
}

/// Largest batch size the pipeline accepts.
///
/// # Safety
///
/// `handle` must be a live handle and `out` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn bf_get_max_batch_size(handle_ptr: *mut BfPipeline, out: *mut c_int) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        let n = c_int::try_from(h.pipeline.max_batch_size())
            .map_err(|_| Error::InvalidArgument("batch size exceeds int".into()))?;
        unsafe { write_out(out, n) }
    })
}

/// Fill every stage queue. Each external input must have been fed exactly
/// its feed count.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_prefetch(handle_ptr: *mut BfPipeline) -> c_int {
    guard(|| unsafe { handle(handle_ptr)? }.pipeline.prefetch())
}

/// Legacy form of [`bf_prefetch`]; `queue_depth` must equal the
/// configured depth.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_prefetch_uniform(handle_ptr: *mut BfPipeline, queue_depth: c_int) -> c_int {
    guard(|| {
        let depth = to_usize(queue_depth, "queue depth")?;
        unsafe { handle(handle_ptr)? }.pipeline.prefetch_uniform(depth)
    })
}

/// Legacy form of [`bf_prefetch`] for separated queues.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_prefetch_separate(
    handle_ptr: *mut BfPipeline,
    cpu_queue_depth: c_int,
    gpu_queue_depth: c_int,
) -> c_int {
    guard(|| {
        let cpu = to_usize(cpu_queue_depth, "CPU queue depth")?;
        let gpu = to_usize(gpu_queue_depth, "GPU queue depth")?;
        unsafe { handle(handle_ptr)? }.pipeline.prefetch_separate(cpu, gpu)
    })
}

/// Schedule one iteration.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_run(handle_ptr: *mut BfPipeline) -> c_int {
    guard(|| unsafe { handle(handle_ptr)? }.pipeline.run())
}

/// Wait for the oldest iteration and hold its results, releasing any
/// previously held output first.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_output(handle_ptr: *mut BfPipeline) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        h.outputs_changed();
        h.pipeline.output().map(|_| ())
    })
}

/// Wait for the oldest iteration and hold its results alongside those
/// already held.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_share_output(handle_ptr: *mut BfPipeline) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        h.outputs_changed();
        h.pipeline.share_output().map(|_| ())
    })
}

/// Release the oldest held output.
///
/// # Safety
///
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn bf_output_release(handle_ptr: *mut BfPipeline) -> c_int {
    guard(|| {
        let h = unsafe { handle(handle_ptr)? };
        h.outputs_changed();
        h.pipeline.release_output()
    })
}
