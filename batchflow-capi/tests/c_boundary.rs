//! The C boundary driven the way a C caller would drive it

use std::ffi::{c_char, c_void, CStr, CString};
use std::os::raw::{c_int, c_uint};
use std::ptr;

use batchflow::*;
use batchflow_core::builtin::{EXTERNAL_SOURCE, NEXT_OUTPUT_DATA_ID};
use batchflow_core::{Backend, DataType, GraphDef, OperatorDef, OutputDef, PipelineConfig};
use batchflow_ops::{AFFINE, COIN_FLIP, SYNTHETIC_READER};

const SAMPLE: [i64; 3] = [2, 2, 3];
const SAMPLE_BYTES: usize = 12;

fn c(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn last_error() -> String {
    let ptr = bf_get_last_error();
    assert!(!ptr.is_null(), "no error recorded");
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// `src (HWC uint8) -> Affine x2 -> scaled`
fn image_graph() -> String {
    GraphDef::new(PipelineConfig::default())
        .operator(
            OperatorDef::new("src", EXTERNAL_SOURCE, Backend::Cpu)
                .arg("layout", "HWC")
                .output(OutputDef::typed("raw", DataType::UInt8, 3)),
        )
        .operator(
            OperatorDef::new("scale", AFFINE, Backend::Cpu)
                .arg("scale", 2.0)
                .input("raw")
                .output(OutputDef::typed("scaled", DataType::Float32, 3)),
        )
        .pipeline_output("scaled")
        .to_json()
        .unwrap()
}

/// Reader and coin flip with checkpointing enabled
fn reader_graph() -> String {
    let config = PipelineConfig {
        max_batch_size: 4,
        num_threads: 1,
        device_id: -1,
        enable_checkpointing: true,
        seed: 11,
        ..PipelineConfig::default()
    };
    GraphDef::new(config)
        .operator(
            OperatorDef::new("reader", SYNTHETIC_READER, Backend::Cpu)
                .arg("num_samples", 10)
                .arg("sample_bytes", 3)
                .arg("random_shuffle", true)
                .output(OutputDef::typed("data", DataType::UInt8, 1))
                .output(OutputDef::typed("label", DataType::Int32, 1)),
        )
        .operator(OperatorDef::new("flip", COIN_FLIP, Backend::Cpu).output(OutputDef::new("flips")))
        .pipeline_output("data")
        .pipeline_output("label")
        .pipeline_output("flips")
        .to_json()
        .unwrap()
}

fn create(json: &str, batch: c_int, flags: c_uint, depth: c_int, memory_stats: c_int) -> *mut BfPipeline {
    assert_eq!(bf_initialize(), BF_OK);
    let mut handle = ptr::null_mut();
    let status = unsafe {
        bf_create_pipeline(
            &mut handle,
            json.as_ptr().cast(),
            json.len() as c_int,
            batch,
            2,
            -1,
            flags,
            depth,
            0,
            0,
            memory_stats,
        )
    };
    assert_eq!(status, BF_OK, "{}", if status == BF_OK { String::new() } else { last_error() });
    handle
}

fn deserialize(json: &str) -> *mut BfPipeline {
    assert_eq!(bf_initialize(), BF_OK);
    let mut handle = ptr::null_mut();
    let status = unsafe { bf_deserialize_default(&mut handle, json.as_ptr().cast(), json.len() as c_int) };
    assert_eq!(status, BF_OK);
    handle
}

fn feed(h: *mut BfPipeline, n: usize, fill: u8) -> c_int {
    let data = vec![fill; n * SAMPLE_BYTES];
    let shapes: Vec<i64> = SAMPLE.repeat(n);
    let (name, layout) = (c("src"), c("HWC"));
    unsafe {
        bf_set_external_input(
            h,
            name.as_ptr(),
            BF_DEVICE_CPU,
            data.as_ptr().cast(),
            DataType::UInt8.code(),
            shapes.as_ptr(),
            3,
            layout.as_ptr(),
            BF_EXT_DEFAULT,
        )
    }
}

fn out_usize(f: unsafe extern "C" fn(*mut BfPipeline, c_int, *mut usize) -> c_int, h: *mut BfPipeline, i: c_int) -> usize {
    let mut value = 0;
    assert_eq!(unsafe { f(h, i, &mut value) }, BF_OK);
    value
}

fn copy_output(h: *mut BfPipeline, i: c_int) -> Vec<u8> {
    let mut dst = vec![0u8; out_usize(bf_tensor_size, h, i)];
    let status = unsafe { bf_output_copy(h, dst.as_mut_ptr().cast(), i, BF_DEVICE_CPU, 0) };
    assert_eq!(status, BF_OK);
    dst
}

#[test]
fn test_prefetch_output_and_introspection() {
    let json = image_graph();
    let h = create(&json, 8, BF_EXEC_ASYNC_PIPELINED, 2, 0);
    let src = c("src");

    let mut count = 0;
    assert_eq!(unsafe { bf_input_feed_count(h, src.as_ptr(), &mut count) }, BF_OK);
    assert_eq!(count, 2);
    assert_eq!(feed(h, 8, 1), BF_OK);
    assert_eq!(feed(h, 8, 5), BF_OK);
    assert_eq!(unsafe { bf_prefetch(h) }, BF_OK);
    assert_eq!(unsafe { bf_input_feed_count(h, src.as_ptr(), &mut count) }, BF_OK);
    assert_eq!(count, 1);

    assert_eq!(unsafe { bf_output(h) }, BF_OK);
    let mut num_outputs = 0;
    assert_eq!(unsafe { bf_get_num_output(h, &mut num_outputs) }, BF_OK);
    assert_eq!(num_outputs, 1);

    let mut name: *const c_char = ptr::null();
    assert_eq!(unsafe { bf_get_output_name(h, 0, &mut name) }, BF_OK);
    assert_eq!(unsafe { CStr::from_ptr(name) }.to_str().unwrap(), "scaled");

    let mut uniform = 0;
    assert_eq!(unsafe { bf_output_has_uniform_shape(h, 0, &mut uniform) }, BF_OK);
    assert_eq!(uniform, 1);

    let (mut shape, mut ndim) = (ptr::null_mut(), 0);
    assert_eq!(unsafe { bf_shape_at(h, 0, &mut shape, &mut ndim) }, BF_OK);
    assert_eq!(unsafe { std::slice::from_raw_parts(shape, ndim as usize) }, &[8, 2, 2, 3]);
    unsafe { bf_free(shape.cast()) };

    assert_eq!(unsafe { bf_shape_at_sample(h, 0, 7, &mut shape, &mut ndim) }, BF_OK);
    assert_eq!(unsafe { std::slice::from_raw_parts(shape, ndim as usize) }, &SAMPLE);
    unsafe { bf_free(shape.cast()) };

    let mut dtype = 0;
    assert_eq!(unsafe { bf_type_at(h, 0, &mut dtype) }, BF_OK);
    assert_eq!(dtype, DataType::Float32.code());
    assert_eq!(out_usize(bf_num_tensors, h, 0), 8);
    assert_eq!(out_usize(bf_num_elements, h, 0), 8 * SAMPLE_BYTES);
    assert_eq!(out_usize(bf_max_dim_tensors, h, 0), 3);

    let bytes = copy_output(h, 0);
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
        .collect();
    assert!(values.iter().all(|&v| v == 2.0));

    assert_eq!(unsafe { bf_output_release(h) }, BF_OK);
    assert_eq!(unsafe { bf_output_release(h) }, BF_ERROR_SEQUENCING);
    assert!(last_error().contains("no output is held"));

    assert_eq!(unsafe { bf_delete_pipeline(h) }, BF_OK);
}

#[test]
fn test_external_input_introspection() {
    let json = image_graph();
    let h = create(&json, 4, BF_EXEC_ASYNC_PIPELINED, 2, 0);

    let mut n = 0;
    assert_eq!(unsafe { bf_get_num_external_input(h, &mut n) }, BF_OK);
    assert_eq!(n, 1);

    let mut name: *const c_char = ptr::null();
    assert_eq!(unsafe { bf_get_external_input_name(h, 0, &mut name) }, BF_OK);
    assert_eq!(unsafe { CStr::from_ptr(name) }.to_str().unwrap(), "src");

    let mut layout: *const c_char = ptr::null();
    assert_eq!(unsafe { bf_get_external_input_layout(h, name, &mut layout) }, BF_OK);
    assert_eq!(unsafe { CStr::from_ptr(layout) }.to_str().unwrap(), "HWC");

    let (mut dtype, mut ndim) = (0, 0);
    assert_eq!(unsafe { bf_get_external_input_type(h, name, &mut dtype) }, BF_OK);
    assert_eq!(dtype, DataType::UInt8.code());
    assert_eq!(unsafe { bf_get_external_input_ndim(h, name, &mut ndim) }, BF_OK);
    assert_eq!(ndim, 3);

    let mut declared = 0;
    assert_eq!(unsafe { bf_get_declared_output_dtype(h, 0, &mut declared) }, BF_OK);
    assert_eq!(declared, DataType::Float32.code());
    assert_eq!(unsafe { bf_get_declared_output_ndim(h, 0, &mut declared) }, BF_OK);
    assert_eq!(declared, 3);

    let mut max_batch = 0;
    assert_eq!(unsafe { bf_get_max_batch_size(h, &mut max_batch) }, BF_OK);
    assert_eq!(max_batch, 4);

    let missing = c("missing");
    assert_eq!(
        unsafe { bf_get_external_input_ndim(h, missing.as_ptr(), &mut ndim) },
        BF_ERROR_CONFIGURATION
    );
    unsafe { bf_delete_pipeline(h) };
}

#[test]
fn test_feed_variants_and_data_id() {
    let json = image_graph();
    let h = create(&json, 4, BF_EXEC_PIPELINED, 1, 0);
    let (src, layout) = (c("src"), c("HWC"));

    // Smaller batch, scattered samples, tagged with a data id
    assert_eq!(unsafe { bf_set_external_input_batch_size(h, src.as_ptr(), 2) }, BF_OK);
    let id = c("batch-7");
    assert_eq!(unsafe { bf_set_external_input_data_id(h, src.as_ptr(), id.as_ptr()) }, BF_OK);
    let samples = [vec![3u8; SAMPLE_BYTES], vec![4u8; SAMPLE_BYTES]];
    let ptrs: Vec<*const c_void> = samples.iter().map(|s| s.as_ptr().cast()).collect();
    let shapes = SAMPLE.repeat(2);
    let status = unsafe {
        bf_set_external_input_tensors(
            h,
            src.as_ptr(),
            BF_DEVICE_CPU,
            ptrs.as_ptr(),
            DataType::UInt8.code(),
            shapes.as_ptr(),
            3,
            layout.as_ptr(),
            BF_EXT_FORCE_COPY,
        )
    };
    assert_eq!(status, BF_OK);
    assert_eq!(unsafe { bf_run(h) }, BF_OK);
    assert_eq!(unsafe { bf_output(h) }, BF_OK);
    assert_eq!(out_usize(bf_num_tensors, h, 0), 2);

    let (op, key) = (c("src"), c(NEXT_OUTPUT_DATA_ID));
    let mut present = 0;
    assert_eq!(unsafe { bf_has_operator_trace(h, op.as_ptr(), key.as_ptr(), &mut present) }, BF_OK);
    assert_eq!(present, 1);
    let mut value: *const c_char = ptr::null();
    assert_eq!(unsafe { bf_get_operator_trace(h, op.as_ptr(), key.as_ptr(), &mut value) }, BF_OK);
    assert_eq!(unsafe { CStr::from_ptr(value) }.to_str().unwrap(), "batch-7");

    // Per-sample copy; a null destination skips the sample
    let mut second = vec![0u8; SAMPLE_BYTES * 4];
    let mut dsts: Vec<*mut c_void> = vec![ptr::null_mut(), second.as_mut_ptr().cast()];
    assert_eq!(unsafe { bf_output_copy_samples(h, dsts.as_mut_ptr(), 0, BF_DEVICE_CPU, 0) }, BF_OK);
    assert!(second.chunks_exact(4).all(|b| f32::from_le_bytes(b.try_into().unwrap()) == 8.0));

    // Asynchronous contiguous feed
    let data = vec![1u8; 4 * SAMPLE_BYTES];
    let shapes = SAMPLE.repeat(4);
    let mut event = ptr::null_mut();
    let status = unsafe {
        bf_set_external_input_async(
            h,
            src.as_ptr(),
            BF_DEVICE_CPU,
            data.as_ptr().cast(),
            DataType::UInt8.code(),
            shapes.as_ptr(),
            3,
            ptr::null(),
            BF_EXT_FORCE_SYNC,
            &mut event,
        )
    };
    assert_eq!(status, BF_OK);
    unsafe {
        bf_event_wait(event);
        assert_eq!(bf_event_query(event), 1);
        bf_event_destroy(event);
    }
    assert_eq!(unsafe { bf_run(h) }, BF_OK);
    assert_eq!(unsafe { bf_output(h) }, BF_OK);
    assert_eq!(out_usize(bf_num_tensors, h, 0), 4);
    unsafe { bf_delete_pipeline(h) };
}

#[test]
fn test_errors_become_status_codes() {
    assert_eq!(bf_initialize(), BF_OK);
    let garbage = "{ not a graph";
    assert_eq!(unsafe { bf_is_deserializable(garbage.as_ptr().cast(), garbage.len() as c_int) }, 0);
    let json = image_graph();
    assert_eq!(unsafe { bf_is_deserializable(json.as_ptr().cast(), json.len() as c_int) }, 1);

    let mut handle = ptr::null_mut();
    let status = unsafe {
        bf_create_pipeline(&mut handle, garbage.as_ptr().cast(), garbage.len() as c_int, 4, 1, -1, BF_EXEC_ASYNC_PIPELINED, 2, 0, 0, 0)
    };
    assert_eq!(status, BF_ERROR_CONFIGURATION);
    assert!(handle.is_null());

    // Asynchronous execution without pipelining is not a valid executor
    let status = unsafe {
        bf_create_pipeline(&mut handle, json.as_ptr().cast(), json.len() as c_int, 4, 1, -1, BF_EXEC_ASYNC, 2, 0, 0, 0)
    };
    assert_eq!(status, BF_ERROR_CONFIGURATION);

    assert_eq!(unsafe { bf_run(ptr::null_mut()) }, BF_ERROR_CONFIGURATION);
    assert!(last_error().contains("null"));

    let h = create(&json, 4, BF_EXEC_ASYNC_PIPELINED, 2, 0);
    assert_eq!(unsafe { bf_output(h) }, BF_ERROR_SEQUENCING);
    assert_eq!(unsafe { bf_prefetch(h) }, BF_ERROR_CONFIGURATION);
    assert!(last_error().contains("src"));
    assert_eq!(unsafe { bf_prefetch_uniform(h, 3) }, BF_ERROR_CONFIGURATION);

    // Float data fed to a uint8 input
    let data = vec![0f32; 4 * 12];
    let shapes = SAMPLE.repeat(4);
    let src = c("src");
    let status = unsafe {
        bf_set_external_input(
            h,
            src.as_ptr(),
            BF_DEVICE_CPU,
            data.as_ptr().cast(),
            DataType::Float32.code(),
            shapes.as_ptr(),
            3,
            ptr::null(),
            BF_EXT_DEFAULT,
        )
    };
    assert_eq!(status, BF_ERROR_CONFIGURATION);

    let conflicting = BF_EXT_FORCE_COPY | BF_EXT_FORCE_NO_COPY;
    let status = unsafe {
        bf_set_external_input(h, src.as_ptr(), BF_DEVICE_CPU, data.as_ptr().cast(), DataType::UInt8.code(), shapes.as_ptr(), 3, ptr::null(), conflicting)
    };
    assert_eq!(status, BF_ERROR_CONFIGURATION);
    unsafe { bf_delete_pipeline(h) };
    assert_eq!(unsafe { bf_delete_pipeline(ptr::null_mut()) }, BF_OK);
}

#[test]
fn test_reader_metadata_traces_and_backend() {
    let h = deserialize(&reader_graph());
    let reader = c("reader");

    let mut meta = BfReaderMetadata::default();
    assert_eq!(unsafe { bf_get_reader_metadata(h, reader.as_ptr(), &mut meta) }, BF_OK);
    assert_eq!(meta.epoch_size, 10);
    assert_eq!(meta.number_of_shards, 1);
    assert_eq!(meta.pad_last_batch, 0);

    let flip = c("flip");
    assert_eq!(unsafe { bf_get_reader_metadata(h, flip.as_ptr(), &mut meta) }, BF_ERROR_CONFIGURATION);

    let mut backend = -1;
    assert_eq!(unsafe { bf_get_operator_backend(h, flip.as_ptr(), &mut backend) }, BF_OK);
    assert_eq!(backend, Backend::Cpu.code());

    let epoch = c("epoch");
    let mut value: *const c_char = ptr::null();
    assert_eq!(
        unsafe { bf_get_operator_trace(h, reader.as_ptr(), epoch.as_ptr(), &mut value) },
        BF_ERROR_SEQUENCING
    );
    assert_eq!(unsafe { bf_run(h) }, BF_OK);
    assert_eq!(unsafe { bf_output(h) }, BF_OK);
    assert_eq!(unsafe { bf_get_operator_trace(h, reader.as_ptr(), epoch.as_ptr(), &mut value) }, BF_OK);
    assert_eq!(unsafe { CStr::from_ptr(value) }.to_str().unwrap(), "0");
    unsafe { bf_delete_pipeline(h) };
}

#[test]
fn test_executor_metadata_round_trip() {
    let json = image_graph();
    let h = create(&json, 4, BF_EXEC_ASYNC_PIPELINED, 2, 1);
    assert_eq!(feed(h, 4, 9), BF_OK);
    assert_eq!(unsafe { bf_run(h) }, BF_OK);
    assert_eq!(unsafe { bf_output(h) }, BF_OK);

    let (mut meta, mut n) = (ptr::null_mut(), 0usize);
    assert_eq!(unsafe { bf_get_executor_metadata(h, &mut meta, &mut n) }, BF_OK);
    assert!(n > 0);
    let entries = unsafe { std::slice::from_raw_parts(meta, n) };
    let scale = entries
        .iter()
        .find(|e| unsafe { CStr::from_ptr(e.operator_name) }.to_str().unwrap() == "scale")
        .expect("scale has statistics");
    assert_eq!(scale.out_num, 1);
    assert_eq!(unsafe { *scale.real_size }, 4 * SAMPLE_BYTES * 4);
    assert_eq!(unsafe { *scale.max_real_size }, SAMPLE_BYTES * 4);
    unsafe { bf_free_executor_metadata(meta, n) };
    unsafe { bf_delete_pipeline(h) };
}

#[test]
fn test_checkpoint_round_trip_through_the_boundary() {
    let json = reader_graph();
    let original = deserialize(&json);
    for _ in 0..3 {
        assert_eq!(unsafe { bf_run(original) }, BF_OK);
        assert_eq!(unsafe { bf_output(original) }, BF_OK);
    }

    let mut step = b"step=3".to_vec();
    let context = BfExternalContextCheckpoint {
        pipeline_data: BfExternalContextField {
            data: step.as_mut_ptr().cast(),
            size: step.len(),
        },
        iterator_data: BfExternalContextField {
            data: ptr::null_mut(),
            size: 0,
        },
    };
    let (mut blob, mut size) = (ptr::null_mut(), 0usize);
    assert_eq!(unsafe { bf_get_serialized_checkpoint(original, &context, &mut blob, &mut size) }, BF_OK);
    assert!(size > 0);

    let restored = deserialize(&json);
    let mut restored_context = BfExternalContextCheckpoint {
        pipeline_data: BfExternalContextField {
            data: ptr::null_mut(),
            size: 0,
        },
        iterator_data: BfExternalContextField {
            data: ptr::null_mut(),
            size: 0,
        },
    };
    assert_eq!(
        unsafe { bf_restore_from_serialized_checkpoint(restored, blob, size, &mut restored_context) },
        BF_OK
    );
    let restored_step = unsafe {
        std::slice::from_raw_parts(restored_context.pipeline_data.data.cast::<u8>(), restored_context.pipeline_data.size)
    };
    assert_eq!(restored_step, b"step=3");
    assert!(restored_context.iterator_data.data.is_null());
    unsafe {
        bf_destroy_external_context_checkpoint(&mut restored_context);
        bf_free(blob.cast());
    }
    assert_eq!(restored_context.pipeline_data.size, 0);

    for _ in 0..4 {
        for h in [original, restored] {
            assert_eq!(unsafe { bf_run(h) }, BF_OK);
            assert_eq!(unsafe { bf_output(h) }, BF_OK);
        }
        for i in 0..3 {
            assert_eq!(copy_output(original, i), copy_output(restored, i));
        }
    }

    // Restoring after the pipeline started is a sequencing error
    let (mut blob, mut size) = (ptr::null_mut(), 0usize);
    assert_eq!(unsafe { bf_get_serialized_checkpoint(original, ptr::null(), &mut blob, &mut size) }, BF_OK);
    assert_eq!(
        unsafe { bf_restore_from_serialized_checkpoint(restored, blob, size, ptr::null_mut()) },
        BF_ERROR_SEQUENCING
    );
    unsafe {
        bf_free(blob.cast());
        bf_delete_pipeline(original);
        bf_delete_pipeline(restored);
    }
}

#[test]
fn test_memory_control() {
    assert_eq!(bf_preallocate_pinned_memory(1 << 20), BF_OK);
    assert_eq!(bf_preallocate_device_memory(1 << 20, 0), BF_OK);
    assert_eq!(bf_release_unused_memory(), BF_OK);
    assert_ne!(bf_preallocate_device_memory(1 << 20, 4096), BF_OK);
    assert!(!bf_get_last_error().is_null());
}
