//! C-callable boundary of the batchflow pipeline engine
//!
//! Every fallible entry point returns [`BF_OK`] on success or the code of
//! the failure's [`ErrorKind`](batchflow_core::ErrorKind), with the message
//! available from [`bf_get_last_error`] on the same thread. Panics never
//! cross the boundary.
//!
//! Call [`bf_initialize`] once before creating pipelines. A handle is not
//! re-entrant: it must not be used from two threads at once.
//!
//! Memory handed to the caller (shape arrays, checkpoint blobs, metadata)
//! is allocated with [`bf_alloc`] and released with [`bf_free`] or the
//! dedicated destroy function named in each call's documentation.

#![warn(missing_docs)]

mod alloc;
mod checkpoint;
mod feed;
mod handle;
mod memory;
mod output;
mod status;
mod types;

pub use alloc::{bf_alloc, bf_free};
pub use checkpoint::{
    bf_destroy_external_context_checkpoint, bf_get_serialized_checkpoint,
    bf_restore_from_serialized_checkpoint,
};
pub use feed::{
    bf_event_destroy, bf_event_query, bf_event_wait, bf_get_external_input_layout,
    bf_get_external_input_name, bf_get_external_input_ndim, bf_get_external_input_type,
    bf_get_num_external_input, bf_input_feed_count, bf_set_external_input,
    bf_set_external_input_async, bf_set_external_input_batch_size, bf_set_external_input_data_id,
    bf_set_external_input_tensors, bf_set_external_input_tensors_async, BfEvent,
};
pub use handle::{
    bf_create_pipeline, bf_delete_pipeline, bf_deserialize_default, bf_get_max_batch_size,
    bf_initialize, bf_is_deserializable, bf_output, bf_output_release, bf_prefetch,
    bf_prefetch_separate, bf_prefetch_uniform, bf_run, bf_share_output, BfPipeline,
};
pub use memory::{bf_preallocate_device_memory, bf_preallocate_pinned_memory, bf_release_unused_memory};
pub use output::{
    bf_copy_tensor_list_n_to, bf_free_executor_metadata, bf_get_declared_output_dtype,
    bf_get_declared_output_ndim, bf_get_executor_metadata, bf_get_num_output,
    bf_get_operator_backend, bf_get_operator_trace, bf_get_output_device, bf_get_output_name,
    bf_get_reader_metadata, bf_has_operator_trace, bf_max_dim_tensors, bf_num_elements,
    bf_num_tensors, bf_output_copy, bf_output_copy_samples, bf_output_has_uniform_shape,
    bf_shape_at, bf_shape_at_sample, bf_tensor_size, bf_type_at, BF_NO_TYPE,
};
pub use status::{
    bf_get_last_error, BF_ERROR_CONFIGURATION, BF_ERROR_INTERNAL, BF_ERROR_OPERATOR,
    BF_ERROR_RESOURCE, BF_ERROR_SEQUENCING, BF_OK,
};
pub use types::{
    BfExecutorMetadata, BfExternalContextCheckpoint, BfExternalContextField, BfReaderMetadata,
    BF_DEVICE_CPU, BF_DEVICE_GPU, BF_EXEC_ASYNC, BF_EXEC_ASYNC_PIPELINED, BF_EXEC_PIPELINED,
    BF_EXEC_SEPARATED, BF_EXEC_SIMPLE, BF_EXT_DEFAULT, BF_EXT_FORCE_COPY, BF_EXT_FORCE_NO_COPY,
    BF_EXT_FORCE_SYNC, BF_EXT_PINNED, BF_USE_COPY_KERNEL,
};
