//! Core of the batchflow data-preprocessing engine
//!
//! A pipeline is a graph of operators split into a CPU stage and a GPU
//! stage. Batches enter through external feed slots, move through bounded
//! stage queues and leave as [`TensorList`]s held until released. Buffers
//! come from process-wide memory pools; device memory and streams are
//! emulated on the host, preserving their asynchronous completion contract.
//!
//! Call [`init`] once before building any pipeline.

#![warn(missing_docs)]

pub mod buffer;
pub mod builtin;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod feed;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod operator;
pub mod pipeline;
pub mod queue;
pub mod stream;
pub mod tensor;
pub mod types;

use once_cell::sync::OnceCell;
use static_assertions::assert_impl_all;
use tracing::{debug, error};

// Re-export key types for convenience
pub use buffer::Buffer;
pub use checkpoint::{Checkpoint, CheckpointManager, ExternalContext};
pub use config::{ConfigOverrides, ExecutorConfig, PipelineConfig, QueueDepth};
pub use error::{Error, ErrorKind, OperatorFailure, Result};
pub use executor::{IterationOutput, OperatorMemoryStats, OutputMemoryStats};
pub use feed::{CopyMode, ExternalBatch, FeedData, FeedOptions};
pub use graph::{is_deserializable, GraphDef, OperatorDef, OutputDef};
pub use memory::{
    preallocate_device_memory, preallocate_pinned_memory, release_unused_memory, MemoryPool,
    MemoryPoolStats,
};
pub use operator::{Operator, OperatorSchema, OperatorSpec, ReaderMeta, Workspace};
pub use pipeline::Pipeline;
pub use queue::QueueStats;
pub use stream::Event;
pub use tensor::TensorList;
pub use types::{Backend, DataType, MemoryKind, StorageDevice, TensorLayout};

assert_impl_all!(Buffer: Send, Sync, Clone);
assert_impl_all!(TensorList: Send, Sync, Clone);
assert_impl_all!(Event: Send, Sync, Clone);
assert_impl_all!(Pipeline: Send);

static INITIALIZED: OnceCell<bool> = OnceCell::new();

/// Register the core operators. Safe to call any number of times.
pub fn init() {
    INITIALIZED.get_or_init(|| match builtin::register_builtins() {
        Ok(()) => {
            debug!("batchflow initialized");
            true
        }
        Err(e) => {
            error!(error = %e, "failed to register core operators");
            false
        }
    });
}

/// Whether [`init`] ran successfully
pub fn is_initialized() -> bool {
    INITIALIZED.get().copied().unwrap_or(false)
}
