//! Flag sets and plain-data structs shared with C callers

use std::ffi::c_char;
use std::os::raw::{c_int, c_uint};

use batchflow_core::{
    Error, ExecutorConfig, FeedOptions, MemoryKind, OperatorMemoryStats, QueueDepth, ReaderMeta,
    Result, StorageDevice,
};

use crate::alloc::{alloc_c_string, alloc_slice, bf_free};

/// Overlap stages of consecutive iterations
pub const BF_EXEC_PIPELINED: c_uint = 1;

/// Return from `bf_run` before stage work finishes; requires pipelining
pub const BF_EXEC_ASYNC: c_uint = 1 << 1;

/// Use independent CPU and GPU queue depths
pub const BF_EXEC_SEPARATED: c_uint = 1 << 2;

/// Synchronous, non-pipelined execution
pub const BF_EXEC_SIMPLE: c_uint = 0;

/// Default executor
pub const BF_EXEC_ASYNC_PIPELINED: c_uint = BF_EXEC_PIPELINED | BF_EXEC_ASYNC;

/// No feed flags
pub const BF_EXT_DEFAULT: c_uint = 0;

/// Wait for the feed copy before returning
pub const BF_EXT_FORCE_SYNC: c_uint = 1;

/// Stage host copies in pinned memory
pub const BF_EXT_PINNED: c_uint = 1 << 1;

/// Gather scattered samples with a copy kernel
pub const BF_USE_COPY_KERNEL: c_uint = 1 << 2;

/// Copy even when the input was declared no-copy
pub const BF_EXT_FORCE_COPY: c_uint = 1 << 3;

/// Adopt caller memory even when the input was declared copying
pub const BF_EXT_FORCE_NO_COPY: c_uint = 1 << 4;

/// Host memory tag
pub const BF_DEVICE_CPU: c_int = 0;

/// Device memory tag
pub const BF_DEVICE_GPU: c_int = 1;

const EXEC_KNOWN: c_uint = BF_EXEC_PIPELINED | BF_EXEC_ASYNC | BF_EXEC_SEPARATED;
const EXT_KNOWN: c_uint =
    BF_EXT_FORCE_SYNC | BF_EXT_PINNED | BF_USE_COPY_KERNEL | BF_EXT_FORCE_COPY | BF_EXT_FORCE_NO_COPY;

/// Typed executor configuration from an exec flag set and queue depths.
/// Only the depths selected by `BF_EXEC_SEPARATED` are read.
pub(crate) fn executor_config(
    flags: c_uint,
    prefetch_queue_depth: c_int,
    cpu_queue_depth: c_int,
    gpu_queue_depth: c_int,
) -> Result<ExecutorConfig> {
    if flags & !EXEC_KNOWN != 0 {
        return Err(Error::InvalidArgument(format!("unknown executor flags {flags:#x}")));
    }
    let depth = |value: c_int, what: &str| {
        usize::try_from(value)
            .map_err(|_| Error::InvalidConfig(format!("{what} must not be negative, got {value}")))
    };
    let queue = if flags & BF_EXEC_SEPARATED != 0 {
        QueueDepth::Separated {
            cpu: depth(cpu_queue_depth, "CPU queue depth")?,
            gpu: depth(gpu_queue_depth, "GPU queue depth")?,
        }
    } else {
        QueueDepth::Uniform(depth(prefetch_queue_depth, "prefetch queue depth")?)
    };
    let config = ExecutorConfig {
        pipelined: flags & BF_EXEC_PIPELINED != 0,
        async_execution: flags & BF_EXEC_ASYNC != 0,
        queue,
    };
    config.validate()?;
    Ok(config)
}

/// Typed feed options from an `BF_EXT_*` flag set
pub(crate) fn feed_options(flags: c_uint) -> Result<FeedOptions> {
    if flags & !EXT_KNOWN != 0 {
        return Err(Error::InvalidArgument(format!("unknown feed flags {flags:#x}")));
    }
    if flags & BF_EXT_FORCE_COPY != 0 && flags & BF_EXT_FORCE_NO_COPY != 0 {
        return Err(Error::InvalidArgument(
            "force-copy and force-no-copy are mutually exclusive".into(),
        ));
    }
    let mut options = FeedOptions::default();
    if flags & BF_EXT_FORCE_SYNC != 0 {
        options = options.sync();
    }
    if flags & BF_EXT_PINNED != 0 {
        options = options.pinned();
    }
    if flags & BF_USE_COPY_KERNEL != 0 {
        options = options.use_copy_kernel();
    }
    if flags & BF_EXT_FORCE_COPY != 0 {
        options = options.force_copy();
    }
    if flags & BF_EXT_FORCE_NO_COPY != 0 {
        options = options.force_no_copy();
    }
    Ok(options)
}

/// Storage device from its tag
pub(crate) fn storage_device(tag: c_int) -> Result<StorageDevice> {
    StorageDevice::from_code(tag)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown device tag {tag}")))
}

/// Memory kind of caller data tagged `device` for a pipeline on `device_id`
pub(crate) fn source_memory(device: StorageDevice, device_id: i32) -> MemoryKind {
    match device {
        StorageDevice::Cpu => MemoryKind::Host,
        StorageDevice::Gpu => MemoryKind::Device(device_id.max(0)),
    }
}

/// Reader progress description
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BfReaderMetadata {
    /// Samples in one epoch
    pub epoch_size: i64,
    /// Epoch size including padding
    pub epoch_size_padded: i64,
    /// Number of shards
    pub number_of_shards: c_int,
    /// Shard read by this reader
    pub shard_id: c_int,
    /// Non-zero if the last batch is padded
    pub pad_last_batch: c_int,
    /// Non-zero if the reader keeps to its shard
    pub stick_to_shard: c_int,
}

impl From<ReaderMeta> for BfReaderMetadata {
    fn from(meta: ReaderMeta) -> Self {
        Self {
            epoch_size: meta.epoch_size,
            epoch_size_padded: meta.epoch_size_padded,
            number_of_shards: meta.number_of_shards,
            shard_id: meta.shard_id,
            pad_last_batch: c_int::from(meta.pad_last_batch),
            stick_to_shard: c_int::from(meta.stick_to_shard),
        }
    }
}

/// Output sizes of one operator. Every pointer field is caller-owned;
/// release the whole array with `bf_free_executor_metadata`.
#[repr(C)]
#[derive(Debug)]
pub struct BfExecutorMetadata {
    /// Operator name
    pub operator_name: *mut c_char,
    /// Number of outputs, the length of each array below
    pub out_num: usize,
    /// Largest total payload per output
    pub real_size: *mut usize,
    /// Largest sample payload per output
    pub max_real_size: *mut usize,
    /// Largest total reservation per output
    pub reserved: *mut usize,
    /// Largest per-sample reservation per output
    pub max_reserved: *mut usize,
}

impl BfExecutorMetadata {
    pub(crate) fn from_stats(stats: &OperatorMemoryStats) -> Result<Self> {
        let column = |f: fn(&batchflow_core::OutputMemoryStats) -> usize| {
            alloc_slice(&stats.outputs.iter().map(f).collect::<Vec<_>>())
        };
        Ok(Self {
            operator_name: alloc_c_string(&stats.operator)?,
            out_num: stats.outputs.len(),
            real_size: column(|o| o.real_size)?,
            max_real_size: column(|o| o.max_real_size)?,
            reserved: column(|o| o.reserved)?,
            max_reserved: column(|o| o.max_reserved)?,
        })
    }

    /// Free every field.
    ///
    /// # Safety
    ///
    /// Fields must be null or come from [`BfExecutorMetadata::from_stats`].
    pub(crate) unsafe fn free_fields(&mut self) {
        unsafe {
            bf_free(self.operator_name.cast());
            bf_free(self.real_size.cast());
            bf_free(self.max_real_size.cast());
            bf_free(self.reserved.cast());
            bf_free(self.max_reserved.cast());
        }
        self.operator_name = std::ptr::null_mut();
        self.real_size = std::ptr::null_mut();
        self.max_real_size = std::ptr::null_mut();
        self.reserved = std::ptr::null_mut();
        self.max_reserved = std::ptr::null_mut();
    }
}

/// Caller-owned byte blob
#[repr(C)]
#[derive(Debug)]
pub struct BfExternalContextField {
    /// Bytes, allocated with `bf_alloc`; null when empty
    pub data: *mut c_char,
    /// Length in bytes
    pub size: usize,
}

impl BfExternalContextField {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self {
                data: std::ptr::null_mut(),
                size: 0,
            });
        }
        Ok(Self {
            data: alloc_slice(bytes)?.cast(),
            size: bytes.len(),
        })
    }
}

/// Caller data stored in a checkpoint
#[repr(C)]
#[derive(Debug)]
pub struct BfExternalContextCheckpoint {
    /// Data of the code driving the pipeline
    pub pipeline_data: BfExternalContextField,
    /// Data of the iterator wrapping the pipeline
    pub iterator_data: BfExternalContextField,
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::CopyMode;
    use test_case::test_case;

    #[test_case(BF_EXEC_ASYNC_PIPELINED, true, true; "async pipelined")]
    #[test_case(BF_EXEC_PIPELINED, true, false; "pipelined")]
    #[test_case(BF_EXEC_SIMPLE, false, false; "simple")]
    fn test_exec_flags(flags: c_uint, pipelined: bool, async_execution: bool) {
        let config = executor_config(flags, 3, 0, 0).unwrap();
        assert_eq!(config.pipelined, pipelined);
        assert_eq!(config.async_execution, async_execution);
        assert_eq!(config.queue, QueueDepth::Uniform(3));
    }

    #[test]
    fn test_separated_reads_stage_depths() {
        let config = executor_config(BF_EXEC_ASYNC_PIPELINED | BF_EXEC_SEPARATED, -1, 3, 2).unwrap();
        assert_eq!(config.queue, QueueDepth::Separated { cpu: 3, gpu: 2 });
    }

    #[test]
    fn test_invalid_exec_flags() {
        assert!(executor_config(BF_EXEC_ASYNC, 2, 0, 0).is_err());
        assert!(executor_config(1 << 7, 2, 0, 0).is_err());
        assert!(executor_config(BF_EXEC_PIPELINED, -2, 0, 0).is_err());
    }

    #[test]
    fn test_feed_flags() {
        let options = feed_options(BF_EXT_FORCE_SYNC | BF_EXT_FORCE_NO_COPY).unwrap();
        assert!(options.force_sync);
        assert!(!options.pinned);
        assert_eq!(options.copy, CopyMode::ForceNoCopy);
        assert_eq!(feed_options(BF_EXT_DEFAULT).unwrap(), FeedOptions::default());
        assert!(feed_options(BF_EXT_FORCE_COPY | BF_EXT_FORCE_NO_COPY).is_err());
    }

    #[test]
    fn test_reader_metadata_conversion() {
        let meta = BfReaderMetadata::from(ReaderMeta {
            epoch_size: 10,
            epoch_size_padded: 12,
            number_of_shards: 2,
            shard_id: 1,
            pad_last_batch: true,
            stick_to_shard: false,
        });
        assert_eq!(meta.pad_last_batch, 1);
        assert_eq!(meta.stick_to_shard, 0);
        assert_eq!(meta.epoch_size_padded, 12);
    }
}
