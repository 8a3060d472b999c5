//! Pipeline and executor configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted queue depth per stage
pub const MAX_QUEUE_DEPTH: usize = 64;

/// Largest accepted worker thread count
pub const MAX_THREADS: usize = 1024;

/// Depth of the stage queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDepth {
    /// One depth bounds the iterations in flight across all stages
    Uniform(usize),

    /// Independent bounds for the CPU stage and the GPU stage
    Separated {
        /// Iterations the CPU stage may run ahead of the GPU stage
        cpu: usize,
        /// Iterations the GPU stage may hold until released
        gpu: usize,
    },
}

impl Default for QueueDepth {
    fn default() -> Self {
        QueueDepth::Uniform(2)
    }
}

impl QueueDepth {
    /// Iterations scheduled by `prefetch`, and feeds required per slot before it
    pub fn prefetch_depth(self) -> usize {
        match self {
            QueueDepth::Uniform(depth) => depth,
            QueueDepth::Separated { cpu, gpu } => cpu + gpu,
        }
    }

    /// Output sets that may be held at once
    pub fn output_depth(self) -> usize {
        match self {
            QueueDepth::Uniform(depth) => depth,
            QueueDepth::Separated { gpu, .. } => gpu,
        }
    }

    /// Whether the stages use separate queues
    pub fn is_separated(self) -> bool {
        matches!(self, QueueDepth::Separated { .. })
    }

    fn validate(self) -> Result<()> {
        let check = |name: &str, depth: usize| {
            if depth == 0 || depth > MAX_QUEUE_DEPTH {
                Err(Error::InvalidConfig(format!(
                    "{name} queue depth must be within 1..={MAX_QUEUE_DEPTH}, got {depth}"
                )))
            } else {
                Ok(())
            }
        };
        match self {
            QueueDepth::Uniform(depth) => check("prefetch", depth),
            QueueDepth::Separated { cpu, gpu } => {
                check("cpu", cpu)?;
                check("gpu", gpu)
            }
        }
    }
}

/// How iterations move through the stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Overlap stages of consecutive iterations
    pub pipelined: bool,

    /// Run stages on worker threads so `run` returns before they finish
    #[serde(rename = "async")]
    pub async_execution: bool,

    /// Stage queue depths
    pub queue: QueueDepth,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pipelined: true,
            async_execution: true,
            queue: QueueDepth::default(),
        }
    }
}

impl ExecutorConfig {
    /// Validate the combination of options
    pub fn validate(&self) -> Result<()> {
        if self.async_execution && !self.pipelined {
            return Err(Error::InvalidConfig(
                "asynchronous execution requires pipelined execution".into(),
            ));
        }
        self.queue.validate()
    }
}

/// Configuration of one pipeline instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest number of samples per iteration
    pub max_batch_size: usize,

    /// CPU worker threads for per-sample parallelism
    pub num_threads: usize,

    /// Device ordinal; negative for a CPU-only pipeline
    pub device_id: i32,

    /// Executor behaviour
    pub executor: ExecutorConfig,

    /// Record per-iteration operator state so checkpoints can be taken
    pub enable_checkpointing: bool,

    /// Track per-operator output sizes for executor metadata
    pub enable_memory_stats: bool,

    /// Base seed handed to operators
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            num_threads: num_cpus::get(),
            device_id: 0,
            executor: ExecutorConfig::default(),
            enable_checkpointing: false,
            enable_memory_stats: false,
            seed: 0,
        }
    }
}

impl PipelineConfig {
    /// Validate every field
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("max batch size must be positive".into()));
        }
        if self.num_threads == 0 || self.num_threads > MAX_THREADS {
            return Err(Error::InvalidConfig(format!(
                "thread count must be within 1..={MAX_THREADS}, got {}",
                self.num_threads
            )));
        }
        self.executor.validate()
    }

    /// Apply per-call overrides on top of this configuration
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(max_batch_size) = overrides.max_batch_size {
            self.max_batch_size = max_batch_size;
        }
        if let Some(num_threads) = overrides.num_threads {
            self.num_threads = num_threads;
        }
        if let Some(device_id) = overrides.device_id {
            self.device_id = device_id;
        }
        if let Some(executor) = overrides.executor {
            self.executor = executor;
        }
        if let Some(enable) = overrides.enable_checkpointing {
            self.enable_checkpointing = enable;
        }
        if let Some(enable) = overrides.enable_memory_stats {
            self.enable_memory_stats = enable;
        }
        self
    }
}

/// Values replacing those stored in a serialized graph; `None` keeps them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Largest batch size
    pub max_batch_size: Option<usize>,

    /// Worker thread count
    pub num_threads: Option<usize>,

    /// Device ordinal
    pub device_id: Option<i32>,

    /// Executor behaviour
    pub executor: Option<ExecutorConfig>,

    /// Checkpointing toggle
    pub enable_checkpointing: Option<bool>,

    /// Memory statistics toggle
    pub enable_memory_stats: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(QueueDepth::Uniform(2), 2, 2)]
    #[test_case(QueueDepth::Separated { cpu: 3, gpu: 2 }, 5, 2)]
    fn test_depths(queue: QueueDepth, prefetch: usize, output: usize) {
        assert_eq!(queue.prefetch_depth(), prefetch);
        assert_eq!(queue.output_depth(), output);
    }

    #[test_case(QueueDepth::Uniform(0))]
    #[test_case(QueueDepth::Uniform(MAX_QUEUE_DEPTH + 1))]
    #[test_case(QueueDepth::Separated { cpu: 1, gpu: 0 })]
    fn test_invalid_depths(queue: QueueDepth) {
        let config = ExecutorConfig { queue, ..ExecutorConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_async_requires_pipelined() {
        let config = ExecutorConfig {
            pipelined: false,
            async_execution: true,
            queue: QueueDepth::Uniform(1),
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides_keep_unset_values() {
        let base = PipelineConfig { max_batch_size: 8, seed: 9, ..PipelineConfig::default() };
        let merged = base.clone().with_overrides(&ConfigOverrides {
            num_threads: Some(3),
            ..ConfigOverrides::default()
        });
        assert_eq!(merged.max_batch_size, 8);
        assert_eq!(merged.num_threads, 3);
        assert_eq!(merged.seed, 9);
    }

    #[test]
    fn test_serde_shape() {
        let json = r#"{"pipelined": true, "async": false, "queue": {"separated": {"cpu": 2, "gpu": 3}}}"#;
        let config: ExecutorConfig = serde_json::from_str(json).unwrap();
        assert!(!config.async_execution);
        assert_eq!(config.queue, QueueDepth::Separated { cpu: 2, gpu: 3 });
        let partial: PipelineConfig = serde_json::from_str(r#"{"max_batch_size": 4}"#).unwrap();
        assert_eq!(partial.max_batch_size, 4);
        assert!(partial.executor.pipelined);
    }
}
