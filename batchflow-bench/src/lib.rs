//! Throughput benchmarks for batchflow pipelines

use std::time::{Duration, Instant};

use batchflow_core::builtin::{EXTERNAL_SOURCE, MAKE_CONTIGUOUS};
use batchflow_core::memory::pools;
use batchflow_core::{
    Backend, Buffer, ConfigOverrides, DataType, Error, ExecutorConfig, ExternalBatch,
    FeedOptions, GraphDef, MemoryKind, OperatorDef, OutputDef, Pipeline, PipelineConfig,
    QueueDepth, Result,
};
use batchflow_ops::{AFFINE, SYNTHETIC_READER};
use serde::Serialize;
use tracing::info;

/// Executor arrangement under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecMode {
    /// One iteration at a time on the caller's thread
    Simple,

    /// Stages overlap, work parked until output is requested
    Pipelined,

    /// Stages overlap on worker threads
    AsyncPipelined,

    /// Independent CPU and GPU queue depths
    Separated {
        /// CPU stage depth
        cpu: usize,
        /// GPU stage depth
        gpu: usize,
    },
}

impl ExecMode {
    /// Executor configuration for this mode with a uniform `queue_depth`
    pub fn executor_config(self, queue_depth: usize) -> ExecutorConfig {
        match self {
            ExecMode::Simple => ExecutorConfig {
                pipelined: false,
                async_execution: false,
                queue: QueueDepth::Uniform(queue_depth),
            },
            ExecMode::Pipelined => ExecutorConfig {
                pipelined: true,
                async_execution: false,
                queue: QueueDepth::Uniform(queue_depth),
            },
            ExecMode::AsyncPipelined => ExecutorConfig {
                pipelined: true,
                async_execution: true,
                queue: QueueDepth::Uniform(queue_depth),
            },
            ExecMode::Separated { cpu, gpu } => ExecutorConfig {
                pipelined: true,
                async_execution: true,
                queue: QueueDepth::Separated { cpu, gpu },
            },
        }
    }
}

/// Benchmark configuration
#[derive(Debug, Clone, Serialize)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Samples per iteration
    pub batch_size: usize,

    /// Bytes per sample
    pub sample_bytes: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Whether to report pool usage
    pub track_memory: bool,

    /// CPU worker threads of the pipeline
    pub num_threads: usize,

    /// Uniform queue depth
    pub queue_depth: usize,

    /// Executor arrangement
    pub mode: ExecMode,

    /// Move samples to the device and transform them there
    pub use_device: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 50,
            batch_size: 32,
            sample_bytes: 4096,
            warmup_iterations: 5,
            track_memory: true,
            num_threads: 4,
            queue_depth: 2,
            mode: ExecMode::AsyncPipelined,
            use_device: false,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Peak bytes reserved by the pools touched
    pub memory_usage: Option<usize>,

    /// Throughput (samples/second)
    pub throughput: f64,
}

/// Time `func` over the configured iterations after a warmup
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
    if config.iterations == 0 {
        return Err(Error::InvalidArgument("benchmark needs at least one iteration".into()));
    }

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    let total_samples = config.iterations * config.batch_size;
    let throughput = total_samples as f64 / total_time.as_secs_f64().max(f64::EPSILON);

    let memory_usage = if config.track_memory {
        Some(peak_reserved(config.use_device)?)
    } else {
        None
    };

    info!(name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        memory_usage,
        throughput,
    })
}

fn peak_reserved(use_device: bool) -> Result<usize> {
    let mut peak = pools().pool(MemoryKind::Host)?.stats().peak_reserved_bytes;
    if use_device {
        peak += pools().pool(MemoryKind::Device(0))?.stats().peak_reserved_bytes;
    }
    Ok(peak)
}

fn pipeline_config(config: &BenchConfig) -> PipelineConfig {
    PipelineConfig {
        max_batch_size: config.batch_size,
        num_threads: config.num_threads,
        device_id: if config.use_device { 0 } else { -1 },
        executor: config.mode.executor_config(config.queue_depth),
        ..PipelineConfig::default()
    }
}

/// Append the scaling step, on the device when requested
fn with_transform(def: GraphDef, source: &str, use_device: bool) -> GraphDef {
    let (input, backend) = if use_device {
        ("uploaded", Backend::Gpu)
    } else {
        (source, Backend::Cpu)
    };
    let def = if use_device {
        def.operator(
            OperatorDef::new("upload", MAKE_CONTIGUOUS, Backend::Mixed)
                .input(source)
                .output(OutputDef::new("uploaded")),
        )
    } else {
        def
    };
    def.operator(
        OperatorDef::new("normalize", AFFINE, backend)
            .arg("scale", 1.0 / 255.0)
            .arg("shift", -0.5)
            .input(input)
            .output(OutputDef::typed("normalized", DataType::Float32, 1)),
    )
    .pipeline_output("normalized")
}

/// Reader followed by a normalizing transform
pub fn reader_graph(config: &BenchConfig) -> GraphDef {
    let def = GraphDef::new(pipeline_config(config)).operator(
        OperatorDef::new("reader", SYNTHETIC_READER, Backend::Cpu)
            .arg("num_samples", config.batch_size * 16)
            .arg("sample_bytes", config.sample_bytes)
            .arg("random_shuffle", true)
            .output(OutputDef::typed("data", DataType::UInt8, 1))
            .output(OutputDef::typed("label", DataType::Int32, 1)),
    );
    with_transform(def, "data", config.use_device)
}

/// Caller-fed input followed by a normalizing transform
pub fn external_graph(config: &BenchConfig) -> GraphDef {
    let def = GraphDef::new(pipeline_config(config)).operator(
        OperatorDef::new("src", EXTERNAL_SOURCE, Backend::Cpu)
            .output(OutputDef::typed("src", DataType::UInt8, 1)),
    );
    with_transform(def, "src", config.use_device)
}

fn build(def: &GraphDef) -> Result<Pipeline> {
    batchflow_ops::init()?;
    Pipeline::new(def, &ConfigOverrides::default())
}

/// Samples produced per second by a prefetched reader pipeline
pub fn bench_reader_pipeline(config: &BenchConfig) -> Result<BenchResult> {
    let mut pipe = build(&reader_graph(config))?;
    pipe.prefetch()?;
    let name = format!("reader {:?} batch={}", config.mode, config.batch_size);
    run_benchmark(&name, config, || {
        pipe.output()?;
        pipe.run()
    })
}

/// Samples produced per second when the caller feeds every batch
pub fn bench_external_feed(config: &BenchConfig, options: FeedOptions) -> Result<BenchResult> {
    let mut pipe = build(&external_graph(config))?;
    let payload = vec![0x7f_u8; config.batch_size * config.sample_bytes];
    let shapes = vec![vec![config.sample_bytes]; config.batch_size];
    let feed = |pipe: &mut Pipeline| -> Result<()> {
        let batch = ExternalBatch::contiguous(Buffer::from_vec(payload.clone()), &shapes, DataType::UInt8);
        pipe.feed_input("src", batch, options)
    };

    for _ in 0..pipe.input_feed_count("src")? {
        feed(&mut pipe)?;
    }
    pipe.prefetch()?;
    let name = format!("external {:?} copy={:?}", config.mode, options.copy);
    run_benchmark(&name, config, || {
        pipe.output()?;
        feed(&mut pipe)?;
        pipe.run()
    })
}

/// Run the reader benchmark under every executor arrangement
pub fn compare_exec_modes(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    let modes = [
        ExecMode::Simple,
        ExecMode::Pipelined,
        ExecMode::AsyncPipelined,
        ExecMode::Separated {
            cpu: config.queue_depth,
            gpu: config.queue_depth,
        },
    ];
    modes
        .into_iter()
        .map(|mode| {
            let config = BenchConfig {
                mode,
                use_device: config.use_device || matches!(mode, ExecMode::Separated { .. }),
                ..config.clone()
            };
            bench_reader_pipeline(&config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::CopyMode;
    use test_case::test_case;

    fn small(mode: ExecMode, use_device: bool) -> BenchConfig {
        BenchConfig {
            iterations: 3,
            batch_size: 4,
            sample_bytes: 8,
            warmup_iterations: 1,
            track_memory: true,
            num_threads: 2,
            queue_depth: 2,
            mode,
            use_device,
        }
    }

    #[test]
    fn test_run_benchmark_counts_calls() {
        let config = small(ExecMode::Simple, false);
        let mut calls = 0;
        let result = run_benchmark("count", &config, || {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 4);
        assert_eq!(result.name, "count");
        assert!(result.min_time <= result.max_time);
        assert!(result.throughput > 0.0);
    }

    #[test]
    fn test_run_benchmark_propagates_errors() {
        let config = small(ExecMode::Simple, false);
        let err = run_benchmark("fail", &config, || Err(Error::Execution("boom".into()))).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let config = BenchConfig {
            iterations: 0,
            ..small(ExecMode::Simple, false)
        };
        assert!(run_benchmark("empty", &config, || Ok(())).is_err());
    }

    #[test_case(ExecMode::Simple, false; "simple")]
    #[test_case(ExecMode::Pipelined, false; "pipelined")]
    #[test_case(ExecMode::AsyncPipelined, false; "async")]
    #[test_case(ExecMode::Separated { cpu: 2, gpu: 1 }, true; "separated")]
    fn test_reader_pipeline_modes(mode: ExecMode, use_device: bool) {
        let result = bench_reader_pipeline(&small(mode, use_device)).unwrap();
        assert!(result.memory_usage.unwrap() > 0);
    }

    #[test_case(CopyMode::Default; "default")]
    #[test_case(CopyMode::ForceCopy; "copy")]
    fn test_external_feed(copy: CopyMode) {
        let options = FeedOptions {
            copy,
            ..FeedOptions::default()
        };
        bench_external_feed(&small(ExecMode::AsyncPipelined, false), options).unwrap();
    }

    #[test]
    fn test_compare_exec_modes_reports_each_mode() {
        let results = compare_exec_modes(&small(ExecMode::Simple, false)).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[3].name.contains("Separated"));
    }
}
