//! Benchmark runner for batchflow pipelines
//!
//! Pass `--json` to print one JSON object per result instead of text.

use batchflow_bench::{
    bench_external_feed, bench_reader_pipeline, compare_exec_modes, BenchConfig, BenchResult,
};
use batchflow_core::logging::init_logging_from_env;
use batchflow_core::{CopyMode, FeedOptions, Result};

fn report(result: &BenchResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} samples/sec", result.throughput);
    if let Some(memory) = result.memory_usage {
        println!("  Memory usage: {memory} bytes");
    }
    Ok(())
}

fn run(json: bool) -> Result<()> {
    init_logging_from_env();
    batchflow_ops::init()?;

    if !json {
        println!("=== Executor modes ===");
    }
    for result in compare_exec_modes(&BenchConfig::default())? {
        report(&result, json)?;
    }

    if !json {
        println!("\n=== Batch size ===");
    }
    for batch_size in [8, 32, 128] {
        let config = BenchConfig {
            batch_size,
            ..BenchConfig::default()
        };
        report(&bench_reader_pipeline(&config)?, json)?;
    }

    if !json {
        println!("\n=== Queue depth ===");
    }
    for queue_depth in [1, 2, 4] {
        let config = BenchConfig {
            queue_depth,
            ..BenchConfig::default()
        };
        report(&bench_reader_pipeline(&config)?, json)?;
    }

    if !json {
        println!("\n=== External feeds ===");
    }
    for copy in [CopyMode::Default, CopyMode::ForceCopy] {
        let options = FeedOptions {
            copy,
            ..FeedOptions::default()
        };
        report(&bench_external_feed(&BenchConfig::default(), options)?, json)?;
    }
    Ok(())
}

fn main() {
    let json = std::env::args().any(|arg| arg == "--json");
    if let Err(e) = run(json) {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}
