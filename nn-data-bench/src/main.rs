//! Benchmark runner for dataset dispatch paths

use anyhow::Context;
use nn_data_bench::{bench_layouts, bench_transposition, BenchConfig, BenchResult};
use nn_data_readers::DatasetArchive;
use tracing_subscriber::EnvFilter;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} examples/sec", result.throughput);
    println!("  Memory usage: {} bytes", result.memory_usage);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Dataset Benchmarks ===");
    let config = BenchConfig::default();

    for result in bench_layouts(&config).context("layout benchmarks failed")? {
        print_result(&result);
    }

    println!("\n=== Sparse Transposition ===");
    for outputs in [16, 128] {
        let result = bench_transposition(&config, outputs).context("transposition benchmark failed")?;
        println!("\nOutputs: {outputs}");
        print_result(&result);
    }

    // Archives listed on the command line are opened and summarized
    for path in std::env::args().skip(1) {
        let archive = DatasetArchive::open(&path).with_context(|| format!("failed to open {path}"))?;
        println!("\nArchive: {path}");
        for entry in archive.entries() {
            println!(
                "  {} {} {} x {} ({} bytes)",
                entry.name(),
                entry.descriptor.data_type,
                entry.descriptor.examples,
                entry.descriptor.dimensions.stride(),
                entry.record_len()
            );
        }
    }
    Ok(())
}
