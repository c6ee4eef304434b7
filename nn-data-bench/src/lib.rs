//! Benchmarks for dataset dispatch paths

use std::sync::Arc;
use std::time::{Duration, Instant};

use nn_data_core::{
    create_dataset_with, Activation, Attributes, DataSet, DataType, DatasetConfig,
    DatasetDescriptor, DeltaParams, DeviceMemory, ErrorFunction, Result,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of timed iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Examples per dataset
    pub examples: usize,

    /// Features per example
    pub width: usize,

    /// Fraction of features stored per sparse example
    pub density: f32,

    /// Examples per batch
    pub batch_size: usize,

    /// Seed for generated data
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            examples: 4096,
            width: 1024,
            density: 0.02,
            batch_size: 256,
            seed: 42,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
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

    /// Device bytes reserved by the benchmarked dataset
    pub memory_usage: usize,

    /// Throughput in examples per second
    pub throughput: f64,
}

/// Time `func` over `config.iterations` runs, each covering `examples` examples
pub fn run_benchmark<F>(
    name: &str,
    config: &BenchConfig,
    examples: usize,
    memory: &DeviceMemory,
    mut func: F,
) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
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

    let runs = u32::try_from(times.len().max(1)).unwrap_or(u32::MAX);
    let avg_time = times.iter().sum::<Duration>() / runs;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = (config.iterations * examples) as f64 / total_time.as_secs_f64().max(f64::EPSILON);

    debug!(benchmark = name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        memory_usage: memory.usage(),
        throughput,
    })
}

/// Build a dataset with random contents
///
/// Indexed datasets store half as many payload rows as examples and map each
/// example to a random row.
pub fn generate_dataset(
    name: &str,
    attributes: Attributes,
    config: &BenchConfig,
    memory: Arc<DeviceMemory>,
) -> Result<Box<dyn DataSet>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let rows = if attributes.is_indexed() {
        (config.examples / 2).max(1)
    } else {
        config.examples
    };
    let descriptor = if attributes.is_sparse() {
        DatasetDescriptor::sparse(name, DataType::Float, config.width, config.examples, config.density)
    } else {
        DatasetDescriptor::dense(name, DataType::Float, config.width, config.examples)
    };
    let mut descriptor = descriptor.with_attributes(attributes);
    if attributes.is_indexed() {
        descriptor = descriptor.with_unique_examples(rows);
    }
    let mut dataset = create_dataset_with(&descriptor, DatasetConfig::default(), memory)?;

    if attributes.is_sparse() {
        let per_example = ((config.width as f32 * config.density) as usize).max(1);
        let mut start = Vec::with_capacity(rows);
        let mut end = Vec::with_capacity(rows);
        let mut index = Vec::new();
        for _ in 0..rows {
            start.push(index.len() as u64);
            let mut columns: Vec<u32> = (0..per_example)
                .map(|_| rng.random_range(0..config.width as u32))
                .collect();
            columns.sort_unstable();
            columns.dedup();
            index.extend(columns);
            end.push(index.len() as u64);
        }
        let values: Vec<u8> = (0..index.len())
            .flat_map(|_| rng.random::<f32>().to_le_bytes())
            .collect();
        let data = (!attributes.is_boolean()).then_some(values.as_slice());
        dataset.load_sparse_data(&start, &end, data, &index)?;
    } else {
        let values: Vec<u8> = (0..rows * config.width)
            .flat_map(|_| rng.random::<f32>().to_le_bytes())
            .collect();
        dataset.load_dense_data(&values)?;
    }
    if attributes.is_indexed() {
        let index: Vec<u32> = (0..config.examples)
            .map(|_| rng.random_range(0..rows as u32))
            .collect();
        dataset.load_index(&index)?;
    }
    if attributes.is_weighted() {
        let weights: Vec<f32> = (0..config.examples).map(|_| rng.random_range(0.5..2.0)).collect();
        dataset.load_weights(&weights)?;
    }
    Ok(dataset)
}

/// Attribute combinations covered by [`bench_layouts`]
pub fn layouts() -> Vec<(&'static str, Attributes)> {
    vec![
        ("dense", Attributes::NONE),
        ("dense weighted", Attributes::WEIGHTED),
        ("sparse boolean", Attributes::SPARSE | Attributes::BOOLEAN),
        ("sparse analog", Attributes::SPARSE),
        (
            "sparse ignore-zero",
            Attributes::SPARSE | Attributes::SPARSE_IGNORE_ZERO,
        ),
        (
            "sparse boolean weighted",
            Attributes::SPARSE | Attributes::BOOLEAN | Attributes::WEIGHTED,
        ),
        ("indexed dense", Attributes::INDEXED),
        ("indexed dense weighted", Attributes::INDEXED | Attributes::WEIGHTED),
        ("indexed sparse boolean", Attributes::SPARSE | Attributes::BOOLEAN | Attributes::INDEXED),
        ("indexed sparse analog", Attributes::SPARSE | Attributes::INDEXED),
        (
            "indexed sparse analog weighted",
            Attributes::SPARSE | Attributes::INDEXED | Attributes::WEIGHTED,
        ),
    ]
}

/// Time input loading, error and output delta for every layout
pub fn bench_layouts(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    layouts()
        .into_iter()
        .map(|(name, attributes)| bench_training_step(name, attributes, config))
        .collect()
}

/// Time one pass of input, error and delta over all batches
pub fn bench_training_step(
    name: &str,
    attributes: Attributes,
    config: &BenchConfig,
) -> Result<BenchResult> {
    let memory = DeviceMemory::unbounded();
    let dataset = generate_dataset(name, attributes, config, Arc::clone(&memory))?;
    let (batch, stride) = (config.batch_size.min(config.examples), dataset.stride());
    let mut unit = vec![0.0f32; batch * stride];
    let mut delta = vec![0.0f32; batch * stride];
    let kind = ErrorFunction::CrossEntropy.loss_kind(Activation::Sigmoid);

    run_benchmark(name, config, config.examples, &memory, || {
        let mut position = 0;
        while position + batch <= dataset.local_examples() && batch > 0 {
            dataset.load_input_unit(position, batch, stride, &mut unit)?;
            unit.iter_mut().for_each(|u| *u = u.clamp(0.05, 0.95));
            dataset.calculate_error(kind, position, batch, stride, &unit)?;
            dataset.calculate_output_delta(
                ErrorFunction::CrossEntropy,
                Activation::Sigmoid,
                position,
                batch,
                stride,
                &unit,
                &mut delta,
                DeltaParams::default(),
            )?;
            position += batch;
        }
        Ok(())
    })
}

/// Time building the transposed matrix and weight gradient of a sparse dataset
pub fn bench_transposition(config: &BenchConfig, outputs: usize) -> Result<BenchResult> {
    let memory = DeviceMemory::unbounded();
    let mut dataset = generate_dataset("transposed", Attributes::SPARSE, config, Arc::clone(&memory))?;
    let batch = config.batch_size.min(config.examples);
    let features = dataset.stride();
    let delta = vec![0.01f32; batch * outputs];
    let mut gradient = vec![0.0f32; features * outputs];

    run_benchmark("sparse transposition", config, config.examples, &memory, || {
        let mut position = 0;
        while position + batch <= dataset.local_examples() && batch > 0 {
            dataset.calculate_sparse_transposed_matrix(position, batch)?;
            dataset.calculate_sparse_transposed_weight_gradient(
                1.0,
                0.0,
                features,
                outputs,
                &delta,
                &mut gradient,
            )?;
            position += batch;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BenchConfig {
        BenchConfig {
            iterations: 2,
            warmup_iterations: 1,
            examples: 64,
            width: 32,
            density: 0.1,
            batch_size: 16,
            seed: 1,
        }
    }

    #[test]
    fn test_bench_layouts() {
        let results = bench_layouts(&small()).unwrap();
        assert_eq!(results.len(), layouts().len());
        for result in &results {
            assert!(result.min_time <= result.max_time);
            assert!(result.memory_usage > 0);
        }
    }

    #[test]
    fn test_bench_transposition() {
        let result = bench_transposition(&small(), 8).unwrap();
        assert_eq!(result.name, "sparse transposition");
        assert!(result.throughput > 0.0);
    }

    #[test]
    fn test_indexed_layouts_are_covered() {
        let indexed = layouts()
            .into_iter()
            .filter(|(_, attributes)| attributes.is_indexed())
            .count();
        assert!(indexed >= 4);

        let config = small();
        let dataset = generate_dataset(
            "indexed",
            Attributes::SPARSE | Attributes::INDEXED | Attributes::WEIGHTED,
            &config,
            DeviceMemory::unbounded(),
        )
        .unwrap();
        assert_eq!(dataset.examples(), config.examples);
        assert_eq!(dataset.unique_examples(), config.examples / 2);
        assert_eq!(dataset.local_examples(), config.examples);
        let mut unit = vec![0.0; config.examples * config.width];
        dataset
            .load_input_unit(0, config.examples, config.width, &mut unit)
            .unwrap();
        assert!(unit.iter().any(|&u| u != 0.0));
    }

    #[test]
    fn test_generated_sparse_rows_are_sorted() {
        let dataset =
            generate_dataset("g", Attributes::SPARSE, &small(), DeviceMemory::unbounded()).unwrap();
        for n in 0..dataset.local_examples() {
            let count = dataset.sparse_datapoints(n).unwrap() as usize;
            let columns: Vec<u32> = (0..count).map(|i| dataset.sparse_index(n, i).unwrap()).collect();
            assert!(columns.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
