//! Building datasets from descriptors
//!
//! The factory is the only place that turns a runtime [`DataType`] into a
//! concrete [`NNDataSet<T>`]. Everything downstream works through the
//! [`DataSet`] trait object it returns.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DatasetConfig;
use crate::dataset::{DataSet, DatasetSnapshot, NNDataSet};
use crate::error::{Error, Result};
use crate::memory::{DeviceMemory, MemoryUsage};
use crate::schema::{DataType, DatasetDescriptor};
use crate::shard::{ShardSpec, Sharding};

/// Build an empty dataset with default configuration and no memory budget
pub fn create_dataset(descriptor: &DatasetDescriptor) -> Result<Box<dyn DataSet>> {
    create_dataset_with(descriptor, DatasetConfig::default(), DeviceMemory::unbounded())
}

/// Build an empty dataset charged to `memory`
///
/// Rejects unsupported attribute bits, attribute combinations that need
/// `Sparse`, and element types without a dataset implementation.
pub fn create_dataset_with(
    descriptor: &DatasetDescriptor,
    config: DatasetConfig,
    memory: Arc<DeviceMemory>,
) -> Result<Box<dyn DataSet>> {
    if let Err(err) = descriptor.validate() {
        warn!(dataset = %descriptor.name, error = %err, "rejected descriptor");
        return Err(err);
    }
    let dataset: Box<dyn DataSet> = match descriptor.data_type {
        DataType::UInt => Box::new(NNDataSet::<u32>::new(descriptor, config, memory)?),
        DataType::Int => Box::new(NNDataSet::<i32>::new(descriptor, config, memory)?),
        DataType::LLInt => Box::new(NNDataSet::<i64>::new(descriptor, config, memory)?),
        DataType::ULLInt => Box::new(NNDataSet::<u64>::new(descriptor, config, memory)?),
        DataType::Float => Box::new(NNDataSet::<f32>::new(descriptor, config, memory)?),
        DataType::Double => Box::new(NNDataSet::<f64>::new(descriptor, config, memory)?),
        DataType::UChar => Box::new(NNDataSet::<u8>::new(descriptor, config, memory)?),
        DataType::Char => Box::new(NNDataSet::<i8>::new(descriptor, config, memory)?),
        DataType::RGB8 | DataType::RGB16 => {
            return Err(Error::UnsupportedDataType(descriptor.data_type.to_string()));
        }
    };
    Ok(dataset)
}

/// Rebuild a dataset from a snapshot
pub fn restore_dataset(
    snapshot: &DatasetSnapshot,
    config: DatasetConfig,
    memory: Arc<DeviceMemory>,
) -> Result<Box<dyn DataSet>> {
    let mut dataset = create_dataset_with(&snapshot.descriptor, config, memory)?;
    dataset.load_snapshot(snapshot)?;
    Ok(dataset)
}

/// Named datasets sharing one memory budget
#[derive(Debug)]
pub struct DatasetRegistry {
    datasets: Vec<Box<dyn DataSet>>,
    config: DatasetConfig,
    memory: Arc<DeviceMemory>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self::new(DatasetConfig::default(), DeviceMemory::unbounded())
    }
}

impl DatasetRegistry {
    /// Empty registry
    pub fn new(config: DatasetConfig, memory: Arc<DeviceMemory>) -> Self {
        Self {
            datasets: Vec::new(),
            config,
            memory,
        }
    }

    /// Budget shared by every dataset built here
    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    /// Build and register a dataset
    pub fn create(&mut self, descriptor: &DatasetDescriptor) -> Result<&mut dyn DataSet> {
        self.check_unique(&descriptor.name)?;
        let dataset = create_dataset_with(descriptor, self.config, Arc::clone(&self.memory))?;
        Ok(self.push(dataset))
    }

    /// Register an existing dataset
    pub fn insert(&mut self, dataset: Box<dyn DataSet>) -> Result<&mut dyn DataSet> {
        self.check_unique(dataset.name())?;
        Ok(self.push(dataset))
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if self.get(name).is_some() {
            return Err(Error::InvalidArgument(format!("dataset {name} already registered")));
        }
        Ok(())
    }

    fn push(&mut self, dataset: Box<dyn DataSet>) -> &mut dyn DataSet {
        let position = self.datasets.len();
        self.datasets.push(dataset);
        self.datasets[position].as_mut()
    }

    /// Dataset called `name`
    pub fn get(&self, name: &str) -> Option<&dyn DataSet> {
        self.datasets.iter().find(|d| d.name() == name).map(|d| &**d)
    }

    /// Mutable dataset called `name`
    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn DataSet> {
        match self.datasets.iter_mut().find(|d| d.name() == name) {
            Some(dataset) => Some(&mut **dataset),
            None => None,
        }
    }

    /// Unregister and return the dataset called `name`
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn DataSet>> {
        let position = self.datasets.iter().position(|d| d.name() == name)?;
        Some(self.datasets.remove(position))
    }

    /// Registered names in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.name()).collect()
    }

    /// Number of registered datasets
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Registered datasets in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &dyn DataSet> {
        self.datasets.iter().map(|d| &**d)
    }

    /// Shard every dataset, undoing the ones already sharded if any fails
    pub fn shard_all(&mut self, sharding: Sharding, spec: ShardSpec) -> Result<()> {
        for i in 0..self.datasets.len() {
            if let Err(err) = self.datasets[i].shard(sharding, spec) {
                warn!(dataset = %self.datasets[i].name(), error = %err, "sharding failed, rolling back");
                for dataset in &mut self.datasets[..i] {
                    dataset.unshard()?;
                }
                return Err(err);
            }
        }
        info!(datasets = self.datasets.len(), %sharding, rank = spec.rank(), workers = spec.workers(), "sharded registry");
        Ok(())
    }

    /// Unshard every dataset
    pub fn unshard_all(&mut self) -> Result<()> {
        self.datasets.iter_mut().try_for_each(|dataset| dataset.unshard())
    }

    /// Combined footprint
    pub fn memory_usage(&self) -> MemoryUsage {
        self.datasets.iter().map(|d| d.memory_usage()).sum()
    }
}
