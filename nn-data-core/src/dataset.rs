//! Training datasets
//!
//! [`NNDataSet<T>`] holds one named input or target column, dense or sparse,
//! for element type `T`. The network drives it through the object-safe
//! [`DataSet`] trait: materialize an input batch, compute error and output
//! delta against produced values, build the transposed sparse matrix for
//! backpropagation, and shard across workers.
//!
//! Payload arrays live in [`DeviceBuffer`]s. Loaders write the host side and
//! the `load_*` variants upload immediately, the `copy_*` variants leave
//! uploading to [`DataSet::upload`]. Kernels only read device data.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use tracing::{debug, info, trace, warn};

use crate::activation::{Activation, DeltaParams};
use crate::buffer::DeviceBuffer;
use crate::config::DatasetConfig;
use crate::dispatch::{Targets, Variant};
use crate::element::DataElement;
use crate::error::{Error, Result};
use crate::kernels::{
    self, ComputeDelta, ComputeError, CountDatapoints, FillTransposed, LoadInput, Noise, SparseZ,
};
use crate::loss::{ErrorFunction, LossKind, UnitLoss};
use crate::memory::{DeviceMemory, MemoryUsage};
use crate::schema::{Attributes, DataType, DatasetDescriptor, Dimensions};
use crate::shard::{ShardSpec, Sharding};
use crate::transpose::{DatapointCounts, SparseTransposed, TransposedView};

/// Host copy of a dataset's contents, enough to rebuild it exactly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    /// Shape, type and attributes
    pub descriptor: DatasetDescriptor,
    /// Dense payload as little-endian element bytes
    pub dense: Option<Vec<u8>>,
    /// Sparse payload
    pub sparse: Option<SparseSnapshot>,
    /// Example index
    pub index: Option<Vec<u32>>,
    /// Example weights
    pub weights: Option<Vec<f32>>,
}

/// Sparse arrays of a [`DatasetSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseSnapshot {
    /// First entry of each row
    pub start: Vec<u64>,
    /// One past the last entry of each row
    pub end: Vec<u64>,
    /// Column of each entry
    pub index: Vec<u32>,
    /// Value of each entry as element bytes, absent for boolean data
    pub data: Option<Vec<u8>>,
}

/// Operations the network and loaders perform on a dataset
pub trait DataSet: Send + Sync + fmt::Debug {
    /// Dataset name
    fn name(&self) -> &str;

    /// Change the name
    fn rename(&mut self, name: &str);

    /// Element type
    fn data_type(&self) -> DataType;

    /// Attribute bits
    fn attributes(&self) -> Attributes;

    /// Dispatch key resolved at construction
    fn variant(&self) -> Variant;

    /// Shape of one example before model sharding
    fn dimensions(&self) -> Dimensions;

    /// Global example count
    fn examples(&self) -> usize;

    /// Distinct stored rows before sharding
    fn unique_examples(&self) -> usize;

    /// Examples held by this worker
    fn local_examples(&self) -> usize;

    /// Features per example held by this worker
    fn stride(&self) -> usize;

    /// Current sharding mode
    fn sharding(&self) -> Sharding;

    /// Feature range `[min_x, max_x)` held by this worker
    fn feature_range(&self) -> Range<usize>;

    /// Capacity of the sparse entry arrays
    fn sparse_data_size(&self) -> usize;

    /// Attached configuration
    fn config(&self) -> &DatasetConfig;

    /// Replace the configuration, redrawing the denoising mask when its settings change
    fn set_config(&mut self, config: DatasetConfig) -> Result<()>;

    /// Whether derived structures must be rebuilt
    fn is_dirty(&self) -> bool;

    /// Mark streamed input
    fn set_streaming(&mut self, streaming: bool);

    /// Whether the dataset is streamed
    fn is_streaming(&self) -> bool;

    /// Overwrite the dense payload from element bytes, host only
    fn copy_dense_data(&mut self, raw: &[u8]) -> Result<()>;

    /// Overwrite the dense payload from element bytes and upload
    fn load_dense_data(&mut self, raw: &[u8]) -> Result<()>;

    /// Overwrite the sparse payload, host only
    fn copy_sparse_data(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[u8]>,
        index: &[u32],
    ) -> Result<()>;

    /// Overwrite the sparse payload and upload
    fn load_sparse_data(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[u8]>,
        index: &[u32],
    ) -> Result<()>;

    /// Signed-integer variant of [`DataSet::load_sparse_data`], rejecting negatives
    fn load_sparse_data_signed(
        &mut self,
        start: &[i64],
        end: &[i64],
        data: Option<&[u8]>,
        index: &[i64],
    ) -> Result<()>;

    /// 32-bit variant of [`DataSet::load_sparse_data_signed`]
    fn load_sparse_data_i32(
        &mut self,
        start: &[i32],
        end: &[i32],
        data: Option<&[u8]>,
        index: &[i32],
    ) -> Result<()>;

    /// Overwrite the example index and upload
    fn load_index(&mut self, index: &[u32]) -> Result<()>;

    /// Overwrite the example weights and upload
    fn load_weights(&mut self, weights: &[f32]) -> Result<()>;

    /// Publish every host array to the device, invalidating derived structures
    fn upload(&mut self);

    /// Restore contents from a snapshot of the same shape and upload
    fn load_snapshot(&mut self, snapshot: &DatasetSnapshot) -> Result<()>;

    /// Export contents; fails while sharded
    fn snapshot(&self) -> Result<DatasetSnapshot>;

    /// Stored entries of example `n`
    fn sparse_datapoints(&self, n: usize) -> Result<u64>;

    /// Offset of example `n`'s first stored entry
    fn sparse_start(&self, n: usize) -> Result<u64>;

    /// Offset one past example `n`'s last stored entry
    fn sparse_end(&self, n: usize) -> Result<u64>;

    /// Column of entry `i` of example `n`
    fn sparse_index(&self, n: usize, i: usize) -> Result<u32>;

    /// Overwrite the column of entry `i` of example `n`, host only
    fn set_sparse_index(&mut self, n: usize, i: usize, column: u32) -> Result<()>;

    /// Turn input denoising on or off
    fn set_denoising(&mut self, enabled: bool) -> Result<()>;

    /// Whether input denoising is on
    fn is_denoising(&self) -> bool;

    /// Draw a fresh keep mask
    fn generate_denoising_data(&mut self) -> Result<()>;

    /// Permute local examples
    fn shuffle(&mut self, seed: u64) -> Result<()>;

    /// Split across workers
    fn shard(&mut self, sharding: Sharding, spec: ShardSpec) -> Result<()>;

    /// Undo [`DataSet::shard`], restoring the exact pre-shard contents
    ///
    /// The shard's buffers are released first. If the budget cannot hold the
    /// restored contents the dataset holds no examples, stays sharded and
    /// can be unsharded again once memory is available.
    fn unshard(&mut self) -> Result<()>;

    /// Host and device footprint
    fn memory_usage(&self) -> MemoryUsage;

    /// Write examples `position..position + batch` into `unit`
    fn load_input_unit(&self, position: usize, batch: usize, stride: usize, unit: &mut [f32]) -> Result<()>;

    /// Accumulate the sparse weighted sum of a batch into `unit`
    #[allow(clippy::too_many_arguments)]
    fn calculate_sparse_z(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        weight: &[f32],
        unit: &mut [f32],
        beta: f32,
    ) -> Result<()>;

    /// Check an error function and activation against this dataset
    fn validate_error_function(&self, function: ErrorFunction, activation: Activation) -> Result<()>;

    /// Batch error of `unit` against this dataset's targets
    fn calculate_error(
        &self,
        kind: LossKind,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &[f32],
    ) -> Result<f32>;

    /// Output delta of `unit` against this dataset's targets
    #[allow(clippy::too_many_arguments)]
    fn calculate_output_delta(
        &self,
        function: ErrorFunction,
        activation: Activation,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &[f32],
        delta: &mut [f32],
        params: DeltaParams,
    ) -> Result<()>;

    /// Count entries per feature over the local examples
    fn calculate_sparse_datapoint_counts(&mut self) -> Result<()>;

    /// Build the transposed matrix for a batch, resizing it when stale
    fn calculate_sparse_transposed_matrix(&mut self, position: usize, batch: usize) -> Result<()>;

    /// Last built transposed matrix
    fn sparse_transposed(&self) -> Option<TransposedView<'_>>;

    /// Accumulate the weight gradient from the transposed matrix
    #[allow(clippy::too_many_arguments)]
    fn calculate_sparse_transposed_weight_gradient(
        &self,
        alpha: f32,
        beta: f32,
        m: usize,
        n: usize,
        delta: &[f32],
        weight_gradient: &mut [f32],
    ) -> Result<()>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug)]
struct SparseStore<T: DataElement> {
    start: DeviceBuffer<u64>,
    end: DeviceBuffer<u64>,
    index: DeviceBuffer<u32>,
    data: Option<DeviceBuffer<T>>,
}

impl<T: DataElement> SparseStore<T> {
    fn new(rows: usize, entries: usize, boolean: bool, memory: &Arc<DeviceMemory>) -> Result<Self> {
        Ok(Self {
            start: DeviceBuffer::new(rows, memory)?,
            end: DeviceBuffer::new(rows, memory)?,
            index: DeviceBuffer::new(entries, memory)?,
            data: if boolean {
                None
            } else {
                Some(DeviceBuffer::new(entries, memory)?)
            },
        })
    }

    /// New store holding `rows` in order, keeping entries whose column is in
    /// `columns` and rebasing them to start at zero
    fn compact(
        &self,
        rows: impl Iterator<Item = usize>,
        columns: Range<usize>,
        memory: &Arc<DeviceMemory>,
    ) -> Result<Self> {
        let (src_start, src_end, src_index) = (self.start.host(), self.end.host(), self.index.host());
        let src_data = self.data.as_ref().map(DeviceBuffer::host);
        let mut start = Vec::new();
        let mut end = Vec::new();
        let mut index = Vec::new();
        let mut data = Vec::new();
        for row in rows {
            start.push(index.len() as u64);
            for entry in src_start[row] as usize..src_end[row] as usize {
                let column = src_index[entry] as usize;
                if columns.contains(&column) {
                    index.push((column - columns.start) as u32);
                    if let Some(src_data) = src_data {
                        data.push(src_data[entry]);
                    }
                }
            }
            end.push(index.len() as u64);
        }
        Ok(Self {
            start: DeviceBuffer::from_vec(start, memory)?,
            end: DeviceBuffer::from_vec(end, memory)?,
            index: DeviceBuffer::from_vec(index, memory)?,
            data: match src_data {
                Some(_) => Some(DeviceBuffer::from_vec(data, memory)?),
                None => None,
            },
        })
    }

    fn upload(&mut self) {
        self.start.upload();
        self.end.upload();
        self.index.upload();
        if let Some(data) = &mut self.data {
            data.upload();
        }
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = usage_of(&self.start) + usage_of(&self.end) + usage_of(&self.index);
        if let Some(data) = &self.data {
            usage = usage + usage_of(data);
        }
        usage
    }
}

#[derive(Debug)]
struct Store<T: DataElement> {
    dense: Option<DeviceBuffer<T>>,
    sparse: Option<SparseStore<T>>,
    index: Option<DeviceBuffer<u32>>,
    weights: Option<DeviceBuffer<f32>>,
}

impl<T: DataElement> Store<T> {
    fn empty() -> Self {
        Self {
            dense: None,
            sparse: None,
            index: None,
            weights: None,
        }
    }

    fn targets(&self, variant: Variant, stride: usize) -> Targets<'_, T> {
        let empty_u64: &[u64] = &[];
        let empty_u32: &[u32] = &[];
        let empty_t: &[T] = &[];
        let empty_f32: &[f32] = &[];
        let (sparse_start, sparse_end, sparse_index, sparse_data) = match &self.sparse {
            Some(sparse) => (
                sparse.start.device(),
                sparse.end.device(),
                sparse.index.device(),
                sparse.data.as_ref().map_or(empty_t, DeviceBuffer::device),
            ),
            None => (empty_u64, empty_u64, empty_u32, empty_t),
        };
        Targets {
            variant,
            stride,
            dense: self.dense.as_ref().map_or(empty_t, DeviceBuffer::device),
            sparse_start,
            sparse_end,
            sparse_index,
            sparse_data,
            index: self.index.as_ref().map_or(empty_u32, DeviceBuffer::device),
            weights: self.weights.as_ref().map_or(empty_f32, DeviceBuffer::device),
        }
    }

    fn upload(&mut self) {
        if let Some(dense) = &mut self.dense {
            dense.upload();
        }
        if let Some(sparse) = &mut self.sparse {
            sparse.upload();
        }
        if let Some(index) = &mut self.index {
            index.upload();
        }
        if let Some(weights) = &mut self.weights {
            weights.upload();
        }
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        if let Some(dense) = &self.dense {
            usage = usage + usage_of(dense);
        }
        if let Some(sparse) = &self.sparse {
            usage = usage + sparse.memory_usage();
        }
        if let Some(index) = &self.index {
            usage = usage + usage_of(index);
        }
        if let Some(weights) = &self.weights {
            usage = usage + usage_of(weights);
        }
        usage
    }
}

fn usage_of<T: bytemuck::Pod>(buffer: &DeviceBuffer<T>) -> MemoryUsage {
    MemoryUsage {
        host_bytes: buffer.host_size(),
        device_bytes: buffer.device_size(),
    }
}

#[derive(Debug)]
struct Denoising {
    random: DeviceBuffer<f32>,
    rng: StdRng,
}

impl Denoising {
    fn new(entries: usize, seed: Option<u64>, memory: &Arc<DeviceMemory>) -> Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut denoising = Self {
            random: DeviceBuffer::new(entries, memory)?,
            rng,
        };
        denoising.generate();
        Ok(denoising)
    }

    fn generate(&mut self) {
        let Denoising { random, rng } = self;
        random.host_mut().iter_mut().for_each(|r| *r = rng.random::<f32>());
        random.upload();
    }
}

/// Dataset of `T` elements
pub struct NNDataSet<T: DataElement> {
    name: String,
    attributes: Attributes,
    dimensions: Dimensions,
    examples: usize,
    unique_examples: usize,
    local_examples: usize,
    /// Payload rows held by this worker
    rows: usize,
    /// Features per example held by this worker
    stride: usize,
    sparse_density: f32,
    sparse_data_size: usize,
    sharding: Sharding,
    min_x: usize,
    max_x: usize,
    variant: Variant,
    config: DatasetConfig,
    memory: Arc<DeviceMemory>,
    store: Store<T>,
    denoising: Option<Denoising>,
    transposed: SparseTransposed,
    dirty: bool,
    streaming: bool,
    /// Contents before the current shard
    unsharded: Option<Box<DatasetSnapshot>>,
}

assert_impl_all!(NNDataSet<f32>: Send, Sync);
assert_impl_all!(DatasetSnapshot: Send, Sync, Clone);

impl<T: DataElement> NNDataSet<T> {
    /// Build an empty dataset for `descriptor`
    pub fn new(
        descriptor: &DatasetDescriptor,
        config: DatasetConfig,
        memory: Arc<DeviceMemory>,
    ) -> Result<Self> {
        descriptor.validate()?;
        config.validate()?;
        if descriptor.data_type != T::DATA_TYPE {
            return Err(Error::TypeMismatch(format!(
                "descriptor {} declares {} but the dataset stores {}",
                descriptor.name,
                descriptor.data_type,
                T::DATA_TYPE
            )));
        }

        let attributes = descriptor.attributes;
        let stride = descriptor.dimensions.stride();
        let examples = descriptor.examples;
        let unique_examples = descriptor.unique_examples();
        let sparse_data_size = if attributes.is_sparse() {
            descriptor.sparse_data_size()
        } else {
            0
        };

        let dense = if attributes.is_sparse() {
            None
        } else {
            let len = unique_examples.checked_mul(stride).ok_or_else(|| {
                Error::InvalidArgument(format!("{unique_examples} x {stride} dense payload overflows"))
            })?;
            Some(DeviceBuffer::new(len, &memory)?)
        };
        let sparse = if attributes.is_sparse() {
            Some(SparseStore::new(
                unique_examples,
                sparse_data_size,
                attributes.is_boolean(),
                &memory,
            )?)
        } else {
            None
        };
        let index = if attributes.is_indexed() {
            let identity = (0..examples)
                .map(|example| (example % unique_examples.max(1)) as u32)
                .collect();
            Some(DeviceBuffer::from_vec(identity, &memory)?)
        } else {
            None
        };
        let weights = if attributes.is_weighted() {
            Some(DeviceBuffer::filled(examples, 1.0, &memory)?)
        } else {
            None
        };

        let variant = Variant::from_attributes(attributes);
        info!(
            dataset = %descriptor.name,
            data_type = %T::DATA_TYPE,
            variant = %variant,
            examples,
            unique_examples,
            stride,
            sparse_data_size,
            "created dataset"
        );

        Ok(Self {
            name: descriptor.name.clone(),
            attributes,
            dimensions: descriptor.dimensions,
            examples,
            unique_examples,
            local_examples: examples,
            rows: unique_examples,
            stride,
            sparse_density: descriptor.sparse_density,
            sparse_data_size,
            sharding: Sharding::None,
            min_x: 0,
            max_x: stride,
            variant,
            config,
            memory,
            store: Store {
                dense,
                sparse,
                index,
                weights,
            },
            denoising: None,
            transposed: SparseTransposed::new(),
            dirty: true,
            streaming: false,
            unsharded: None,
        })
    }

    /// Descriptor of the unsharded dataset
    pub fn descriptor(&self) -> DatasetDescriptor {
        DatasetDescriptor {
            name: self.name.clone(),
            data_type: T::DATA_TYPE,
            attributes: self.attributes,
            dimensions: self.dimensions,
            examples: self.examples,
            unique_examples: self.attributes.is_indexed().then_some(self.unique_examples),
            sparse_density: self.sparse_density,
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.transposed.invalidate();
    }

    /// Stored entries of local example `n` as the kernels see them
    #[cfg(debug_assertions)]
    fn device_datapoints(&self, n: usize) -> u64 {
        let Some(sparse) = &self.store.sparse else {
            return 0;
        };
        let row = self.store.index.as_ref().map_or(n, |index| index.device()[n] as usize);
        sparse.end.device()[row] - sparse.start.device()[row]
    }

    fn rejected(&self, err: Error) -> Error {
        warn!(dataset = %self.name, variant = %self.variant, error = %err, "rejected request");
        err
    }

    fn sparse_store(&self) -> Result<&SparseStore<T>> {
        self.store
            .sparse
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {} is not sparse", self.name)))
    }

    fn sparse_store_mut(&mut self) -> Result<&mut SparseStore<T>> {
        match self.store.sparse.as_mut() {
            Some(sparse) => Ok(sparse),
            None => Err(Error::InvalidOperation(format!("dataset {} is not sparse", self.name))),
        }
    }

    /// Payload row holding local example `n`
    fn row_of(&self, n: usize) -> Result<usize> {
        if n >= self.local_examples {
            return Err(Error::OutOfBounds(format!(
                "example {n} outside {} local examples of {}",
                self.local_examples, self.name
            )));
        }
        Ok(match &self.store.index {
            Some(index) => index.host()[n] as usize,
            None => n,
        })
    }

    fn entry_of(&self, n: usize, i: usize) -> Result<usize> {
        let row = self.row_of(n)?;
        let sparse = self.sparse_store()?;
        let (start, end) = (sparse.start.host()[row], sparse.end.host()[row]);
        if i as u64 >= end - start {
            return Err(Error::OutOfBounds(format!(
                "entry {i} outside {} entries of example {n}",
                end - start
            )));
        }
        Ok(start as usize + i)
    }

    fn check_batch(&self, position: usize, batch: usize) -> Result<()> {
        match position.checked_add(batch) {
            Some(end) if end <= self.local_examples => Ok(()),
            _ => Err(Error::OutOfBounds(format!(
                "batch at {position} of {batch} examples outside {} local examples of {}",
                self.local_examples, self.name
            ))),
        }
    }

    fn check_unit(&self, what: &str, stride: usize, batch: usize, len: usize) -> Result<()> {
        if stride != self.stride {
            return Err(Error::InvalidArgument(format!(
                "{what} stride {stride} does not match stride {} of {}",
                self.stride, self.name
            )));
        }
        if len < batch * stride {
            return Err(Error::InvalidArgument(format!(
                "{what} holds {len} values, batch needs {}",
                batch * stride
            )));
        }
        Ok(())
    }

    fn check_loss(&self, kind: LossKind) -> Result<()> {
        let sparse = self.attributes.is_sparse();
        if (kind.dense_only() && sparse) || (kind.sparse_only() && !sparse) {
            return Err(self.rejected(Error::UnsupportedLayout {
                function: kind.to_string(),
                layout: self.variant.layout.to_string(),
            }));
        }
        Ok(())
    }

    fn targets(&self) -> Targets<'_, T> {
        self.store.targets(self.variant, self.stride)
    }

    fn noise(&self) -> Option<Noise<'_>> {
        self.denoising.as_ref().map(|denoising| Noise {
            random: denoising.random.device(),
            probability: self.config.denoising.probability,
            scale: self.config.denoising.keep_scale(),
        })
    }

    fn reset_denoising(&mut self) -> Result<()> {
        if self.denoising.is_some() {
            self.denoising = None;
            self.denoising = Some(Denoising::new(
                self.sparse_data_size,
                self.config.denoising.seed,
                &self.memory,
            )?);
        }
        Ok(())
    }

    /// Overwrite the dense payload, host only
    pub fn copy_dense(&mut self, values: &[T]) -> Result<()> {
        let name = &self.name;
        let dense = self
            .store
            .dense
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {name} is not dense")))?;
        if values.len() != dense.len() {
            return Err(Error::InvalidArgument(format!(
                "dense payload of {} values, expected {}",
                values.len(),
                dense.len()
            )));
        }
        dense.copy_from_host(values)?;
        debug!(dataset = %self.name, values = values.len(), "copied dense data");
        self.mark_dirty();
        Ok(())
    }

    /// Overwrite the dense payload and upload
    pub fn load_dense(&mut self, values: &[T]) -> Result<()> {
        self.copy_dense(values)?;
        self.upload();
        Ok(())
    }

    /// Overwrite the sparse payload, host only
    ///
    /// `start` and `end` hold one offset per payload row. Every range must lie
    /// within the sparse capacity and every referenced column below the
    /// stride. Analog datasets need `data` covering every referenced entry;
    /// boolean datasets ignore it.
    pub fn copy_sparse(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[T]>,
        index: &[u32],
    ) -> Result<()> {
        let rows = self.rows;
        let stride = self.stride;
        let capacity = self.sparse_data_size;
        let name = self.name.clone();
        let sparse = self.sparse_store_mut()?;

        if start.len() != rows || end.len() != rows {
            return Err(Error::InvalidArgument(format!(
                "{name} has {rows} rows, got {} starts and {} ends",
                start.len(),
                end.len()
            )));
        }
        let mut data_length = 0u64;
        for (row, (&s, &e)) in start.iter().zip(end).enumerate() {
            if s > e || e > capacity as u64 {
                return Err(Error::OutOfBounds(format!(
                    "row {row} of {name}: sparse range {s}..{e} outside 0..{capacity}"
                )));
            }
            data_length = data_length.max(e);
        }
        let data_length = data_length as usize;
        if index.len() < data_length {
            return Err(Error::InvalidArgument(format!(
                "{} sparse indices do not cover {data_length} entries",
                index.len()
            )));
        }
        for (row, (&s, &e)) in start.iter().zip(end).enumerate() {
            if let Some(&column) = index[s as usize..e as usize]
                .iter()
                .find(|&&column| column as usize >= stride)
            {
                return Err(Error::OutOfBounds(format!(
                    "row {row} of {name}: column {column} outside stride {stride}"
                )));
            }
        }

        match (&mut sparse.data, data) {
            (Some(stored), Some(data)) => {
                if data.len() < data_length {
                    return Err(Error::InvalidArgument(format!(
                        "{} sparse values do not cover {data_length} entries",
                        data.len()
                    )));
                }
                stored.copy_from_host(&data[..data.len().min(capacity)])?;
            }
            (Some(_), None) => {
                return Err(Error::InvalidArgument(format!(
                    "analog dataset {name} needs sparse values"
                )));
            }
            (None, Some(_)) => {
                debug!(dataset = %name, "boolean dataset ignores sparse values");
            }
            (None, None) => {}
        }
        sparse.start.copy_from_host(start)?;
        sparse.end.copy_from_host(end)?;
        sparse.index.copy_from_host(&index[..index.len().min(capacity)])?;

        debug!(dataset = %name, rows, entries = data_length, "copied sparse data");
        self.mark_dirty();
        Ok(())
    }

    /// Overwrite the sparse payload and upload
    pub fn load_sparse(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[T]>,
        index: &[u32],
    ) -> Result<()> {
        self.copy_sparse(start, end, data, index)?;
        self.upload();
        Ok(())
    }

    /// Signed-integer variant of [`NNDataSet::load_sparse`] for 32 or 64-bit offsets
    pub fn load_sparse_signed<S: Copy + Into<i64>>(
        &mut self,
        start: &[S],
        end: &[S],
        data: Option<&[T]>,
        index: &[S],
    ) -> Result<()> {
        let start = to_unsigned("sparse start", start)?;
        let end = to_unsigned("sparse end", end)?;
        let index = to_unsigned("sparse index", index)?
            .into_iter()
            .enumerate()
            .map(|(position, column)| {
                u32::try_from(column).map_err(|_| {
                    Error::OutOfBounds(format!("sparse index {column} at {position} exceeds 32 bits"))
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        self.load_sparse(&start, &end, data, &index)
    }

    /// Overwrite the example index, host only
    pub fn copy_index(&mut self, index: &[u32]) -> Result<()> {
        let (local, rows, name) = (self.local_examples, self.rows, self.name.clone());
        let stored = self
            .store
            .index
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {name} is not indexed")))?;
        if index.len() != local {
            return Err(Error::InvalidArgument(format!(
                "index of {} entries for {local} examples",
                index.len()
            )));
        }
        if let Some((example, &row)) = index.iter().enumerate().find(|(_, &row)| row as usize >= rows) {
            return Err(Error::OutOfBounds(format!(
                "example {example} maps to row {row}, {name} has {rows} rows"
            )));
        }
        stored.copy_from_host(index)?;
        debug!(dataset = %name, examples = local, "copied index");
        self.mark_dirty();
        Ok(())
    }

    /// Overwrite the example weights, host only
    pub fn copy_weights(&mut self, weights: &[f32]) -> Result<()> {
        let (local, name) = (self.local_examples, self.name.clone());
        let stored = self
            .store
            .weights
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {name} is not weighted")))?;
        if weights.len() != local {
            return Err(Error::InvalidArgument(format!(
                "{} weights for {local} examples",
                weights.len()
            )));
        }
        stored.copy_from_host(weights)?;
        debug!(dataset = %name, examples = local, "copied weights");
        self.mark_dirty();
        Ok(())
    }

    /// Element at `(x, y, z)` of dense example `n`
    pub fn data_point(&self, n: usize, x: usize, y: usize, z: usize) -> Result<T> {
        let offset = self.dense_offset(n, x, y, z)?;
        let dense = self
            .store
            .dense
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {} is not dense", self.name)))?;
        Ok(dense.host()[offset])
    }

    /// Overwrite the element at `(x, y, z)` of dense example `n`, host only
    pub fn set_data_point(&mut self, n: usize, x: usize, y: usize, z: usize, value: T) -> Result<()> {
        let offset = self.dense_offset(n, x, y, z)?;
        let name = &self.name;
        let dense = self
            .store
            .dense
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("dataset {name} is not dense")))?;
        dense.host_mut()[offset] = value;
        self.mark_dirty();
        Ok(())
    }

    fn dense_offset(&self, n: usize, x: usize, y: usize, z: usize) -> Result<usize> {
        let row = self.row_of(n)?;
        let column = self.dimensions.offset(x, y, z)?;
        if !(self.min_x..self.max_x).contains(&column) {
            return Err(Error::OutOfBounds(format!(
                "column {column} outside this worker's features {}..{}",
                self.min_x, self.max_x
            )));
        }
        Ok(row * self.stride + column - self.min_x)
    }

    /// Value of entry `i` of sparse example `n`
    pub fn sparse_data_point(&self, n: usize, i: usize) -> Result<T> {
        let entry = self.entry_of(n, i)?;
        let data = self.sparse_store()?.data.as_ref().ok_or_else(|| {
            Error::InvalidOperation(format!("boolean dataset {} stores no values", self.name))
        })?;
        Ok(data.host()[entry])
    }

    /// Overwrite the value of entry `i` of sparse example `n`, host only
    pub fn set_sparse_data_point(&mut self, n: usize, i: usize, value: T) -> Result<()> {
        let entry = self.entry_of(n, i)?;
        let name = self.name.clone();
        let data = self.sparse_store_mut()?.data.as_mut().ok_or_else(|| {
            Error::InvalidOperation(format!("boolean dataset {name} stores no values"))
        })?;
        data.host_mut()[entry] = value;
        self.mark_dirty();
        Ok(())
    }

    fn shard_data(&mut self, spec: ShardSpec) -> Result<()> {
        let range = spec.range(self.examples);
        if let Some(weights) = &mut self.store.weights {
            *weights = DeviceBuffer::from_vec(weights.host()[range.clone()].to_vec(), &self.memory)?;
        }
        if let Some(index) = &mut self.store.index {
            *index = DeviceBuffer::from_vec(index.host()[range.clone()].to_vec(), &self.memory)?;
        } else {
            self.keep_rows(range.clone())?;
        }
        self.local_examples = range.len();
        info!(dataset = %self.name, rank = spec.rank(), examples = ?range, "data sharded");
        Ok(())
    }

    /// Keep payload rows in `rows` order over this worker's feature range
    fn keep_rows(&mut self, rows: impl ExactSizeIterator<Item = usize>) -> Result<()> {
        let stride = self.stride;
        let count = rows.len();
        if let Some(dense) = &mut self.store.dense {
            let host = dense.host();
            let kept = rows
                .flat_map(|row| host[row * stride..(row + 1) * stride].iter().copied())
                .collect();
            *dense = DeviceBuffer::from_vec(kept, &self.memory)?;
        } else if let Some(sparse) = &mut self.store.sparse {
            *sparse = sparse.compact(rows, 0..stride, &self.memory)?;
            self.sparse_data_size = sparse.index.len();
        }
        self.rows = count;
        Ok(())
    }

    fn shard_model(&mut self, spec: ShardSpec) -> Result<()> {
        let columns = spec.range(self.stride);
        let (stride, width) = (self.stride, columns.len());
        if let Some(dense) = &mut self.store.dense {
            let host = dense.host();
            let kept = (0..self.rows)
                .flat_map(|row| {
                    let base = row * stride;
                    host[base + columns.start..base + columns.end].iter().copied()
                })
                .collect();
            *dense = DeviceBuffer::from_vec(kept, &self.memory)?;
        } else if let Some(sparse) = &mut self.store.sparse {
            *sparse = sparse.compact(0..self.rows, columns.clone(), &self.memory)?;
            self.sparse_data_size = sparse.index.len();
        }
        self.min_x = columns.start;
        self.max_x = columns.end;
        self.stride = width;
        info!(dataset = %self.name, rank = spec.rank(), features = ?columns, "model sharded");
        Ok(())
    }
}

fn to_unsigned<S: Copy + Into<i64>>(field: &'static str, values: &[S]) -> Result<Vec<u64>> {
    values
        .iter()
        .enumerate()
        .map(|(position, &value)| {
            let value: i64 = value.into();
            u64::try_from(value).map_err(|_| Error::NegativeValue { field, position, value })
        })
        .collect()
}

impl<T: DataElement> DataSet for NNDataSet<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: &str) {
        debug!(from = %self.name, to = name, "renamed dataset");
        self.name = name.to_string();
    }

    fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    fn attributes(&self) -> Attributes {
        self.attributes
    }

    fn variant(&self) -> Variant {
        self.variant
    }

    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn examples(&self) -> usize {
        self.examples
    }

    fn unique_examples(&self) -> usize {
        self.unique_examples
    }

    fn local_examples(&self) -> usize {
        self.local_examples
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn sharding(&self) -> Sharding {
        self.sharding
    }

    fn feature_range(&self) -> Range<usize> {
        self.min_x..self.max_x
    }

    fn sparse_data_size(&self) -> usize {
        self.sparse_data_size
    }

    fn config(&self) -> &DatasetConfig {
        &self.config
    }

    fn set_config(&mut self, config: DatasetConfig) -> Result<()> {
        config.validate()?;
        let previous = std::mem::replace(&mut self.config, config).denoising;
        if previous.seed != config.denoising.seed {
            self.reset_denoising()?;
        } else if previous != config.denoising {
            if let Some(denoising) = &mut self.denoising {
                denoising.generate();
            }
        }
        self.mark_dirty();
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn copy_dense_data(&mut self, raw: &[u8]) -> Result<()> {
        let values = T::decode(raw)?;
        self.copy_dense(&values)
    }

    fn load_dense_data(&mut self, raw: &[u8]) -> Result<()> {
        self.copy_dense_data(raw)?;
        self.upload();
        Ok(())
    }

    fn copy_sparse_data(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[u8]>,
        index: &[u32],
    ) -> Result<()> {
        let data = data.map(T::decode).transpose()?;
        self.copy_sparse(start, end, data.as_deref(), index)
    }

    fn load_sparse_data(
        &mut self,
        start: &[u64],
        end: &[u64],
        data: Option<&[u8]>,
        index: &[u32],
    ) -> Result<()> {
        self.copy_sparse_data(start, end, data, index)?;
        self.upload();
        Ok(())
    }

    fn load_sparse_data_signed(
        &mut self,
        start: &[i64],
        end: &[i64],
        data: Option<&[u8]>,
        index: &[i64],
    ) -> Result<()> {
        let data = data.map(T::decode).transpose()?;
        self.load_sparse_signed(start, end, data.as_deref(), index)
    }

    fn load_sparse_data_i32(
        &mut self,
        start: &[i32],
        end: &[i32],
        data: Option<&[u8]>,
        index: &[i32],
    ) -> Result<()> {
        let data = data.map(T::decode).transpose()?;
        self.load_sparse_signed(start, end, data.as_deref(), index)
    }

    fn load_index(&mut self, index: &[u32]) -> Result<()> {
        self.copy_index(index)?;
        self.upload();
        Ok(())
    }

    fn load_weights(&mut self, weights: &[f32]) -> Result<()> {
        self.copy_weights(weights)?;
        self.upload();
        Ok(())
    }

    fn upload(&mut self) {
        self.store.upload();
        self.mark_dirty();
        trace!(dataset = %self.name, "uploaded");
    }

    fn load_snapshot(&mut self, snapshot: &DatasetSnapshot) -> Result<()> {
        let descriptor = &snapshot.descriptor;
        if descriptor.data_type != T::DATA_TYPE
            || descriptor.attributes != self.attributes
            || descriptor.dimensions != self.dimensions
            || descriptor.examples != self.examples
            || descriptor.unique_examples() != self.unique_examples
        {
            return Err(Error::TypeMismatch(format!(
                "snapshot of {} does not match the shape of {}",
                descriptor.name, self.name
            )));
        }
        if let Some(dense) = &snapshot.dense {
            self.copy_dense_data(dense)?;
        }
        if let Some(sparse) = &snapshot.sparse {
            self.copy_sparse_data(&sparse.start, &sparse.end, sparse.data.as_deref(), &sparse.index)?;
        }
        if let Some(index) = &snapshot.index {
            self.copy_index(index)?;
        }
        if let Some(weights) = &snapshot.weights {
            self.copy_weights(weights)?;
        }
        self.upload();
        Ok(())
    }

    fn snapshot(&self) -> Result<DatasetSnapshot> {
        if self.sharding != Sharding::None {
            return Err(Error::InvalidOperation(format!(
                "dataset {} is {} sharded",
                self.name, self.sharding
            )));
        }
        Ok(DatasetSnapshot {
            descriptor: self.descriptor(),
            dense: self.store.dense.as_ref().map(|dense| dense.host_bytes().to_vec()),
            sparse: self.store.sparse.as_ref().map(|sparse| SparseSnapshot {
                start: sparse.start.host().to_vec(),
                end: sparse.end.host().to_vec(),
                index: sparse.index.host().to_vec(),
                data: sparse.data.as_ref().map(|data| data.host_bytes().to_vec()),
            }),
            index: self.store.index.as_ref().map(|index| index.host().to_vec()),
            weights: self.store.weights.as_ref().map(|weights| weights.host().to_vec()),
        })
    }

    fn sparse_datapoints(&self, n: usize) -> Result<u64> {
        let row = self.row_of(n)?;
        let sparse = self.sparse_store()?;
        Ok(sparse.end.host()[row] - sparse.start.host()[row])
    }

    fn sparse_start(&self, n: usize) -> Result<u64> {
        let row = self.row_of(n)?;
        Ok(self.sparse_store()?.start.host()[row])
    }

    fn sparse_end(&self, n: usize) -> Result<u64> {
        let row = self.row_of(n)?;
        Ok(self.sparse_store()?.end.host()[row])
    }

    fn sparse_index(&self, n: usize, i: usize) -> Result<u32> {
        let entry = self.entry_of(n, i)?;
        Ok(self.sparse_store()?.index.host()[entry])
    }

    fn set_sparse_index(&mut self, n: usize, i: usize, column: u32) -> Result<()> {
        let entry = self.entry_of(n, i)?;
        if column as usize >= self.stride {
            return Err(Error::OutOfBounds(format!(
                "column {column} outside stride {}",
                self.stride
            )));
        }
        self.sparse_store_mut()?.index.host_mut()[entry] = column;
        self.mark_dirty();
        Ok(())
    }

    fn set_denoising(&mut self, enabled: bool) -> Result<()> {
        if enabled && !self.attributes.is_sparse() {
            return Err(self.rejected(Error::InvalidOperation(format!(
                "denoising requires a sparse dataset, {} is dense",
                self.name
            ))));
        }
        match (enabled, self.denoising.is_some()) {
            (true, false) => {
                self.denoising = Some(Denoising::new(
                    self.sparse_data_size,
                    self.config.denoising.seed,
                    &self.memory,
                )?);
                info!(dataset = %self.name, probability = self.config.denoising.probability, "denoising enabled");
            }
            (false, true) => {
                self.denoising = None;
                info!(dataset = %self.name, "denoising disabled");
            }
            _ => return Ok(()),
        }
        self.mark_dirty();
        Ok(())
    }

    fn is_denoising(&self) -> bool {
        self.denoising.is_some()
    }

    fn generate_denoising_data(&mut self) -> Result<()> {
        let name = &self.name;
        let denoising = self
            .denoising
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("denoising is off for {name}")))?;
        denoising.generate();
        debug!(dataset = %self.name, entries = self.sparse_data_size, "generated denoising data");
        Ok(())
    }

    fn shuffle(&mut self, seed: u64) -> Result<()> {
        let mut order: Vec<usize> = (0..self.local_examples).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        if let Some(weights) = &mut self.store.weights {
            let host = weights.host();
            let permuted = order.iter().map(|&example| host[example]).collect();
            *weights = DeviceBuffer::from_vec(permuted, &self.memory)?;
        }
        if let Some(index) = &mut self.store.index {
            let host = index.host();
            let permuted = order.iter().map(|&example| host[example]).collect();
            *index = DeviceBuffer::from_vec(permuted, &self.memory)?;
        } else {
            self.keep_rows(order.iter().copied())?;
        }
        info!(dataset = %self.name, seed, examples = self.local_examples, "shuffled");
        self.mark_dirty();
        Ok(())
    }

    fn shard(&mut self, sharding: Sharding, spec: ShardSpec) -> Result<()> {
        if self.sharding != Sharding::None {
            return Err(self.rejected(Error::InvalidOperation(format!(
                "dataset {} is already {} sharded",
                self.name, self.sharding
            ))));
        }
        if sharding == Sharding::None {
            return Ok(());
        }
        let snapshot = self.snapshot()?;
        match sharding {
            Sharding::Data => self.shard_data(spec)?,
            Sharding::Model => self.shard_model(spec)?,
            Sharding::None => {}
        }
        self.sharding = sharding;
        self.unsharded = Some(Box::new(snapshot));
        self.reset_denoising()?;
        self.transposed.clear();
        self.mark_dirty();
        Ok(())
    }

    fn unshard(&mut self) -> Result<()> {
        let Some(snapshot) = self.unsharded.take() else {
            return Ok(());
        };
        let denoising = self.denoising.is_some();
        // Return the shard's reservations before the full contents are allocated
        self.store = Store::empty();
        self.denoising = None;
        self.transposed.clear();
        self.local_examples = 0;
        self.rows = 0;
        let restored = Self::new(&snapshot.descriptor, self.config, Arc::clone(&self.memory))
            .and_then(|mut restored| restored.load_snapshot(&snapshot).map(|()| restored));
        let mut restored = match restored {
            Ok(restored) => restored,
            Err(err) => {
                self.unsharded = Some(snapshot);
                return Err(self.rejected(err));
            }
        };
        restored.name = std::mem::take(&mut self.name);
        restored.streaming = self.streaming;
        *self = restored;
        if denoising {
            self.set_denoising(true)?;
        }
        info!(dataset = %self.name, "unsharded");
        Ok(())
    }

    fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.store.memory_usage() + self.transposed.memory_usage();
        if let Some(denoising) = &self.denoising {
            usage = usage + usage_of(&denoising.random);
        }
        usage
    }

    fn load_input_unit(&self, position: usize, batch: usize, stride: usize, unit: &mut [f32]) -> Result<()> {
        self.check_batch(position, batch)?;
        self.check_unit("input unit", stride, batch, unit.len())?;
        trace!(dataset = %self.name, position, batch, "load input unit");
        self.targets().dispatch(LoadInput {
            position,
            batch,
            unit,
            noise: self.noise(),
        });
        Ok(())
    }

    fn calculate_sparse_z(
        &self,
        position: usize,
        batch: usize,
        stride: usize,
        weight: &[f32],
        unit: &mut [f32],
        beta: f32,
    ) -> Result<()> {
        if !self.attributes.is_sparse() {
            return Err(self.rejected(Error::InvalidOperation(format!(
                "sparse weighted sum on dense dataset {}",
                self.name
            ))));
        }
        self.check_batch(position, batch)?;
        if unit.len() < batch * stride || weight.len() < self.stride * stride {
            return Err(Error::InvalidArgument(format!(
                "sparse weighted sum needs {} unit and {} weight values, got {} and {}",
                batch * stride,
                self.stride * stride,
                unit.len(),
                weight.len()
            )));
        }
        trace!(dataset = %self.name, position, batch, stride, "calculate sparse z");
        self.targets().dispatch(SparseZ {
            position,
            batch,
            stride,
            weight,
            unit,
            beta,
            noise: self.noise(),
        });
        Ok(())
    }

    fn validate_error_function(&self, function: ErrorFunction, activation: Activation) -> Result<()> {
        self.check_loss(function.loss_kind(activation))?;
        if function.is_cross_entropy_family() && !activation.supports_cross_entropy() {
            return Err(self.rejected(Error::UnsupportedActivation {
                function: function.to_string(),
                activation: activation.to_string(),
            }));
        }
        Ok(())
    }

    fn calculate_error(
        &self,
        kind: LossKind,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &[f32],
    ) -> Result<f32> {
        self.check_loss(kind)?;
        self.check_batch(position, batch)?;
        self.check_unit("produced unit", stride, batch, unit.len())?;
        let kind = kind.for_targets(self.variant.layout.is_boolean());
        let error = self.targets().dispatch(ComputeError {
            loss: UnitLoss::new(kind, &self.config),
            ignore_zero: self.variant.ignore_zero,
            position,
            batch,
            unit,
        });
        trace!(dataset = %self.name, %kind, position, batch, error, "calculate error");
        Ok(error)
    }

    fn calculate_output_delta(
        &self,
        function: ErrorFunction,
        activation: Activation,
        position: usize,
        batch: usize,
        stride: usize,
        unit: &[f32],
        delta: &mut [f32],
        params: DeltaParams,
    ) -> Result<()> {
        self.validate_error_function(function, activation)?;
        self.check_batch(position, batch)?;
        self.check_unit("produced unit", stride, batch, unit.len())?;
        self.check_unit("delta", stride, batch, delta.len())?;
        let kind = function
            .loss_kind(activation)
            .for_targets(self.variant.layout.is_boolean());
        let derivative = (!function.is_cross_entropy_family()).then_some((activation, params));
        trace!(dataset = %self.name, %kind, %activation, position, batch, "calculate output delta");
        self.targets().dispatch(ComputeDelta {
            loss: UnitLoss::new(kind, &self.config),
            derivative,
            ignore_zero: self.variant.ignore_zero,
            position,
            batch,
            unit,
            delta,
        });
        Ok(())
    }

    fn calculate_sparse_datapoint_counts(&mut self) -> Result<()> {
        self.sparse_store()?;
        let (totals, maxima) = self.targets().dispatch(CountDatapoints {
            examples: self.local_examples,
        });
        debug!(
            dataset = %self.name,
            features = totals.len(),
            entries = totals.iter().sum::<u64>(),
            "calculated sparse datapoint counts"
        );
        self.transposed.set_counts(DatapointCounts { totals, maxima });
        Ok(())
    }

    fn calculate_sparse_transposed_matrix(&mut self, position: usize, batch: usize) -> Result<()> {
        self.sparse_store()?;
        self.check_batch(position, batch)?;
        if self.dirty || self.transposed.counts().is_none() {
            self.calculate_sparse_datapoint_counts()?;
        }
        if self.dirty || !self.transposed.is_current(batch) {
            let with_values = self.variant.weighted
                || !self.variant.layout.is_boolean()
                || self.denoising.is_some();
            self.transposed.prepare(batch, with_values, &self.memory)?;
            self.dirty = false;
        }

        let targets = self.store.targets(self.variant, self.stride);
        let noise = self.denoising.as_ref().map(|denoising| Noise {
            random: denoising.random.device(),
            probability: self.config.denoising.probability,
            scale: self.config.denoising.keep_scale(),
        });
        let (start, end, index, values) = self.transposed.begin_fill()?;
        let (written, overflowed) = targets.dispatch(FillTransposed {
            position,
            batch,
            noise,
            start,
            end,
            index,
            values,
        });
        if overflowed > 0 {
            self.mark_dirty();
            return Err(self.rejected(Error::OutOfBounds(format!(
                "{overflowed} entries of batch at {position} overflowed the transposed matrix of {}",
                self.name
            ))));
        }
        trace!(dataset = %self.name, position, batch, written, "filled sparse transposed matrix");

        #[cfg(debug_assertions)]
        if let Some(view) = self.transposed.view() {
            debug_assert_eq!(view.total(), written);
            if self.denoising.is_none() {
                let expected: u64 = (position..position + batch)
                    .map(|n| self.device_datapoints(n))
                    .sum();
                debug_assert_eq!(written as u64, expected);
            }
        }
        Ok(())
    }

    fn sparse_transposed(&self) -> Option<TransposedView<'_>> {
        self.transposed.view()
    }

    fn calculate_sparse_transposed_weight_gradient(
        &self,
        alpha: f32,
        beta: f32,
        m: usize,
        n: usize,
        delta: &[f32],
        weight_gradient: &mut [f32],
    ) -> Result<()> {
        let view = self.transposed.view().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "sparse transposed matrix of {} has not been built",
                self.name
            ))
        })?;
        if m > view.features() {
            return Err(Error::InvalidArgument(format!(
                "{m} gradient rows for {} features",
                view.features()
            )));
        }
        let rows = view.index.iter().max().map_or(0, |&row| row as usize + 1);
        if delta.len() < rows * n || weight_gradient.len() < m * n {
            return Err(Error::InvalidArgument(format!(
                "weight gradient needs {} delta and {} gradient values, got {} and {}",
                rows * n,
                m * n,
                delta.len(),
                weight_gradient.len()
            )));
        }
        kernels::transposed_weight_gradient(
            alpha,
            beta,
            m,
            n,
            view.start,
            view.end,
            view.index,
            view.values,
            delta,
            weight_gradient,
        );
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: DataElement> fmt::Debug for NNDataSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NNDataSet")
            .field("name", &self.name)
            .field("data_type", &T::DATA_TYPE)
            .field("attributes", &self.attributes)
            .field("examples", &self.examples)
            .field("local_examples", &self.local_examples)
            .field("stride", &self.stride)
            .field("sharding", &self.sharding)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Layout;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use test_case::test_case;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn dense_f32(width: usize, examples: usize, attributes: Attributes) -> NNDataSet<f32> {
        let descriptor =
            DatasetDescriptor::dense("dense", DataType::Float, width, examples).with_attributes(attributes);
        NNDataSet::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap()
    }

    fn sparse_f32(width: usize, examples: usize, attributes: Attributes) -> NNDataSet<f32> {
        let descriptor = DatasetDescriptor::sparse("sparse", DataType::Float, width, examples, 1.0)
            .with_attributes(attributes);
        NNDataSet::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap()
    }

    /// CSR offsets for rows of column ids
    fn csr(rows: &[Vec<u32>]) -> (Vec<u64>, Vec<u64>, Vec<u32>) {
        let mut start = Vec::new();
        let mut end = Vec::new();
        let mut index = Vec::new();
        for row in rows {
            start.push(index.len() as u64);
            index.extend(row);
            end.push(index.len() as u64);
        }
        (start, end, index)
    }

    #[test]
    fn test_dense_l2_error() {
        let mut dataset = dense_f32(3, 2, Attributes::NONE);
        dataset.load_dense(&[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        let unit = [0.5; 6];
        let error = dataset.calculate_error(LossKind::L2, 0, 2, 3, &unit).unwrap();
        assert!((error - 0.75).abs() < 1e-6);

        let mut delta = [0.0; 6];
        dataset
            .calculate_output_delta(
                ErrorFunction::L2,
                Activation::Linear,
                0,
                2,
                3,
                &unit,
                &mut delta,
                DeltaParams::default(),
            )
            .unwrap();
        assert_eq!(delta, [0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);
    }

    #[test]
    fn test_one_hot_softmax_cross_entropy() {
        let mut dataset = dense_f32(4, 1, Attributes::NONE);
        dataset.load_dense(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        let unit = [0.1, 0.7, 0.1, 0.1];
        let kind = ErrorFunction::CrossEntropy.loss_kind(Activation::SoftMax);
        assert_eq!(kind, LossKind::MultinomialCrossEntropy);
        let error = dataset.calculate_error(kind, 0, 1, 4, &unit).unwrap();
        assert!((error - -(0.7f32.ln())).abs() < 1e-5);

        let mut delta = [0.0; 4];
        dataset
            .calculate_output_delta(
                ErrorFunction::CrossEntropy,
                Activation::SoftMax,
                0,
                1,
                4,
                &unit,
                &mut delta,
                DeltaParams::default(),
            )
            .unwrap();
        let expected = [0.1, -0.3, 0.1, 0.1];
        for (d, e) in delta.iter().zip(expected) {
            assert!((d - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weighted_error_scales() {
        let mut dataset = dense_f32(2, 1, Attributes::WEIGHTED);
        dataset.load_dense(&[1.0, 0.0]).unwrap();
        let unit = [0.0, 0.0];
        assert!((dataset.calculate_error(LossKind::L2, 0, 1, 2, &unit).unwrap() - 0.5).abs() < 1e-6);
        dataset.load_weights(&[3.0]).unwrap();
        assert!((dataset.calculate_error(LossKind::L2, 0, 1, 2, &unit).unwrap() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_sparse_round_trip() {
        let mut dataset = sparse_f32(5, 2, Attributes::NONE);
        dataset
            .load_sparse(&[0, 2], &[2, 3], Some(&[0.5, 0.25, 0.75]), &[4, 1, 3])
            .unwrap();
        assert_eq!(dataset.sparse_datapoints(0).unwrap(), 2);
        assert_eq!(dataset.sparse_start(1).unwrap(), 2);
        assert_eq!(dataset.sparse_end(1).unwrap(), 3);
        assert_eq!(dataset.sparse_index(0, 1).unwrap(), 1);
        assert_eq!(dataset.sparse_data_point(1, 0).unwrap(), 0.75);
        assert!(dataset.sparse_index(1, 1).is_err());

        let mut unit = [9.0; 10];
        dataset.load_input_unit(0, 2, 5, &mut unit).unwrap();
        assert_eq!(unit, [0.0, 0.25, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 0.75, 0.0]);
    }

    #[test]
    fn test_sparse_load_validation() {
        let mut dataset = sparse_f32(3, 1, Attributes::NONE);
        let err = dataset.load_sparse(&[0], &[4], Some(&[1.0; 4]), &[0, 1, 2, 0]).unwrap_err();
        assert!(err.is_bounds());
        let err = dataset.load_sparse(&[0], &[1], Some(&[1.0]), &[3]).unwrap_err();
        assert!(err.is_bounds());
        assert!(dataset.load_sparse(&[0], &[1], None, &[0]).is_err());
        assert!(dataset.load_dense(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_signed_loader_rejects_negatives() {
        let mut dataset = sparse_f32(3, 1, Attributes::BOOLEAN);
        let err = dataset.load_sparse_data_signed(&[-1], &[1], None, &[0]).unwrap_err();
        assert!(matches!(
            err,
            Error::NegativeValue { field: "sparse start", position: 0, value: -1 }
        ));
        let err = dataset.load_sparse_data_signed(&[0], &[1], None, &[-2]).unwrap_err();
        assert!(matches!(err, Error::NegativeValue { field: "sparse index", .. }));
        dataset.load_sparse_data_signed(&[0], &[2], None, &[2, 0]).unwrap();
        assert_eq!(dataset.sparse_index(0, 0).unwrap(), 2);
    }

    #[test]
    fn test_ignore_zero_skips_absent_only() {
        let unit = [0.5, 0.5, 0.5];
        let mut plain = sparse_f32(3, 1, Attributes::NONE);
        let mut ignoring = sparse_f32(3, 1, Attributes::SPARSE_IGNORE_ZERO);
        for dataset in [&mut plain, &mut ignoring] {
            // column 0 stores an explicit zero, column 2 is absent
            dataset.load_sparse(&[0], &[2], Some(&[0.0, 1.0]), &[0, 1]).unwrap();
        }
        let error = plain.calculate_error(LossKind::L2, 0, 1, 3, &unit).unwrap();
        assert!((error - 0.375).abs() < 1e-6);
        let error = ignoring.calculate_error(LossKind::L2, 0, 1, 3, &unit).unwrap();
        assert!((error - 0.25).abs() < 1e-6);

        let mut delta = [9.0; 3];
        ignoring
            .calculate_output_delta(
                ErrorFunction::L2,
                Activation::Linear,
                0,
                1,
                3,
                &unit,
                &mut delta,
                DeltaParams::default(),
            )
            .unwrap();
        assert_eq!(delta, [0.5, -0.5, 0.0]);
    }

    #[test]
    fn test_boolean_multinomial_spreads_targets() {
        let mut dataset = sparse_f32(3, 1, Attributes::BOOLEAN);
        dataset.load_sparse(&[0], &[2], None, &[0, 1]).unwrap();
        let unit = [0.5, 0.5, 0.0];
        let error = dataset
            .calculate_error(LossKind::MultinomialCrossEntropy, 0, 1, 3, &unit)
            .unwrap();
        assert!((error - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_layout_restricted_functions() {
        let sparse = sparse_f32(3, 1, Attributes::NONE);
        let err = sparse.validate_error_function(ErrorFunction::Hinge, Activation::Linear).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout { .. }));
        let err = sparse.calculate_error(LossKind::Hinge, 0, 1, 3, &[0.0; 3]).unwrap_err();
        assert!(err.is_configuration());

        let dense = dense_f32(3, 1, Attributes::NONE);
        let err = dense
            .calculate_error(LossKind::DataScaledMarginalCrossEntropy, 0, 1, 3, &[0.0; 3])
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout { .. }));
        let err = dense
            .validate_error_function(ErrorFunction::CrossEntropy, Activation::Tanh)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedActivation { .. }));
        assert!(dense.validate_error_function(ErrorFunction::Hinge, Activation::Tanh).is_ok());
    }

    #[test]
    fn test_batch_bounds() {
        let dataset = dense_f32(2, 2, Attributes::NONE);
        let mut unit = [0.0; 4];
        assert!(dataset.load_input_unit(1, 2, 2, &mut unit).unwrap_err().is_bounds());
        assert!(dataset.load_input_unit(0, 2, 3, &mut unit).is_err());
        assert!(dataset.load_input_unit(0, 2, 2, &mut unit[..3]).is_err());
    }

    #[test]
    fn test_indexed_materialization() {
        let descriptor = DatasetDescriptor::dense("indexed", DataType::Float, 2, 3)
            .with_attributes(Attributes::INDEXED)
            .with_unique_examples(2);
        let mut dataset =
            NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap();
        dataset.load_dense(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        dataset.load_index(&[1, 0, 1]).unwrap();
        let mut unit = [0.0; 6];
        dataset.load_input_unit(0, 3, 2, &mut unit).unwrap();
        assert_eq!(unit, [3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dataset.data_point(2, 1, 0, 0).unwrap(), 4.0);
        assert!(dataset.load_index(&[2, 0, 1]).unwrap_err().is_bounds());
    }

    #[test]
    fn test_sparse_z() {
        let mut dataset = sparse_f32(2, 2, Attributes::NONE);
        dataset.load_sparse(&[0, 1], &[1, 3], Some(&[2.0, 3.0, 1.0]), &[0, 1, 0]).unwrap();
        let weight = [1.0, 2.0];
        let mut unit = [f32::NAN; 2];
        dataset.calculate_sparse_z(0, 2, 1, &weight, &mut unit, 0.0).unwrap();
        assert_eq!(unit, [2.0, 7.0]);
        dataset.calculate_sparse_z(0, 2, 1, &weight, &mut unit, 1.0).unwrap();
        assert_eq!(unit, [4.0, 14.0]);
    }

    #[test]
    fn test_transposed_matrix_and_gradient() {
        let mut dataset = sparse_f32(2, 2, Attributes::NONE);
        dataset.load_sparse(&[0, 1], &[1, 3], Some(&[2.0, 3.0, 1.0]), &[0, 1, 0]).unwrap();
        assert!(dataset.is_dirty());
        dataset.calculate_sparse_transposed_matrix(0, 2).unwrap();
        assert!(!dataset.is_dirty());

        let view = dataset.sparse_transposed().unwrap();
        assert_eq!(view.total(), 3);
        assert_eq!(view.entries(0).collect::<Vec<_>>(), vec![(0, 2.0), (1, 1.0)]);
        assert_eq!(view.entries(1).collect::<Vec<_>>(), vec![(1, 3.0)]);

        let delta = [1.0, 10.0];
        let mut gradient = [0.0; 2];
        dataset
            .calculate_sparse_transposed_weight_gradient(1.0, 0.0, 2, 1, &delta, &mut gradient)
            .unwrap();
        assert_eq!(gradient, [12.0, 30.0]);

        dataset.set_sparse_index(0, 0, 1).unwrap();
        assert!(dataset.is_dirty());
        assert!(dataset.sparse_transposed().is_none());
    }

    #[test]
    fn test_transposed_batch_change_resizes() {
        let mut dataset = sparse_f32(4, 3, Attributes::BOOLEAN);
        let (start, end, index) = csr(&[vec![0, 2], vec![2], vec![1, 2, 3]]);
        dataset.load_sparse(&start, &end, None, &index).unwrap();

        dataset.calculate_sparse_transposed_matrix(0, 3).unwrap();
        let view = dataset.sparse_transposed().unwrap();
        assert!(view.values.is_none());
        assert_eq!(view.entries(2).map(|(row, _)| row).collect::<Vec<_>>(), vec![0, 1, 2]);

        dataset.calculate_sparse_transposed_matrix(1, 2).unwrap();
        let view = dataset.sparse_transposed().unwrap();
        assert_eq!(view.total(), 4);
        assert_eq!(view.entries(2).map(|(row, _)| row).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_denoising() {
        init_tracing();
        let mut config = DatasetConfig::default();
        config.denoising.probability = 0.5;
        config.denoising.seed = Some(7);

        let descriptor = DatasetDescriptor::dense("dense", DataType::Float, 4, 1);
        let mut dense = NNDataSet::<f32>::new(&descriptor, config, DeviceMemory::unbounded()).unwrap();
        assert!(dense.set_denoising(true).is_err());

        let descriptor = DatasetDescriptor::sparse("sparse", DataType::Float, 64, 4, 0.5);
        let mut dataset = NNDataSet::<f32>::new(&descriptor, config, DeviceMemory::unbounded()).unwrap();
        let rows: Vec<Vec<u32>> = (0..4).map(|_| (0..32).map(|c| c * 2).collect()).collect();
        let (start, end, index) = csr(&rows);
        let values = vec![1.5; index.len()];
        dataset.load_sparse(&start, &end, Some(&values), &index).unwrap();
        assert!(dataset.generate_denoising_data().is_err());
        dataset.set_denoising(true).unwrap();
        dataset.generate_denoising_data().unwrap();

        let mut unit = vec![0.0; 4 * 64];
        dataset.load_input_unit(0, 4, 64, &mut unit).unwrap();
        let kept = unit.iter().filter(|&&u| u != 0.0).count();
        assert!(unit.iter().all(|&u| u == 0.0 || u == 3.0));
        assert!(kept > 0 && kept < 128);

        dataset.calculate_sparse_transposed_matrix(0, 4).unwrap();
        assert_eq!(dataset.sparse_transposed().unwrap().total(), kept);
    }

    #[test]
    fn test_data_shard_and_unshard() {
        init_tracing();
        let mut dataset = sparse_f32(3, 4, Attributes::WEIGHTED);
        let (start, end, index) = csr(&[vec![0], vec![1], vec![2, 0], vec![1]]);
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        dataset.load_sparse(&start, &end, Some(&values), &index).unwrap();
        dataset.load_weights(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let before = dataset.snapshot().unwrap();

        dataset.shard(Sharding::Data, ShardSpec::new(1, 2).unwrap()).unwrap();
        assert_eq!(dataset.local_examples(), 2);
        assert_eq!(dataset.sparse_start(0).unwrap(), 0);
        assert!(dataset.snapshot().is_err());
        assert!(dataset.shard(Sharding::Data, ShardSpec::single()).is_err());

        let mut unit = [0.0; 6];
        dataset.load_input_unit(0, 2, 3, &mut unit).unwrap();
        assert_eq!(unit, [12.0, 0.0, 9.0, 0.0, 20.0, 0.0]);

        dataset.unshard().unwrap();
        assert_eq!(dataset.sharding(), Sharding::None);
        assert_eq!(dataset.snapshot().unwrap(), before);
    }

    #[test]
    fn test_model_shard_dense() {
        let mut dataset = dense_f32(4, 2, Attributes::NONE);
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        dataset.load_dense(&values).unwrap();
        let before = dataset.snapshot().unwrap();

        dataset.shard(Sharding::Model, ShardSpec::new(1, 2).unwrap()).unwrap();
        assert_eq!(dataset.stride(), 2);
        assert_eq!(dataset.feature_range(), 2..4);
        assert_eq!(dataset.data_point(1, 3, 0, 0).unwrap(), 7.0);
        assert!(dataset.data_point(1, 1, 0, 0).unwrap_err().is_bounds());
        let mut unit = [0.0; 4];
        dataset.load_input_unit(0, 2, 2, &mut unit).unwrap();
        assert_eq!(unit, [2.0, 3.0, 6.0, 7.0]);

        dataset.unshard().unwrap();
        assert_eq!(dataset.stride(), 4);
        assert_eq!(dataset.snapshot().unwrap(), before);
    }

    #[test]
    fn test_model_shard_sparse_rebases_columns() {
        let mut dataset = sparse_f32(4, 1, Attributes::BOOLEAN);
        dataset.load_sparse(&[0], &[3], None, &[0, 2, 3]).unwrap();
        dataset.shard(Sharding::Model, ShardSpec::new(1, 2).unwrap()).unwrap();
        assert_eq!(dataset.sparse_datapoints(0).unwrap(), 2);
        assert_eq!(dataset.sparse_index(0, 0).unwrap(), 0);
        assert_eq!(dataset.sparse_index(0, 1).unwrap(), 1);
    }

    #[test]
    fn test_shuffle_permutes_rows() {
        let mut dataset = dense_f32(2, 4, Attributes::WEIGHTED);
        dataset.load_dense(&[0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
        dataset.load_weights(&[0.0, 1.0, 2.0, 3.0]).unwrap();
        dataset.shuffle(11).unwrap();

        let mut rows = Vec::new();
        for n in 0..4 {
            let value = dataset.data_point(n, 0, 0, 0).unwrap();
            assert_eq!(dataset.data_point(n, 1, 0, 0).unwrap(), value);
            rows.push(value as usize);
        }
        let weights = dataset.snapshot().unwrap().weights.unwrap();
        assert_eq!(weights, rows.iter().map(|&r| r as f32).collect::<Vec<_>>());
        rows.sort_unstable();
        assert_eq!(rows, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_memory_budget_exceeded() {
        let descriptor = DatasetDescriptor::dense("big", DataType::Float, 10, 10);
        let err = NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::shared(16))
            .unwrap_err();
        assert!(matches!(err, Error::MemoryBudgetExceeded { .. }));
    }

    #[test]
    fn test_type_mismatch() {
        let descriptor = DatasetDescriptor::dense("ints", DataType::Int, 2, 1);
        let err = NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded())
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn test_memory_usage_tracks_budget() {
        let memory = DeviceMemory::unbounded();
        let descriptor = DatasetDescriptor::sparse("sparse", DataType::Float, 4, 2, 0.5);
        let mut dataset = NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), Arc::clone(&memory)).unwrap();
        dataset.load_sparse(&[0, 1], &[1, 2], Some(&[1.0, 1.0]), &[0, 3]).unwrap();
        dataset.calculate_sparse_transposed_matrix(0, 2).unwrap();
        assert_eq!(dataset.memory_usage().device_bytes, memory.usage());
        drop(dataset);
        assert_eq!(memory.usage(), 0);
    }

    #[test]
    fn test_upload_invalidates_transposed_counts() {
        let mut dataset = sparse_f32(3, 2, Attributes::BOOLEAN);
        dataset.load_sparse(&[0, 1], &[1, 2], None, &[0, 1]).unwrap();
        dataset.calculate_sparse_transposed_matrix(0, 2).unwrap();

        // both examples now touch feature 0
        let (start, end, index) = csr(&[vec![0, 1], vec![0, 2]]);
        dataset.copy_sparse(&start, &end, None, &index).unwrap();
        dataset.calculate_sparse_transposed_matrix(0, 2).unwrap();
        assert_eq!(dataset.sparse_transposed().unwrap().total(), 2);

        dataset.upload();
        assert!(dataset.is_dirty());
        dataset.calculate_sparse_transposed_matrix(0, 2).unwrap();
        let view = dataset.sparse_transposed().unwrap();
        assert_eq!(view.total(), 4);
        assert_eq!(view.entries(0).map(|(row, _)| row).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_i32_loader() {
        let mut dataset = sparse_f32(3, 1, Attributes::NONE);
        let data: &[u8] = bytemuck::cast_slice(&[0.5f32, 0.25]);
        let err = dataset.load_sparse_data_i32(&[0], &[-1], Some(data), &[0]).unwrap_err();
        assert!(matches!(
            err,
            Error::NegativeValue { field: "sparse end", position: 0, value: -1 }
        ));
        let err = dataset.load_sparse_data_i32(&[0], &[2], Some(data), &[1, i32::MIN]).unwrap_err();
        assert!(matches!(err, Error::NegativeValue { field: "sparse index", position: 1, .. }));

        dataset.load_sparse_data_i32(&[0], &[2], Some(data), &[2, 0]).unwrap();
        assert_eq!(dataset.sparse_index(0, 0).unwrap(), 2);
        let mut unit = [0.0; 3];
        dataset.load_input_unit(0, 1, 3, &mut unit).unwrap();
        assert_eq!(unit, [0.25, 0.0, 0.5]);
    }

    fn denoised_input(config: DatasetConfig, redraws: usize) -> Vec<f32> {
        let descriptor = DatasetDescriptor::sparse("noisy", DataType::Float, 32, 2, 1.0);
        let mut dataset = NNDataSet::<f32>::new(&descriptor, config, DeviceMemory::unbounded()).unwrap();
        let rows: Vec<Vec<u32>> = (0..2).map(|_| (0..32).collect()).collect();
        let (start, end, index) = csr(&rows);
        dataset.load_sparse(&start, &end, Some(&vec![1.0; index.len()]), &index).unwrap();
        dataset.set_denoising(true).unwrap();
        for _ in 0..redraws {
            dataset.generate_denoising_data().unwrap();
        }
        let mut unit = vec![0.0; 64];
        dataset.load_input_unit(0, 2, 32, &mut unit).unwrap();
        unit
    }

    #[test]
    fn test_set_config_redraws_denoising_mask() {
        let mut config = DatasetConfig::default();
        config.denoising.probability = 0.5;
        config.denoising.seed = Some(3);

        let descriptor = DatasetDescriptor::sparse("noisy", DataType::Float, 32, 2, 1.0);
        let mut dataset = NNDataSet::<f32>::new(&descriptor, config, DeviceMemory::unbounded()).unwrap();
        let rows: Vec<Vec<u32>> = (0..2).map(|_| (0..32).collect()).collect();
        let (start, end, index) = csr(&rows);
        dataset.load_sparse(&start, &end, Some(&vec![1.0; index.len()]), &index).unwrap();
        dataset.set_denoising(true).unwrap();
        let mut unit = vec![0.0; 64];

        config.denoising.seed = Some(99);
        dataset.set_config(config).unwrap();
        dataset.load_input_unit(0, 2, 32, &mut unit).unwrap();
        assert_eq!(unit, denoised_input(config, 0));

        config.denoising.probability = 0.25;
        dataset.set_config(config).unwrap();
        dataset.load_input_unit(0, 2, 32, &mut unit).unwrap();
        assert_eq!(unit, denoised_input(config, 1));
        assert!(unit.iter().all(|&u| u == 0.0 || (u - 4.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_unshard_releases_shard_before_restoring() {
        init_tracing();
        let memory = DeviceMemory::shared(100);
        let descriptor = DatasetDescriptor::dense("indexed", DataType::Float, 4, 4)
            .with_attributes(Attributes::INDEXED)
            .with_unique_examples(4);
        let mut dataset = NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), Arc::clone(&memory)).unwrap();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        dataset.load_dense(&values).unwrap();
        dataset.load_index(&[3, 2, 1, 0]).unwrap();
        let before = dataset.snapshot().unwrap();
        assert_eq!(memory.usage(), 80);

        dataset.shard(Sharding::Data, ShardSpec::new(1, 2).unwrap()).unwrap();
        assert_eq!(memory.usage(), 72);

        // one byte short of a full copy once the shard is released
        memory.allocate(21).unwrap();
        let err = dataset.unshard().unwrap_err();
        assert!(matches!(err, Error::MemoryBudgetExceeded { .. }));
        assert_eq!(dataset.sharding(), Sharding::Data);
        assert_eq!(dataset.local_examples(), 0);
        assert_eq!(memory.usage(), 21);

        // 72 bytes of shard plus 80 restored would not fit
        memory.release(21);
        dataset.unshard().unwrap();
        assert_eq!(dataset.sharding(), Sharding::None);
        assert_eq!(dataset.snapshot().unwrap(), before);
        assert_eq!(memory.usage(), 80);
    }

    /// Payload rows for the loss matrix, `(column, value)` pairs
    ///
    /// Row A stores an explicit zero at column 2.
    const ROW_A: [(u32, f32); 2] = [(0, 0.8), (2, 0.0)];
    const ROW_B: [(u32, f32); 2] = [(1, 0.6), (3, 0.3)];
    const MATRIX_WEIGHTS: [f32; 3] = [0.5, 2.0, 1.5];

    fn matrix_rows(indexed: bool) -> Vec<[(u32, f32); 2]> {
        if indexed {
            vec![ROW_A, ROW_B]
        } else {
            vec![ROW_B, ROW_A, ROW_B]
        }
    }

    /// Examples 0..3 resolve to rows B, A, B in every layout
    fn matrix_dataset(layout: Layout, weighted: bool, ignore_zero: bool) -> NNDataSet<f32> {
        let mut attributes = Attributes::NONE;
        attributes.set(Attributes::INDEXED, layout.is_indexed());
        attributes.set(Attributes::BOOLEAN, layout.is_boolean());
        attributes.set(Attributes::WEIGHTED, weighted);
        attributes.set(Attributes::SPARSE_IGNORE_ZERO, ignore_zero);
        let descriptor = if layout.is_sparse() {
            DatasetDescriptor::sparse("matrix", DataType::Float, 4, 3, 1.0)
        } else {
            DatasetDescriptor::dense("matrix", DataType::Float, 4, 3)
        };
        let mut descriptor = descriptor.with_attributes(attributes);
        if layout.is_indexed() {
            descriptor = descriptor.with_unique_examples(2);
        }
        let mut dataset =
            NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap();
        assert_eq!(dataset.variant().layout, layout);

        let rows = matrix_rows(layout.is_indexed());
        if layout.is_sparse() {
            let (start, end, index) = csr(&rows
                .iter()
                .map(|row| row.iter().map(|&(column, _)| column).collect())
                .collect::<Vec<Vec<u32>>>());
            let data: Vec<f32> = rows.iter().flatten().map(|&(_, value)| value).collect();
            let data = (!layout.is_boolean()).then_some(data.as_slice());
            dataset.load_sparse(&start, &end, data, &index).unwrap();
        } else {
            let mut dense = vec![0.0; rows.len() * 4];
            for (r, row) in rows.iter().enumerate() {
                for &(column, value) in row {
                    dense[r * 4 + column as usize] = value;
                }
            }
            dataset.load_dense(&dense).unwrap();
        }
        if layout.is_indexed() {
            dataset.load_index(&[1, 0, 1]).unwrap();
        }
        if weighted {
            dataset.load_weights(&MATRIX_WEIGHTS).unwrap();
        }
        dataset
    }

    fn matrix_unit() -> Vec<f32> {
        (0..3)
            .flat_map(|n| (0..4).map(move |j| 0.15 + 0.2 * j as f32 + 0.05 * n as f32))
            .collect()
    }

    /// Error and delta recomputed unit by unit from the cost formulas
    fn matrix_reference(
        layout: Layout,
        weighted: bool,
        ignore_zero: bool,
        function: ErrorFunction,
        activation: Activation,
        unit: &[f32],
    ) -> (f32, Vec<f32>) {
        let kind = function.loss_kind(activation).for_targets(layout.is_boolean());
        let loss = UnitLoss::new(kind, &DatasetConfig::default());
        let params = DeltaParams::default();
        let seed = |a: f32, gradient: f32, w: f32| {
            if function.is_cross_entropy_family() {
                w * gradient
            } else {
                w * gradient * activation.derivative(a, &params)
            }
        };
        let examples = [ROW_B, ROW_A, ROW_B];
        let mut error = 0.0f64;
        let mut delta = vec![0.0; unit.len()];
        for (n, row) in examples.iter().enumerate() {
            let w = if weighted { MATRIX_WEIGHTS[n] } else { 1.0 };
            let produced = &unit[n * 4..(n + 1) * 4];
            let out = &mut delta[n * 4..(n + 1) * 4];
            let target = |column: usize| {
                row.iter().find(|&&(c, _)| c as usize == column).map(|&(_, value)| {
                    if !layout.is_boolean() {
                        value
                    } else if kind.normalizes_boolean_targets() {
                        1.0 / row.len() as f32
                    } else {
                        1.0
                    }
                })
            };
            let mut e = 0.0f64;
            for (j, &a) in produced.iter().enumerate() {
                let (cost, gradient) = match (layout.is_sparse(), target(j)) {
                    (false, t) => {
                        let t = t.unwrap_or(0.0);
                        (loss.present(a, t), loss.present_gradient(a, t))
                    }
                    (true, Some(t)) => (loss.present(a, t), loss.present_gradient(a, t)),
                    (true, None) if ignore_zero => (0.0, 0.0),
                    (true, None) => (loss.absent(a), loss.absent_gradient(a)),
                };
                e += f64::from(cost);
                out[j] = seed(a, gradient, w);
            }
            error += f64::from(w) * e;
        }
        (error as f32, delta)
    }

    fn close(actual: f32, expected: f32) -> bool {
        (actual - expected).abs() <= 1e-4 * expected.abs().max(1.0)
    }

    #[test_case(Layout::Dense, false, false)]
    #[test_case(Layout::Dense, true, false)]
    #[test_case(Layout::IndexedDense, false, false)]
    #[test_case(Layout::IndexedDense, true, false)]
    #[test_case(Layout::SparseAnalog, false, false)]
    #[test_case(Layout::SparseAnalog, true, false)]
    #[test_case(Layout::SparseAnalog, false, true)]
    #[test_case(Layout::SparseAnalog, true, true)]
    #[test_case(Layout::IndexedSparseAnalog, false, false)]
    #[test_case(Layout::IndexedSparseAnalog, true, false)]
    #[test_case(Layout::IndexedSparseAnalog, false, true)]
    #[test_case(Layout::IndexedSparseAnalog, true, true)]
    #[test_case(Layout::SparseBoolean, false, false)]
    #[test_case(Layout::SparseBoolean, true, false)]
    #[test_case(Layout::SparseBoolean, false, true)]
    #[test_case(Layout::SparseBoolean, true, true)]
    #[test_case(Layout::IndexedSparseBoolean, false, false)]
    #[test_case(Layout::IndexedSparseBoolean, true, false)]
    #[test_case(Layout::IndexedSparseBoolean, false, true)]
    #[test_case(Layout::IndexedSparseBoolean, true, true)]
    fn test_loss_matches_unit_formulas(layout: Layout, weighted: bool, ignore_zero: bool) {
        let dataset = matrix_dataset(layout, weighted, ignore_zero);
        let unit = matrix_unit();
        let functions = [
            (ErrorFunction::L1, Activation::Sigmoid),
            (ErrorFunction::L2, Activation::Sigmoid),
            (ErrorFunction::L2Hinge, Activation::Sigmoid),
            (ErrorFunction::CrossEntropy, Activation::Sigmoid),
            (ErrorFunction::CrossEntropy, Activation::SoftMax),
            (ErrorFunction::ScaledMarginalCrossEntropy, Activation::Sigmoid),
            (ErrorFunction::ScaledMarginalCrossEntropy, Activation::SoftMax),
            (ErrorFunction::DataScaledMarginalCrossEntropy, Activation::Sigmoid),
            (ErrorFunction::Hinge, Activation::Linear),
        ];
        for (function, activation) in functions {
            let kind = function.loss_kind(activation);
            let mut delta = vec![f32::NAN; unit.len()];
            let produced = dataset.calculate_error(kind, 0, 3, 4, &unit);
            let delta_result = dataset.calculate_output_delta(
                function,
                activation,
                0,
                3,
                4,
                &unit,
                &mut delta,
                DeltaParams::default(),
            );
            if (kind.dense_only() && layout.is_sparse()) || (kind.sparse_only() && !layout.is_sparse()) {
                assert!(matches!(produced, Err(Error::UnsupportedLayout { .. })), "{kind} on {layout}");
                assert!(matches!(delta_result, Err(Error::UnsupportedLayout { .. })), "{kind} on {layout}");
                continue;
            }
            let error = produced.unwrap();
            delta_result.unwrap();
            let (expected_error, expected_delta) =
                matrix_reference(layout, weighted, ignore_zero, function, activation, &unit);
            assert!(close(error, expected_error), "{kind} on {layout}: {error} != {expected_error}");
            for (j, (&d, &e)) in delta.iter().zip(&expected_delta).enumerate() {
                assert!(close(d, e), "{kind} on {layout} unit {j}: {d} != {e}");
            }
        }
    }

    #[test_case(LossKind::L1, ErrorFunction::L1)]
    #[test_case(LossKind::L2, ErrorFunction::L2)]
    #[test_case(LossKind::CrossEntropy, ErrorFunction::CrossEntropy)]
    #[test_case(LossKind::ScaledMarginalCrossEntropy, ErrorFunction::ScaledMarginalCrossEntropy)]
    fn test_explicit_zero_matches_absent(kind: LossKind, function: ErrorFunction) {
        let unit = [0.3, 0.7, 0.55];
        let mut explicit = sparse_f32(3, 1, Attributes::NONE);
        explicit.load_sparse(&[0], &[2], Some(&[0.9, 0.0]), &[0, 2]).unwrap();
        let mut absent = sparse_f32(3, 1, Attributes::NONE);
        absent.load_sparse(&[0], &[1], Some(&[0.9]), &[0]).unwrap();

        let with_zero = explicit.calculate_error(kind, 0, 1, 3, &unit).unwrap();
        let without = absent.calculate_error(kind, 0, 1, 3, &unit).unwrap();
        assert!(close(with_zero, without), "{with_zero} != {without}");

        let mut deltas = [[0.0; 3]; 2];
        for (dataset, delta) in [&explicit, &absent].into_iter().zip(deltas.iter_mut()) {
            dataset
                .calculate_output_delta(
                    function,
                    Activation::Sigmoid,
                    0,
                    1,
                    3,
                    &unit,
                    delta,
                    DeltaParams::default(),
                )
                .unwrap();
        }
        for (a, b) in deltas[0].iter().zip(&deltas[1]) {
            assert!(close(*a, *b), "{a} != {b}");
        }
    }

    #[test]
    fn test_indexed_weighted_transposed_matrix() {
        let mut dataset = matrix_dataset(Layout::IndexedSparseAnalog, true, false);
        dataset.calculate_sparse_transposed_matrix(0, 3).unwrap();
        let view = dataset.sparse_transposed().unwrap();
        assert_eq!(view.total(), 6);
        let [w0, w1, w2] = MATRIX_WEIGHTS;
        assert_eq!(view.entries(0).collect::<Vec<_>>(), vec![(1, w1 * 0.8)]);
        assert_eq!(view.entries(1).collect::<Vec<_>>(), vec![(0, w0 * 0.6), (2, w2 * 0.6)]);
        assert_eq!(view.entries(2).collect::<Vec<_>>(), vec![(1, 0.0)]);
        assert_eq!(view.entries(3).collect::<Vec<_>>(), vec![(0, w0 * 0.3), (2, w2 * 0.3)]);

        let delta = [1.0, 10.0, 100.0];
        let mut gradient = [0.0; 4];
        dataset
            .calculate_sparse_transposed_weight_gradient(1.0, 0.0, 4, 1, &delta, &mut gradient)
            .unwrap();
        let expected = [
            w1 * 0.8 * 10.0,
            w0 * 0.6 + w2 * 0.6 * 100.0,
            0.0,
            w0 * 0.3 + w2 * 0.3 * 100.0,
        ];
        for (g, e) in gradient.iter().zip(expected) {
            assert!(close(*g, e), "{g} != {e}");
        }
    }

    proptest! {
        #[test]
        fn prop_transposition_preserves_entries(
            rows in prop::collection::vec(prop::collection::btree_set(0u32..8, 0..8), 1..12)
        ) {
            let rows: Vec<Vec<u32>> = rows.into_iter().map(|row: BTreeSet<u32>| row.into_iter().collect()).collect();
            let descriptor = DatasetDescriptor::sparse("prop", DataType::Float, 8, rows.len(), 1.0)
                .with_attributes(Attributes::BOOLEAN);
            let mut dataset =
                NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap();
            let (start, end, index) = csr(&rows);
            dataset.load_sparse(&start, &end, None, &index).unwrap();
            dataset.calculate_sparse_transposed_matrix(0, rows.len()).unwrap();

            let view = dataset.sparse_transposed().unwrap();
            prop_assert_eq!(view.total(), index.len());
            let mut pairs = BTreeSet::new();
            for feature in 0..view.features() {
                for (row, value) in view.entries(feature) {
                    prop_assert_eq!(value, 1.0);
                    prop_assert!(pairs.insert((row as usize, feature as u32)));
                }
            }
            let expected: BTreeSet<(usize, u32)> = rows
                .iter()
                .enumerate()
                .flat_map(|(r, row)| row.iter().map(move |&c| (r, c)))
                .collect();
            prop_assert_eq!(pairs, expected);
        }

        #[test]
        fn prop_shard_unshard_restores(
            rows in prop::collection::vec(prop::collection::btree_set(0u32..6, 0..6), 1..10),
            workers in 1usize..4,
            model in any::<bool>(),
        ) {
            let rows: Vec<Vec<u32>> = rows.into_iter().map(|row: BTreeSet<u32>| row.into_iter().collect()).collect();
            let descriptor = DatasetDescriptor::sparse("prop", DataType::Float, 6, rows.len(), 1.0)
                .with_attributes(Attributes::WEIGHTED);
            let mut dataset =
                NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap();
            let (start, end, index) = csr(&rows);
            let values: Vec<f32> = (0..index.len()).map(|v| v as f32 + 0.5).collect();
            dataset.load_sparse(&start, &end, Some(&values), &index).unwrap();
            let before = dataset.snapshot().unwrap();

            let sharding = if model { Sharding::Model } else { Sharding::Data };
            let mut held = 0;
            for rank in 0..workers {
                let mut shard = NNDataSet::<f32>::new(&descriptor, DatasetConfig::default(), DeviceMemory::unbounded()).unwrap();
                shard.load_snapshot(&before).unwrap();
                shard.shard(sharding, ShardSpec::new(rank, workers).unwrap()).unwrap();
                held += (0..shard.local_examples()).map(|n| shard.sparse_datapoints(n).unwrap()).sum::<u64>();
                shard.unshard().unwrap();
                prop_assert_eq!(shard.snapshot().unwrap(), before.clone());
            }
            prop_assert_eq!(held as usize, index.len());
        }
    }
}
