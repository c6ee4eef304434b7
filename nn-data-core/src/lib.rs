//! Datasets for neural network training
//!
//! This crate stores the input and target columns of a training run and
//! implements the per-batch work the network asks of them:
//!
//! - materializing a batch into an input unit buffer, optionally with
//!   denoising dropout
//! - the sparse weighted sum of an input layer
//! - error and output delta against produced activations for the L1, L2,
//!   L2 hinge, hinge and cross-entropy families
//! - the transposed sparse matrix and weight gradient for backpropagation
//! - data and model sharding across workers
//!
//! Datasets are created from a [`DatasetDescriptor`] by [`create_dataset`]
//! and driven through the [`DataSet`] trait. Storage layout, example
//! indexing and weighting are resolved once from the descriptor's
//! [`Attributes`], so every step runs a loop specialized for the dataset.
//!
//! ```
//! use nn_data_core::{create_dataset, DataType, DatasetDescriptor, LossKind};
//!
//! let mut targets = create_dataset(&DatasetDescriptor::dense("labels", DataType::Float, 2, 1))?;
//! targets.load_dense_data(bytemuck::cast_slice(&[1.0f32, 0.0]))?;
//! let error = targets.calculate_error(LossKind::L2, 0, 1, 2, &[0.5, 0.5])?;
//! assert_eq!(error, 0.25);
//! # Ok::<(), nn_data_core::Error>(())
//! ```

#![warn(missing_docs)]

pub mod activation;
pub mod buffer;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod factory;
mod kernels;
pub mod loss;
pub mod memory;
pub mod schema;
pub mod shard;
pub mod transpose;

pub use activation::{Activation, DeltaParams};
pub use buffer::DeviceBuffer;
pub use config::{ClampConfig, DatasetConfig, DenoisingConfig, MarginalConfig};
pub use dataset::{DataSet, DatasetSnapshot, NNDataSet, SparseSnapshot};
pub use dispatch::{Layout, Variant};
pub use element::DataElement;
pub use error::{Error, Result};
pub use factory::{create_dataset, create_dataset_with, restore_dataset, DatasetRegistry};
pub use loss::{ErrorFunction, LossKind, UnitLoss};
pub use memory::{DeviceMemory, DeviceMemoryStats, MemoryUsage};
pub use schema::{Attributes, DataType, DatasetDescriptor, Dimensions};
pub use shard::{shard_range, ShardSpec, Sharding};
pub use transpose::{DatapointCounts, SparseTransposed, TransposedView};
