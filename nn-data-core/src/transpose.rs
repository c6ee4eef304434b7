//! Column-major copy of a sparse batch for backpropagation
//!
//! The layout is sized once per (dataset state, batch size) from per-feature
//! datapoint counts: feature `f` gets `min(total[f], batch * max[f])` slots,
//! where `max[f]` is the most entries any single example holds for `f`. Each
//! call then resets the append cursors and refills the slots for the
//! requested batch.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::memory::{DeviceMemory, MemoryUsage};

/// Per-feature datapoint counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointCounts {
    /// Entries per feature over all local examples
    pub totals: Vec<u64>,
    /// Most entries a single example holds per feature
    pub maxima: Vec<u32>,
}

#[derive(Debug)]
struct TransposedMatrix {
    start: DeviceBuffer<u32>,
    end: DeviceBuffer<u32>,
    index: DeviceBuffer<u32>,
    values: Option<DeviceBuffer<f32>>,
}

impl TransposedMatrix {
    fn resize(&mut self, start: &[u32], slots: usize) -> Result<()> {
        self.start.copy_from_host(start)?;
        self.start.upload();
        self.end.copy_from_host(start)?;
        self.end.upload();
        self.index.resize(slots)?;
        if let Some(values) = &mut self.values {
            values.resize(slots)?;
        }
        Ok(())
    }
}

/// Cached transposed structure of a sparse dataset
#[derive(Debug, Default)]
pub struct SparseTransposed {
    counts: Option<DatapointCounts>,
    matrix: Option<TransposedMatrix>,
    batch: Option<usize>,
}

/// Read-only view of the last built transposition
#[derive(Debug, Clone, Copy)]
pub struct TransposedView<'a> {
    /// First slot of each feature
    pub start: &'a [u32],
    /// One past the last filled slot of each feature
    pub end: &'a [u32],
    /// Batch-relative row of each slot
    pub index: &'a [u32],
    /// Value of each slot, absent for unweighted boolean data
    pub values: Option<&'a [f32]>,
}

impl TransposedView<'_> {
    /// Number of features
    pub fn features(&self) -> usize {
        self.start.len()
    }

    /// Number of filled slots for `feature`
    pub fn feature_len(&self, feature: usize) -> usize {
        (self.end[feature] - self.start[feature]) as usize
    }

    /// Filled slots across all features
    pub fn total(&self) -> usize {
        (0..self.features()).map(|f| self.feature_len(f)).sum()
    }

    /// `(row, value)` pairs of `feature`, value 1 when no values are stored
    pub fn entries(&self, feature: usize) -> impl Iterator<Item = (u32, f32)> + '_ {
        let range = self.start[feature] as usize..self.end[feature] as usize;
        range.map(move |slot| {
            let value = self.values.map_or(1.0, |values| values[slot]);
            (self.index[slot], value)
        })
    }
}

impl SparseTransposed {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a matrix for `batch` can be refilled without resizing
    pub fn is_current(&self, batch: usize) -> bool {
        self.matrix.is_some() && self.batch == Some(batch)
    }

    /// Last computed counts
    pub fn counts(&self) -> Option<&DatapointCounts> {
        self.counts.as_ref()
    }

    /// Store fresh counts, dropping any built matrix
    pub fn set_counts(&mut self, counts: DatapointCounts) {
        self.counts = Some(counts);
        self.invalidate();
    }

    /// Forget the built matrix so the next request rebuilds it
    pub fn invalidate(&mut self) {
        self.matrix = None;
        self.batch = None;
    }

    /// Forget everything, including counts
    pub fn clear(&mut self) {
        self.counts = None;
        self.invalidate();
    }

    /// Size the slot layout for `batch`
    pub fn prepare(&mut self, batch: usize, with_values: bool, memory: &Arc<DeviceMemory>) -> Result<()> {
        let counts = self.counts.as_ref().ok_or_else(|| {
            Error::InvalidOperation("datapoint counts have not been calculated".into())
        })?;

        let mut start = Vec::with_capacity(counts.totals.len());
        let mut offset = 0u64;
        for (&total, &max) in counts.totals.iter().zip(&counts.maxima) {
            start.push(u32::try_from(offset).map_err(|_| transposed_overflow(offset))?);
            offset += total.min(batch as u64 * u64::from(max));
        }
        let slots = u32::try_from(offset).map_err(|_| transposed_overflow(offset))? as usize;
        let features = start.len();

        if let Some(matrix) = self.matrix.as_mut().filter(|matrix| {
            matrix.start.len() == features && matrix.values.is_some() == with_values
        }) {
            // Same features, only the batch changed
            self.batch = None;
            if let Err(err) = matrix.resize(&start, slots) {
                self.invalidate();
                return Err(err);
            }
        } else {
            // Drop the old matrix first so its reservation is returned before the new one is taken
            self.invalidate();
            let end = DeviceBuffer::from_vec(start.clone(), memory)?;
            let start = DeviceBuffer::from_vec(start, memory)?;
            let index = DeviceBuffer::new(slots, memory)?;
            let values = if with_values {
                Some(DeviceBuffer::new(slots, memory)?)
            } else {
                None
            };
            self.matrix = Some(TransposedMatrix { start, end, index, values });
        }
        debug!(batch, slots, features, with_values, "sized sparse transposed matrix");
        self.batch = Some(batch);
        Ok(())
    }

    /// Reset the append cursors and hand out the slot buffers for filling
    pub(crate) fn begin_fill(&mut self) -> Result<(&[u32], &mut [u32], &mut [u32], Option<&mut [f32]>)> {
        let matrix = self.matrix.as_mut().ok_or_else(|| {
            Error::InvalidOperation("sparse transposed matrix has not been sized".into())
        })?;
        let TransposedMatrix { start, end, index, values } = matrix;
        end.device_mut().copy_from_slice(start.device());
        Ok((
            start.device(),
            end.device_mut(),
            index.device_mut(),
            values.as_mut().map(DeviceBuffer::device_mut),
        ))
    }

    /// View of the built matrix
    pub fn view(&self) -> Option<TransposedView<'_>> {
        self.matrix.as_ref().map(|matrix| TransposedView {
            start: matrix.start.device(),
            end: matrix.end.device(),
            index: matrix.index.device(),
            values: matrix.values.as_ref().map(DeviceBuffer::device),
        })
    }

    /// Footprint of the built matrix
    pub fn memory_usage(&self) -> MemoryUsage {
        let Some(matrix) = &self.matrix else {
            return MemoryUsage::default();
        };
        let mut usage = MemoryUsage {
            host_bytes: matrix.start.host_size() + matrix.end.host_size() + matrix.index.host_size(),
            device_bytes: matrix.start.device_size() + matrix.end.device_size() + matrix.index.device_size(),
        };
        if let Some(values) = &matrix.values {
            usage.host_bytes += values.host_size();
            usage.device_bytes += values.device_size();
        }
        usage
    }
}

fn transposed_overflow(slots: u64) -> Error {
    Error::OutOfBounds(format!("{slots} transposed slots exceed 32-bit offsets"))
}
