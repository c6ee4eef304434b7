//! Attribute-driven routing of per-example work
//!
//! A dataset's attributes are reduced once, at construction, to a [`Variant`]:
//! one of six storage [`Layout`]s plus the weighted and ignore-zero flags.
//! Each step then resolves the variant with a single match in
//! `Targets::dispatch`, which hands a concrete, fully monomorphized row
//! source to a `RowsVisitor`. The kernels are written once, generic over
//! `Rows`, and never test attribute bits themselves.

use std::fmt;

use crate::element::DataElement;
use crate::schema::Attributes;

/// Storage layout of a dataset's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Dense rows addressed by example
    Dense,
    /// Dense rows addressed through the example index
    IndexedDense,
    /// Sparse rows of column ids only
    SparseBoolean,
    /// Sparse rows of column ids, addressed through the example index
    IndexedSparseBoolean,
    /// Sparse rows of column ids and values
    SparseAnalog,
    /// Sparse rows of column ids and values, addressed through the example index
    IndexedSparseAnalog,
}

impl Layout {
    /// Whether rows store only nonzero entries
    pub fn is_sparse(self) -> bool {
        !matches!(self, Layout::Dense | Layout::IndexedDense)
    }

    /// Whether stored entries carry no values
    pub fn is_boolean(self) -> bool {
        matches!(self, Layout::SparseBoolean | Layout::IndexedSparseBoolean)
    }

    /// Whether examples map through an index
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            Layout::IndexedDense | Layout::IndexedSparseBoolean | Layout::IndexedSparseAnalog
        )
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layout::Dense => "dense",
            Layout::IndexedDense => "indexed dense",
            Layout::SparseBoolean => "sparse boolean",
            Layout::IndexedSparseBoolean => "indexed sparse boolean",
            Layout::SparseAnalog => "sparse analog",
            Layout::IndexedSparseAnalog => "indexed sparse analog",
        })
    }
}

/// Resolved dispatch key of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variant {
    /// Storage layout
    pub layout: Layout,
    /// Per-example weights apply
    pub weighted: bool,
    /// Absent sparse entries are skipped by error and delta
    pub ignore_zero: bool,
}

impl Variant {
    /// Reduce validated attributes to a variant
    pub fn from_attributes(attributes: Attributes) -> Self {
        let layout = match (
            attributes.is_sparse(),
            attributes.is_boolean(),
            attributes.is_indexed(),
        ) {
            (false, _, false) => Layout::Dense,
            (false, _, true) => Layout::IndexedDense,
            (true, true, false) => Layout::SparseBoolean,
            (true, true, true) => Layout::IndexedSparseBoolean,
            (true, false, false) => Layout::SparseAnalog,
            (true, false, true) => Layout::IndexedSparseAnalog,
        };
        Self {
            layout,
            weighted: attributes.is_weighted(),
            ignore_zero: attributes.is_sparse() && attributes.ignores_zero(),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.layout)?;
        if self.weighted {
            f.write_str(" weighted")?;
        }
        if self.ignore_zero {
            f.write_str(" ignore-zero")?;
        }
        Ok(())
    }
}

/// Maps an example id to the payload row holding it
pub(crate) trait RowMap: Copy + Send + Sync {
    fn row(&self, example: usize) -> usize;
}

#[derive(Clone, Copy)]
pub(crate) struct Direct;

impl RowMap for Direct {
    #[inline]
    fn row(&self, example: usize) -> usize {
        example
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Indexed<'a>(&'a [u32]);

impl RowMap for Indexed<'_> {
    #[inline]
    fn row(&self, example: usize) -> usize {
        self.0[example] as usize
    }
}

pub(crate) trait ExampleWeight: Copy + Send + Sync {
    fn weight(&self, example: usize) -> f32;
}

#[derive(Clone, Copy)]
pub(crate) struct Unweighted;

impl ExampleWeight for Unweighted {
    #[inline]
    fn weight(&self, _example: usize) -> f32 {
        1.0
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Weighted<'a>(&'a [f32]);

impl ExampleWeight for Weighted<'_> {
    #[inline]
    fn weight(&self, example: usize) -> f32 {
        self.0[example]
    }
}

pub(crate) trait SparseValues: Copy + Send + Sync {
    const BOOLEAN: bool;

    fn value(&self, entry: usize) -> f32;
}

#[derive(Clone, Copy)]
pub(crate) struct Presence;

impl SparseValues for Presence {
    const BOOLEAN: bool = true;

    #[inline]
    fn value(&self, _entry: usize) -> f32 {
        1.0
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Analog<'a, T>(&'a [T]);

impl<T: DataElement> SparseValues for Analog<'_, T> {
    const BOOLEAN: bool = false;

    #[inline]
    fn value(&self, entry: usize) -> f32 {
        self.0[entry].to_unit()
    }
}

/// Uniform view of a dataset's per-example targets
pub(crate) trait Rows: Sync {
    /// Rows store only nonzero entries
    const SPARSE: bool;
    /// Stored entries carry no values
    const BOOLEAN: bool;

    /// Columns per example
    fn stride(&self) -> usize;

    /// Weight of `example`
    fn weight(&self, example: usize) -> f32;

    /// Number of stored entries of `example`
    fn entry_count(&self, example: usize) -> usize;

    /// Calls `f(column, entry, value)` for each stored entry of `example`
    fn for_each<F: FnMut(usize, usize, f32)>(&self, example: usize, f: F);
}

pub(crate) struct DenseRows<'a, T, M, W> {
    data: &'a [T],
    stride: usize,
    map: M,
    weights: W,
}

impl<T: DataElement, M: RowMap, W: ExampleWeight> Rows for DenseRows<'_, T, M, W> {
    const SPARSE: bool = false;
    const BOOLEAN: bool = false;

    fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    fn weight(&self, example: usize) -> f32 {
        self.weights.weight(example)
    }

    #[inline]
    fn entry_count(&self, _example: usize) -> usize {
        self.stride
    }

    #[inline]
    fn for_each<F: FnMut(usize, usize, f32)>(&self, example: usize, mut f: F) {
        let base = self.map.row(example) * self.stride;
        for (column, value) in self.data[base..base + self.stride].iter().enumerate() {
            f(column, base + column, value.to_unit());
        }
    }
}

pub(crate) struct SparseRows<'a, M, V, W> {
    start: &'a [u64],
    end: &'a [u64],
    index: &'a [u32],
    values: V,
    stride: usize,
    map: M,
    weights: W,
}

impl<M: RowMap, V: SparseValues, W: ExampleWeight> Rows for SparseRows<'_, M, V, W> {
    const SPARSE: bool = true;
    const BOOLEAN: bool = V::BOOLEAN;

    fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    fn weight(&self, example: usize) -> f32 {
        self.weights.weight(example)
    }

    #[inline]
    fn entry_count(&self, example: usize) -> usize {
        let row = self.map.row(example);
        (self.end[row] - self.start[row]) as usize
    }

    #[inline]
    fn for_each<F: FnMut(usize, usize, f32)>(&self, example: usize, mut f: F) {
        let row = self.map.row(example);
        for entry in self.start[row] as usize..self.end[row] as usize {
            f(self.index[entry] as usize, entry, self.values.value(entry));
        }
    }
}

/// Operation run against whichever row source the variant selects
pub(crate) trait RowsVisitor {
    type Output;

    fn visit<R: Rows>(self, rows: &R) -> Self::Output;
}

/// Device-side slices of a dataset's payload
pub(crate) struct Targets<'a, T> {
    pub variant: Variant,
    pub stride: usize,
    pub dense: &'a [T],
    pub sparse_start: &'a [u64],
    pub sparse_end: &'a [u64],
    pub sparse_index: &'a [u32],
    pub sparse_data: &'a [T],
    pub index: &'a [u32],
    pub weights: &'a [f32],
}

impl<T: DataElement> Targets<'_, T> {
    /// Run `visitor` against the row source for this variant
    pub fn dispatch<V: RowsVisitor>(&self, visitor: V) -> V::Output {
        if self.variant.weighted {
            self.with_weights(Weighted(self.weights), visitor)
        } else {
            self.with_weights(Unweighted, visitor)
        }
    }

    fn with_weights<W: ExampleWeight, V: RowsVisitor>(&self, weights: W, visitor: V) -> V::Output {
        match self.variant.layout {
            Layout::Dense => visitor.visit(&self.dense_rows(Direct, weights)),
            Layout::IndexedDense => visitor.visit(&self.dense_rows(Indexed(self.index), weights)),
            Layout::SparseBoolean => visitor.visit(&self.sparse_rows(Direct, Presence, weights)),
            Layout::IndexedSparseBoolean => {
                visitor.visit(&self.sparse_rows(Indexed(self.index), Presence, weights))
            }
            Layout::SparseAnalog => {
                visitor.visit(&self.sparse_rows(Direct, Analog(self.sparse_data), weights))
            }
            Layout::IndexedSparseAnalog => visitor.visit(&self.sparse_rows(
                Indexed(self.index),
                Analog(self.sparse_data),
                weights,
            )),
        }
    }

    fn dense_rows<M: RowMap, W: ExampleWeight>(&self, map: M, weights: W) -> DenseRows<'_, T, M, W> {
        DenseRows {
            data: self.dense,
            stride: self.stride,
            map,
            weights,
        }
    }

    fn sparse_rows<M: RowMap, V: SparseValues, W: ExampleWeight>(
        &self,
        map: M,
        values: V,
        weights: W,
    ) -> SparseRows<'_, M, V, W> {
        SparseRows {
            start: self.sparse_start,
            end: self.sparse_end,
            index: self.sparse_index,
            values,
            stride: self.stride,
            map,
            weights,
        }
    }
}
