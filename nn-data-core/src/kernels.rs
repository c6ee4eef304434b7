//! Host compute kernels
//!
//! Reference implementations of the per-step primitives. Each kernel is
//! generic over `Rows` and reached through a `RowsVisitor`, so the
//! attribute checks happen once in the dispatcher and the loops below are
//! specialized per layout. With the `parallel` feature, per-example rows are
//! filled and reduced with rayon.

use crate::activation::{Activation, DeltaParams};
use crate::dispatch::{Rows, RowsVisitor};
use crate::loss::UnitLoss;

/// Per-entry keep mask for denoised input
#[derive(Debug, Clone, Copy)]
pub(crate) struct Noise<'a> {
    pub random: &'a [f32],
    pub probability: f32,
    pub scale: f32,
}

impl Noise<'_> {
    /// Scaled value if entry `k` survives, `None` if it is dropped
    #[inline]
    pub fn keep(&self, entry: usize, value: f32) -> Option<f32> {
        match self.random.get(entry) {
            Some(&r) if r < self.probability => None,
            _ => Some(value * self.scale),
        }
    }
}

#[inline]
fn apply_noise(noise: Option<&Noise<'_>>, entry: usize, value: f32) -> Option<f32> {
    match noise {
        Some(noise) => noise.keep(entry, value),
        None => Some(value),
    }
}

/// Runs `f(row_index, row)` over the first `rows` rows of `out`
fn for_each_row<F>(out: &mut [f32], width: usize, rows: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Send + Sync,
{
    if width == 0 {
        return;
    }
    let out = &mut out[..rows * width];

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        out.par_chunks_mut(width)
            .enumerate()
            .for_each(|(i, row)| f(i, row));
    }

    #[cfg(not(feature = "parallel"))]
    out.chunks_mut(width)
        .enumerate()
        .for_each(|(i, row)| f(i, row));
}

/// Sums `f(row_index)` over `rows` rows
fn sum_rows<F>(rows: usize, f: F) -> f64
where
    F: Fn(usize) -> f64 + Send + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..rows).into_par_iter().map(f).sum()
    }

    #[cfg(not(feature = "parallel"))]
    {
        (0..rows).map(f).sum()
    }
}

#[inline]
fn scale_row(row: &mut [f32], beta: f32) {
    if beta == 0.0 {
        row.fill(0.0);
    } else {
        row.iter_mut().for_each(|u| *u *= beta);
    }
}

/// Scale that spreads a boolean example's unit mass over its entries
#[inline]
fn target_scale<R: Rows>(rows: &R, loss: &UnitLoss, example: usize) -> f32 {
    if R::BOOLEAN && loss.kind().normalizes_boolean_targets() {
        match rows.entry_count(example) {
            0 => 0.0,
            n => 1.0 / n as f32,
        }
    } else {
        1.0
    }
}

/// Writes each example's input into `unit[pos * stride ..]`
pub(crate) struct LoadInput<'a> {
    pub position: usize,
    pub batch: usize,
    pub unit: &'a mut [f32],
    pub noise: Option<Noise<'a>>,
}

impl RowsVisitor for LoadInput<'_> {
    type Output = ();

    fn visit<R: Rows>(self, rows: &R) {
        let LoadInput { position, batch, unit, noise } = self;
        let noise = noise.as_ref();
        for_each_row(unit, rows.stride(), batch, |pos, row| {
            let example = position + pos;
            if R::SPARSE {
                row.fill(0.0);
                let w = rows.weight(example);
                rows.for_each(example, |column, entry, value| {
                    if let Some(v) = apply_noise(noise, entry, value) {
                        row[column] = w * v;
                    }
                });
            } else {
                rows.for_each(example, |column, _, value| row[column] = value);
            }
        });
    }
}

/// `unit[p, j] = beta * unit[p, j] + sum_k w * v_k * weight[index_k, j]`
pub(crate) struct SparseZ<'a> {
    pub position: usize,
    pub batch: usize,
    pub stride: usize,
    pub weight: &'a [f32],
    pub unit: &'a mut [f32],
    pub beta: f32,
    pub noise: Option<Noise<'a>>,
}

impl RowsVisitor for SparseZ<'_> {
    type Output = ();

    fn visit<R: Rows>(self, rows: &R) {
        let SparseZ { position, batch, stride, weight, unit, beta, noise } = self;
        let noise = noise.as_ref();
        for_each_row(unit, stride, batch, |pos, row| {
            let example = position + pos;
            scale_row(row, beta);
            let w = rows.weight(example);
            rows.for_each(example, |feature, entry, value| {
                let Some(v) = apply_noise(noise, entry, value) else {
                    return;
                };
                let s = w * v;
                let weights = &weight[feature * stride..(feature + 1) * stride];
                for (u, &wt) in row.iter_mut().zip(weights) {
                    *u += s * wt;
                }
            });
        });
    }
}

/// Batch error against the produced `unit`
pub(crate) struct ComputeError<'a> {
    pub loss: UnitLoss,
    pub ignore_zero: bool,
    pub position: usize,
    pub batch: usize,
    pub unit: &'a [f32],
}

impl RowsVisitor for ComputeError<'_> {
    type Output = f32;

    fn visit<R: Rows>(self, rows: &R) -> f32 {
        let ComputeError { loss, ignore_zero, position, batch, unit } = self;
        let stride = rows.stride();
        let subtract_absent = R::SPARSE && !ignore_zero;
        let total = sum_rows(batch, |pos| {
            let example = position + pos;
            let produced = &unit[pos * stride..(pos + 1) * stride];
            let scale = target_scale(rows, &loss, example);
            let mut error = 0.0f64;
            if subtract_absent {
                error = produced.iter().map(|&a| f64::from(loss.absent(a))).sum();
            }
            rows.for_each(example, |column, _, t| {
                let a = produced[column];
                let mut e = loss.present(a, t * scale);
                if subtract_absent {
                    e -= loss.absent(a);
                }
                error += f64::from(e);
            });
            f64::from(rows.weight(example)) * error
        });
        total as f32
    }
}

/// Output delta written into `delta`, overwriting the batch slice
pub(crate) struct ComputeDelta<'a> {
    pub loss: UnitLoss,
    pub derivative: Option<(Activation, DeltaParams)>,
    pub ignore_zero: bool,
    pub position: usize,
    pub batch: usize,
    pub unit: &'a [f32],
    pub delta: &'a mut [f32],
}

impl RowsVisitor for ComputeDelta<'_> {
    type Output = ();

    fn visit<R: Rows>(self, rows: &R) {
        let ComputeDelta { loss, derivative, ignore_zero, position, batch, unit, delta } = self;
        let stride = rows.stride();
        let seed = |a: f32, gradient: f32, w: f32| match &derivative {
            Some((activation, params)) => w * gradient * activation.derivative(a, params),
            None => w * gradient,
        };
        for_each_row(delta, stride, batch, |pos, out| {
            let example = position + pos;
            let produced = &unit[pos * stride..(pos + 1) * stride];
            let w = rows.weight(example);
            let scale = target_scale(rows, &loss, example);
            if R::SPARSE {
                if ignore_zero {
                    out.fill(0.0);
                } else {
                    for (d, &a) in out.iter_mut().zip(produced) {
                        *d = seed(a, loss.absent_gradient(a), w);
                    }
                }
            }
            rows.for_each(example, |column, _, t| {
                let a = produced[column];
                out[column] = seed(a, loss.present_gradient(a, t * scale), w);
            });
        });
    }
}

/// Per-feature entry totals and per-example maxima over `examples`
pub(crate) struct CountDatapoints {
    pub examples: usize,
}

impl RowsVisitor for CountDatapoints {
    type Output = (Vec<u64>, Vec<u32>);

    fn visit<R: Rows>(self, rows: &R) -> (Vec<u64>, Vec<u32>) {
        let features = rows.stride();
        let mut totals = vec![0u64; features];
        let mut maxima = vec![0u32; features];
        let mut scratch = vec![0u32; features];
        let mut touched = Vec::new();
        for example in 0..self.examples {
            rows.for_each(example, |feature, _, _| {
                if scratch[feature] == 0 {
                    touched.push(feature);
                }
                scratch[feature] += 1;
                totals[feature] += 1;
            });
            for feature in touched.drain(..) {
                maxima[feature] = maxima[feature].max(scratch[feature]);
                scratch[feature] = 0;
            }
        }
        (totals, maxima)
    }
}

/// Appends each batch entry at its feature's cursor in `end`
///
/// A feature's cursor never passes the next feature's `start`. Entries that
/// find their feature full are counted, not written.
pub(crate) struct FillTransposed<'a> {
    pub position: usize,
    pub batch: usize,
    pub noise: Option<Noise<'a>>,
    pub start: &'a [u32],
    pub end: &'a mut [u32],
    pub index: &'a mut [u32],
    pub values: Option<&'a mut [f32]>,
}

impl RowsVisitor for FillTransposed<'_> {
    /// Entries written and entries dropped for lack of capacity
    type Output = (usize, usize);

    fn visit<R: Rows>(self, rows: &R) -> (usize, usize) {
        let FillTransposed { position, batch, noise, start, end, index, mut values } = self;
        let noise = noise.as_ref();
        let (mut written, mut overflowed) = (0, 0);
        for pos in 0..batch {
            let example = position + pos;
            let w = rows.weight(example);
            rows.for_each(example, |feature, entry, value| {
                let Some(v) = apply_noise(noise, entry, value) else {
                    return;
                };
                let slot = end[feature] as usize;
                let within = start.get(feature + 1).map_or(true, |&next| slot < next as usize);
                match index.get_mut(slot) {
                    Some(row) if within => {
                        *row = pos as u32;
                        end[feature] += 1;
                        if let Some(value) = values.as_deref_mut().and_then(|values| values.get_mut(slot)) {
                            *value = w * v;
                        }
                        written += 1;
                    }
                    _ => overflowed += 1,
                }
            });
        }
        (written, overflowed)
    }
}

/// `wg[f, j] = beta * wg[f, j] + alpha * sum_k v_k * delta[row_k, j]`
#[allow(clippy::too_many_arguments)]
pub(crate) fn transposed_weight_gradient(
    alpha: f32,
    beta: f32,
    features: usize,
    width: usize,
    start: &[u32],
    end: &[u32],
    index: &[u32],
    values: Option<&[f32]>,
    delta: &[f32],
    gradient: &mut [f32],
) {
    for_each_row(gradient, width, features, |feature, row| {
        scale_row(row, beta);
        for entry in start[feature] as usize..end[feature] as usize {
            let v = values.map_or(1.0, |values| values[entry]);
            let r = index[entry] as usize;
            let source = &delta[r * width..(r + 1) * width];
            for (g, &d) in row.iter_mut().zip(source) {
                *g += alpha * v * d;
            }
        }
    });
}
