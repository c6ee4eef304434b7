//! Error functions and their per-unit cost and gradient
//!
//! An [`ErrorFunction`] is what a network configures on an output layer. Paired
//! with the layer's [`Activation`] it resolves to a [`LossKind`], the concrete
//! formula the kernels evaluate. Cross-entropy and scaled-marginal
//! cross-entropy resolve to their multinomial forms under softmax.
//!
//! [`UnitLoss`] holds the per-unit formulas. For sparse targets each kind has a
//! `present` cost, used where an entry is stored, and an `absent` cost, used
//! where the dataset stores nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::config::{ClampConfig, DatasetConfig, MarginalConfig};

/// Error function configured on an output layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorFunction {
    /// Sum of absolute differences
    L1,
    /// Half the sum of squared differences
    L2,
    /// L2 that stops penalizing once the output is past the target
    L2Hinge,
    /// Binary cross-entropy
    CrossEntropy,
    /// Cross-entropy with margins and per-side scales
    ScaledMarginalCrossEntropy,
    /// Scaled-marginal cross-entropy weighted by stored target values
    DataScaledMarginalCrossEntropy,
    /// Hinge loss on signed targets
    Hinge,
}

/// Concrete formula evaluated by the kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    /// See [`ErrorFunction::L1`]
    L1,
    /// See [`ErrorFunction::L2`]
    L2,
    /// See [`ErrorFunction::L2Hinge`]
    L2Hinge,
    /// See [`ErrorFunction::CrossEntropy`]
    CrossEntropy,
    /// See [`ErrorFunction::ScaledMarginalCrossEntropy`]
    ScaledMarginalCrossEntropy,
    /// See [`ErrorFunction::DataScaledMarginalCrossEntropy`]
    DataScaledMarginalCrossEntropy,
    /// See [`ErrorFunction::Hinge`]
    Hinge,
    /// Cross-entropy over a softmax output
    MultinomialCrossEntropy,
    /// Scaled-marginal cross-entropy over a softmax output
    MultinomialScaledMarginalCrossEntropy,
}

impl ErrorFunction {
    /// Formula used when the output layer applies `activation`
    pub fn loss_kind(self, activation: Activation) -> LossKind {
        match (self, activation) {
            (ErrorFunction::CrossEntropy, Activation::SoftMax) => LossKind::MultinomialCrossEntropy,
            (ErrorFunction::ScaledMarginalCrossEntropy, Activation::SoftMax) => {
                LossKind::MultinomialScaledMarginalCrossEntropy
            }
            (ErrorFunction::L1, _) => LossKind::L1,
            (ErrorFunction::L2, _) => LossKind::L2,
            (ErrorFunction::L2Hinge, _) => LossKind::L2Hinge,
            (ErrorFunction::CrossEntropy, _) => LossKind::CrossEntropy,
            (ErrorFunction::ScaledMarginalCrossEntropy, _) => LossKind::ScaledMarginalCrossEntropy,
            (ErrorFunction::DataScaledMarginalCrossEntropy, _) => {
                LossKind::DataScaledMarginalCrossEntropy
            }
            (ErrorFunction::Hinge, _) => LossKind::Hinge,
        }
    }

    /// Whether the output delta is taken directly, without an activation derivative
    pub fn is_cross_entropy_family(self) -> bool {
        matches!(
            self,
            ErrorFunction::CrossEntropy
                | ErrorFunction::ScaledMarginalCrossEntropy
                | ErrorFunction::DataScaledMarginalCrossEntropy
        )
    }
}

impl LossKind {
    /// Defined only for dense targets
    pub fn dense_only(self) -> bool {
        matches!(self, LossKind::Hinge)
    }

    /// Defined only for sparse targets
    pub fn sparse_only(self) -> bool {
        matches!(self, LossKind::DataScaledMarginalCrossEntropy)
    }

    /// Boolean sparse targets are spread as 1/n over an example's n entries
    pub fn normalizes_boolean_targets(self) -> bool {
        matches!(
            self,
            LossKind::MultinomialCrossEntropy | LossKind::MultinomialScaledMarginalCrossEntropy
        )
    }

    /// Kind actually evaluated for a sparse layout
    ///
    /// Boolean targets carry no data to scale by, so data-scaled marginal
    /// cross-entropy falls back to the plain scaled-marginal form.
    pub fn for_targets(self, boolean: bool) -> LossKind {
        match self {
            LossKind::DataScaledMarginalCrossEntropy if boolean => {
                LossKind::ScaledMarginalCrossEntropy
            }
            kind => kind,
        }
    }
}

impl fmt::Display for ErrorFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-unit cost and gradient for one kind under one configuration
#[derive(Debug, Clone, Copy)]
pub struct UnitLoss {
    kind: LossKind,
    marginal: MarginalConfig,
    clamp: ClampConfig,
}

impl UnitLoss {
    /// Bind `kind` to the dataset's constants
    pub fn new(kind: LossKind, config: &DatasetConfig) -> Self {
        Self {
            kind,
            marginal: config.marginal,
            clamp: config.clamp,
        }
    }

    /// Kind being evaluated
    pub fn kind(&self) -> LossKind {
        self.kind
    }

    #[inline]
    fn ln(&self, x: f32) -> f32 {
        x.max(self.clamp.min_error).ln()
    }

    #[inline]
    fn marginal_present(&self, a: f32, t: f32) -> f32 {
        if a < self.marginal.one_target {
            -t * self.ln(a) * self.marginal.one_scale
        } else {
            0.0
        }
    }

    #[inline]
    fn marginal_absent(&self, a: f32, scale: f32) -> f32 {
        if a > self.marginal.zero_target {
            -scale * self.ln(1.0 - a) * self.marginal.zero_scale
        } else {
            0.0
        }
    }

    /// Cost at a unit with target `t`
    #[inline]
    pub fn present(&self, a: f32, t: f32) -> f32 {
        match self.kind {
            LossKind::L1 => (a - t).abs(),
            LossKind::L2 => {
                let d = a - t;
                0.5 * d * d
            }
            LossKind::L2Hinge => {
                let d = l2_hinge_diff(a, t);
                0.5 * d * d
            }
            LossKind::CrossEntropy => -t * self.ln(a) - (1.0 - t) * self.ln(1.0 - a),
            LossKind::ScaledMarginalCrossEntropy => {
                self.marginal_present(a, t) + self.marginal_absent(a, 1.0 - t)
            }
            LossKind::DataScaledMarginalCrossEntropy
            | LossKind::MultinomialScaledMarginalCrossEntropy => self.marginal_present(a, t),
            LossKind::Hinge => (1.0 - t * a).max(0.0),
            LossKind::MultinomialCrossEntropy => -t * self.ln(a),
        }
    }

    /// Cost at a unit with no stored sparse entry
    #[inline]
    pub fn absent(&self, a: f32) -> f32 {
        match self.kind {
            LossKind::DataScaledMarginalCrossEntropy
            | LossKind::MultinomialScaledMarginalCrossEntropy => self.marginal_absent(a, 1.0),
            LossKind::MultinomialCrossEntropy => 0.0,
            _ => self.present(a, 0.0),
        }
    }

    /// Gradient of the cost at a unit with target `t`, before weight or derivative
    #[inline]
    pub fn present_gradient(&self, a: f32, t: f32) -> f32 {
        match self.kind {
            LossKind::L1 => signum(a - t),
            LossKind::L2 => a - t,
            LossKind::L2Hinge => l2_hinge_diff(a, t),
            LossKind::Hinge => {
                if t * a < 1.0 {
                    -t
                } else {
                    0.0
                }
            }
            LossKind::CrossEntropy | LossKind::MultinomialCrossEntropy => a - t,
            LossKind::ScaledMarginalCrossEntropy
            | LossKind::MultinomialScaledMarginalCrossEntropy => {
                if t > 0.0 {
                    if a < self.marginal.one_target {
                        self.marginal.one_scale * (a - t)
                    } else {
                        0.0
                    }
                } else {
                    self.marginal_absent_gradient(a)
                }
            }
            LossKind::DataScaledMarginalCrossEntropy => {
                if a < self.marginal.one_target {
                    self.marginal.one_scale * t * (a - 1.0)
                } else {
                    0.0
                }
            }
        }
    }

    /// Gradient at a unit with no stored sparse entry
    #[inline]
    pub fn absent_gradient(&self, a: f32) -> f32 {
        match self.kind {
            LossKind::ScaledMarginalCrossEntropy
            | LossKind::MultinomialScaledMarginalCrossEntropy
            | LossKind::DataScaledMarginalCrossEntropy => self.marginal_absent_gradient(a),
            _ => self.present_gradient(a, 0.0),
        }
    }

    #[inline]
    fn marginal_absent_gradient(&self, a: f32) -> f32 {
        if a > self.marginal.zero_target {
            self.marginal.zero_scale * a
        } else {
            0.0
        }
    }
}

/// Signed distance past the target, clipped to the side that is penalized
#[inline]
fn l2_hinge_diff(a: f32, t: f32) -> f32 {
    let d = a - t.abs();
    if t > 0.0 {
        d.min(0.0)
    } else {
        d.max(0.0)
    }
}

#[inline]
fn signum(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
