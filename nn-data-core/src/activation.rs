//! Output activations and their derivatives

use std::fmt;

use serde::{Deserialize, Serialize};

/// Activation applied by the producing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    /// Logistic sigmoid
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// Identity
    Linear,
    /// ReLU
    RectifiedLinear,
    /// ReLU with a fixed negative slope
    LeakyRectifiedLinear,
    /// ELU
    ExponentialLinear,
    /// SELU
    ScaledExponentialLinear,
    /// ln(1 + e^x)
    SoftPlus,
    /// x / (1 + |x|)
    SoftSign,
    /// Normalized exponential over the layer
    SoftMax,
    /// ReLU followed by a max over the layer
    RELUMax,
    /// Identity followed by a max over the layer
    LinearMax,
    /// ReLU with a learned negative slope
    ParametricRectifiedLinear,
}

/// Shaping parameters passed through to activation derivatives
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaParams {
    /// Negative slope for leaky and parametric ReLU
    pub slope: f32,
    /// ELU / SELU alpha
    pub alpha: f32,
    /// SELU lambda
    pub lambda: f32,
}

impl Default for DeltaParams {
    fn default() -> Self {
        Self { slope: 0.01, alpha: 1.0, lambda: 1.050_701 }
    }
}

impl Activation {
    /// Derivative expressed in terms of the activated output `a`
    #[inline]
    pub fn derivative(self, a: f32, params: &DeltaParams) -> f32 {
        match self {
            Activation::Sigmoid => a * (1.0 - a),
            Activation::Tanh => 1.0 - a * a,
            Activation::Linear | Activation::SoftMax | Activation::LinearMax => 1.0,
            Activation::RectifiedLinear | Activation::RELUMax => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRectifiedLinear | Activation::ParametricRectifiedLinear => {
                if a > 0.0 {
                    1.0
                } else {
                    params.slope
                }
            }
            Activation::ExponentialLinear => {
                if a >= 0.0 {
                    1.0
                } else {
                    a + params.alpha
                }
            }
            Activation::ScaledExponentialLinear => {
                if a >= 0.0 {
                    params.lambda
                } else {
                    a + params.alpha * params.lambda
                }
            }
            Activation::SoftPlus => 1.0 - (-a).exp(),
            Activation::SoftSign => {
                let s = 1.0 - a.abs();
                s * s
            }
        }
    }

    /// Whether cross-entropy style deltas are defined for this activation
    pub fn supports_cross_entropy(self) -> bool {
        matches!(self, Activation::Sigmoid | Activation::SoftMax)
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
