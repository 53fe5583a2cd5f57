//! Normalization layers.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::{Config, NormKind};
use crate::error::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{LayerNorm, Module, VarBuilder};

/// RMS Layer Normalization.
///
/// Always computes in `F32` and casts back to the input precision.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Scale by `1 + weight` instead of `weight`.
    add_unit_offset: bool,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64, add_unit_offset: bool) -> Self {
        Self {
            weight,
            eps,
            add_unit_offset,
        }
    }

    /// Resolve `weight` (defaulting to ones) from `vb`.
    pub fn load(hidden_size: usize, eps: f64, add_unit_offset: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self::new(weight, eps, add_unit_offset))
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x.broadcast_mul(&rsqrt)?;

        let weight = self.weight.to_dtype(DType::F32)?;
        let weight = if self.add_unit_offset {
            (weight + 1.0)?
        } else {
            weight
        };
        Ok(normalized.broadcast_mul(&weight)?.to_dtype(dtype)?)
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// Normalization selected by [`NormKind`].
#[derive(Debug, Clone)]
pub enum Norm {
    /// Root-mean-square normalization.
    Rms(RmsNorm),
    /// Standard layer normalization.
    Layer(LayerNorm),
}

impl Norm {
    /// Build the configured normalization over `n_embd` features.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        match config.norm_class_name {
            NormKind::RmsNorm => Ok(Self::Rms(RmsNorm::load(
                config.n_embd,
                config.norm_eps,
                config.rmsnorm_add_unit_offset,
                vb,
            )?)),
            NormKind::LayerNorm => Ok(Self::Layer(candle_nn::layer_norm(
                config.n_embd,
                config.norm_eps,
                vb,
            )?)),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms(norm) => norm.forward(x),
            Self::Layer(norm) => Ok(norm.forward(x)?),
        }
    }
}
