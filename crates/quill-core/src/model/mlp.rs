//! Feed-forward layers.
//!
//! Four dense variants share the `(*, n_embd) -> (*, n_embd)` contract:
//!
//! - GptNeox: `proj(gelu(fc(x)))`
//! - LLaMA: `proj(silu(fc_1(x)) * fc_2(x))`
//! - Gemma: `proj(gelu(fc_1(x)) * fc_2(x))`
//! - ChatGLM2: `a, b = chunk(dense_h_to_4h(x)); dense_4h_to_h(silu(a) * b)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::moe::{LLaMAMoE, Qwen2MoE};
use super::{Config, GeluApproximation, MlpKind};
use crate::error::{QuillError, Result};
use candle_core::{Tensor, D};
use candle_nn::ops::silu;
use candle_nn::{linear_b, Linear, Module, VarBuilder};

fn gelu(x: &Tensor, approximate: GeluApproximation) -> Result<Tensor> {
    Ok(match approximate {
        GeluApproximation::None => x.gelu_erf()?,
        GeluApproximation::Tanh => x.gelu()?,
    })
}

/// Expand, GELU, project.
#[derive(Debug, Clone)]
pub struct GptNeoxMlp {
    fc: Linear,
    proj: Linear,
    approximate: GeluApproximation,
}

impl GptNeoxMlp {
    /// Resolve `fc` and `proj` from `vb`.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let intermediate = config.intermediate_size()?;
        Ok(Self {
            fc: linear_b(config.n_embd, intermediate, config.bias, vb.pp("fc"))?,
            proj: linear_b(intermediate, config.n_embd, config.bias, vb.pp("proj"))?,
            approximate: config.gelu_approximate,
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc.forward(x)?;
        let x = gelu(&x, self.approximate)?;
        Ok(self.proj.forward(&x)?)
    }
}

/// Activation applied to the gated branch of a [`GatedMlp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateActivation {
    /// LLaMA style.
    Silu,
    /// Gemma style.
    Gelu(GeluApproximation),
}

/// Two parallel expansions, one activated and multiplied into the other.
///
/// Used directly for LLaMA and Gemma, and as the expert body of both
/// mixture-of-experts layers.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    fc_1: Linear,
    fc_2: Linear,
    proj: Linear,
    activation: GateActivation,
    intermediate_size: usize,
}

impl GatedMlp {
    /// Resolve `fc_1`, `fc_2` and `proj` for the given width.
    pub fn new(
        config: &Config,
        intermediate_size: usize,
        activation: GateActivation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let n_embd = config.n_embd;
        Ok(Self {
            fc_1: linear_b(n_embd, intermediate_size, config.bias, vb.pp("fc_1"))?,
            fc_2: linear_b(n_embd, intermediate_size, config.bias, vb.pp("fc_2"))?,
            proj: linear_b(intermediate_size, n_embd, config.bias, vb.pp("proj"))?,
            activation,
            intermediate_size,
        })
    }

    /// LLaMA MLP at the configured width, or at `intermediate_size` when
    /// given (MoE experts).
    pub fn llama(config: &Config, intermediate_size: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let size = match intermediate_size {
            Some(size) => size,
            None => config.intermediate_size()?,
        };
        Self::new(config, size, GateActivation::Silu, vb)
    }

    /// Gemma MLP at the configured width.
    pub fn gemma(config: &Config, vb: VarBuilder) -> Result<Self> {
        let activation = GateActivation::Gelu(config.gelu_approximate);
        Self::new(config, config.intermediate_size()?, activation, vb)
    }

    /// Intermediate width.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.fc_1.forward(x)?;
        let b = self.fc_2.forward(x)?;
        let a = match self.activation {
            GateActivation::Silu => silu(&a)?,
            GateActivation::Gelu(approximate) => gelu(&a, approximate)?,
        };
        Ok(self.proj.forward(&(a * b)?)?)
    }
}

/// ChatGLM2 MLP: one expansion to twice the width, chunked in two.
#[derive(Debug, Clone)]
pub struct ChatGlm2Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl ChatGlm2Mlp {
    /// Resolve `dense_h_to_4h` and `dense_4h_to_h` from `vb`.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let intermediate = config.intermediate_size()?;
        Ok(Self {
            dense_h_to_4h: linear_b(
                config.n_embd,
                2 * intermediate,
                config.bias,
                vb.pp("dense_h_to_4h"),
            )?,
            dense_4h_to_h: linear_b(
                intermediate,
                config.n_embd,
                config.bias,
                vb.pp("dense_4h_to_h"),
            )?,
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.dense_h_to_4h.forward(x)?;
        let halves = x.chunk(2, D::Minus1)?;
        let [a, b] = halves.as_slice() else {
            return Err(QuillError::ShapeMismatch(format!(
                "expected two halves, got {}",
                halves.len()
            )));
        };
        let x = (silu(a)? * b)?;
        Ok(self.dense_4h_to_h.forward(&x)?)
    }
}

/// Feed-forward selected by [`MlpKind`], fixed at construction.
#[derive(Debug, Clone)]
pub enum FeedForward {
    /// GptNeox MLP.
    GptNeox(GptNeoxMlp),
    /// LLaMA or Gemma MLP.
    Gated(GatedMlp),
    /// ChatGLM2 MLP.
    ChatGlm2(ChatGlm2Mlp),
    /// LLaMA mixture of experts.
    LLaMAMoE(LLaMAMoE),
    /// Qwen2 mixture of experts with a shared expert.
    Qwen2MoE(Qwen2MoE),
}

impl FeedForward {
    /// Build the configured feed-forward.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(match config.mlp_class_name {
            MlpKind::GptNeox => Self::GptNeox(GptNeoxMlp::new(config, vb)?),
            MlpKind::LLaMA => Self::Gated(GatedMlp::llama(config, None, vb)?),
            MlpKind::Gemma => Self::Gated(GatedMlp::gemma(config, vb)?),
            MlpKind::ChatGlm2 => Self::ChatGlm2(ChatGlm2Mlp::new(config, vb)?),
            MlpKind::LLaMAMoE => Self::LLaMAMoE(LLaMAMoE::new(config, vb)?),
            MlpKind::Qwen2MoE => Self::Qwen2MoE(Qwen2MoE::new(config, vb)?),
        })
    }

    /// Forward pass over `(*, n_embd)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::GptNeox(mlp) => mlp.forward(x),
            Self::Gated(mlp) => mlp.forward(x),
            Self::ChatGlm2(mlp) => mlp.forward(x),
            Self::LLaMAMoE(moe) => moe.forward(x),
            Self::Qwen2MoE(moe) => moe.forward(x),
        }
    }
}
