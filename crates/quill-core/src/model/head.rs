//! Output projection onto the (padded) vocabulary.

use super::{Config, LmHeadKind};
use crate::error::Result;
use candle_core::{Tensor, D};
use candle_nn::{linear_b, Linear, Module, VarBuilder};

/// State of the [`NormHead`] weight latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormHeadState {
    /// Normalize on every call.
    Training,
    /// Inference; the next call normalizes the stored weight in place.
    Armed,
    /// Inference; the stored weight is already normalized.
    Latched,
}

/// Linear head whose weight rows are scaled to unit L2 norm.
#[derive(Debug, Clone)]
pub struct NormHead {
    weight: Tensor,
    state: NormHeadState,
}

fn normalize_rows(weight: &Tensor) -> Result<Tensor> {
    let norm = weight.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    Ok(weight.broadcast_div(&norm)?)
}

impl NormHead {
    /// Wrap a `[vocab, n_embd]` weight, starting in inference mode.
    pub fn new(weight: Tensor) -> Self {
        Self {
            weight,
            state: NormHeadState::Armed,
        }
    }

    /// Current latch state.
    pub fn state(&self) -> NormHeadState {
        self.state
    }

    /// The stored weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Switch between training and inference.
    ///
    /// Entering inference from training re-arms the latch.
    pub fn set_training(&mut self, training: bool) {
        self.state = match (training, self.state) {
            (true, _) => NormHeadState::Training,
            (false, NormHeadState::Training) => NormHeadState::Armed,
            (false, state) => state,
        };
    }

    /// Project `x` (`[..., n_embd]`) onto the vocabulary.
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let weight = match self.state {
            NormHeadState::Training => normalize_rows(&self.weight)?,
            NormHeadState::Armed => {
                self.weight = normalize_rows(&self.weight)?;
                self.state = NormHeadState::Latched;
                tracing::debug!("norm head weight latched");
                self.weight.clone()
            }
            NormHeadState::Latched => self.weight.clone(),
        };
        Ok(Linear::new(weight, None).forward(x)?)
    }
}

/// Output head selected by [`LmHeadKind`].
#[derive(Debug, Clone)]
pub enum LmHead {
    /// Plain affine projection.
    Linear(Linear),
    /// Row-normalized projection.
    Norm(NormHead),
}

impl LmHead {
    /// Resolve the head weight (and bias, for the linear head) from `vb`.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let vocab = config.padded_vocab_size();
        Ok(match config.lm_head_type {
            LmHeadKind::Linear => {
                Self::Linear(linear_b(config.n_embd, vocab, config.lm_head_bias, vb)?)
            }
            LmHeadKind::NormHead => {
                let init = candle_nn::init::DEFAULT_KAIMING_NORMAL;
                let weight = vb.get_with_hints((vocab, config.n_embd), "weight", init)?;
                Self::Norm(NormHead::new(weight))
            }
        })
    }

    /// Forward training flag to heads that care about it.
    pub fn set_training(&mut self, training: bool) {
        if let Self::Norm(head) = self {
            head.set_training(training);
        }
    }

    /// Project onto the vocabulary.
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(linear) => Ok(linear.forward(x)?),
            Self::Norm(head) => head.forward(x),
        }
    }
}
