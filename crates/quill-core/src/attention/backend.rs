//! Scaled dot-product attention.
//!
//! This module provides:
//! - [`AttentionConfig`] - Head layout and score scale
//! - [`AttentionMask`] - Boolean or additive masks
//! - [`scaled_dot_product_attention`] - Masked softmax attention
//! - [`alibi_attention`] - Bias-style attention with clamped scores

use crate::error::{QuillError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Configuration for attention computation.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_kv_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Score scale; `None` leaves scores unscaled.
    pub scale: Option<f64>,
}

impl AttentionConfig {
    /// Create a new attention config scaled by `1/sqrt(head_dim)`.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale: Some(1.0 / (head_dim as f64).sqrt()),
        }
    }

    /// Leave scores unscaled.
    pub fn unscaled(mut self) -> Self {
        self.scale = None;
        self
    }

    /// Number of query heads per KV head (for GQA).
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads.max(1)
    }
}

/// Explicit attention mask, broadcastable to `[batch, heads, T, S]`.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// `U8`; 0 entries are excluded from attention.
    Boolean(Tensor),
    /// Added to the scores before softmax.
    Additive(Tensor),
}

impl AttentionMask {
    /// Keep only the first `len` key columns.
    pub fn narrow_keys(&self, len: usize) -> Result<Self> {
        Ok(match self {
            Self::Boolean(m) => Self::Boolean(m.narrow(D::Minus1, 0, len)?),
            Self::Additive(m) => Self::Additive(m.narrow(D::Minus1, 0, len)?),
        })
    }

    /// Apply to `scores` (`[batch, heads, T, S]`).
    pub fn apply(&self, scores: &Tensor) -> Result<Tensor> {
        match self {
            Self::Boolean(mask) => {
                let shape = scores.shape();
                let mask = mask.broadcast_as(shape)?;
                let neg_inf = Tensor::full(f32::NEG_INFINITY, shape, scores.device())?
                    .to_dtype(scores.dtype())?;
                Ok(mask.where_cond(scores, &neg_inf)?)
            }
            Self::Additive(mask) => Ok(scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?),
        }
    }
}

/// Repeat KV heads for grouped-query attention.
///
/// `[batch, kv_heads, seq, head_dim] -> [batch, kv_heads * repeat, seq, head_dim]`,
/// with query head `h` reading KV head `h / repeat`.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads, 1, seq, head_dim]
    let x = x.unsqueeze(2)?;
    // Expand to [batch, num_kv_heads, repeat, seq, head_dim]
    let x = x.expand((batch, num_kv_heads, repeat, seq_len, head_dim))?;
    // Reshape to [batch, num_heads, seq, head_dim]
    Ok(x.reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?)
}

/// Additive causal mask `[t, s]`: `-inf` where key `j` is after query `i`.
pub fn create_causal_mask(t: usize, s: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; t * s];
    for i in 0..t {
        for j in (i + 1)..s {
            mask_data[i * s + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_slice(&mask_data, (t, s), device)?)
}

fn match_heads(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
    let num_heads = query.dim(1)?;
    let num_kv_heads = key.dim(1)?;
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(QuillError::ShapeMismatch(format!(
            "{num_heads} query heads cannot share {num_kv_heads} key/value heads"
        )));
    }
    let repeat = num_heads / num_kv_heads;
    Ok((
        repeat_kv(&key.contiguous()?, repeat)?.contiguous()?,
        repeat_kv(&value.contiguous()?, repeat)?.contiguous()?,
    ))
}

/// Softmax attention over `query` `[B, H, T, D]` and `key`/`value`
/// `[B, H_kv, S, D]`.
///
/// With no mask, causal masking is implicit. A supplied mask replaces it.
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&AttentionMask>,
    config: &AttentionConfig,
) -> Result<Tensor> {
    let (key, value) = match_heads(query, key, value)?;

    // Q @ K^T -> [batch, num_heads, T, S]
    let scores = query.contiguous()?.matmul(&key.t()?)?;
    let scores = match config.scale {
        Some(scale) => (scores * scale)?,
        None => scores,
    };

    let scores = match mask {
        Some(mask) => mask.apply(&scores)?,
        None => {
            let (_, _, t, s) = scores.dims4()?;
            let causal = create_causal_mask(t, s, scores.device())?.to_dtype(scores.dtype())?;
            scores.broadcast_add(&causal)?
        }
    };

    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    Ok(weights.matmul(&value)?)
}

fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65504.0,
        DType::BF16 => -3.389_531_4e38,
        DType::F64 => f64::MIN,
        _ => f32::MIN as f64,
    }
}

/// Bias-style attention: scores scaled by `1/sqrt(head_size)`, mask added,
/// then clamped at the dtype minimum before softmax.
pub fn alibi_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&AttentionMask>,
    head_size: usize,
) -> Result<Tensor> {
    let (key, value) = match_heads(query, key, value)?;
    let scores = query.contiguous()?.matmul(&key.t()?)?;
    let scores = (scores / (head_size as f64).sqrt())?;
    let scores = match mask {
        Some(mask) => {
            let masked = mask.apply(&scores)?;
            masked.maximum(dtype_min(masked.dtype()))?
        }
        None => scores,
    };
    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    Ok(weights.matmul(&value)?)
}
