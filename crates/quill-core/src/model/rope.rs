//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating pairs of query and key
//! features by a position- and frequency-dependent angle. Only the leading
//! `n_elem` features of each head are rotated; the rest pass through.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use super::{Config, InputPositions, RopeStyle};
use crate::cache::{LazyTable, Relocate};
use crate::error::Result;
use candle_core::{Device, Tensor, D};

/// Cosine and sine tables, each `[seq_len, n_elem]` in `F32`.
///
/// The two halves of every row are identical.
#[derive(Debug, Clone)]
pub struct RopeTable {
    /// Cosine table.
    pub cos: Tensor,
    /// Sine table.
    pub sin: Tensor,
}

impl RopeTable {
    /// Rotated width.
    pub fn n_elem(&self) -> usize {
        self.cos.dims()[1]
    }
}

impl Relocate for RopeTable {
    fn relocate(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            cos: self.cos.to_device(device)?,
            sin: self.sin.to_device(device)?,
        })
    }
}

/// Build cos/sin tables for positions `0..seq_len`.
///
/// `theta_i = base^(-2i/n_elem)`; positions are divided by
/// `condense_ratio` before multiplying.
pub fn build_rope_cache(
    seq_len: usize,
    n_elem: usize,
    base: f64,
    condense_ratio: usize,
    device: &Device,
) -> Result<RopeTable> {
    let half = n_elem / 2;
    let inv_freq: Vec<f64> = (0..half)
        .map(|i| 1.0 / base.powf(2.0 * i as f64 / n_elem as f64))
        .collect();

    let mut cos = Vec::with_capacity(seq_len * n_elem);
    let mut sin = Vec::with_capacity(seq_len * n_elem);
    for p in 0..seq_len {
        let position = p as f64 / condense_ratio as f64;
        for _ in 0..2 {
            for &freq in &inv_freq {
                let angle = position * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
    }

    Ok(RopeTable {
        cos: Tensor::from_vec(cos, (seq_len, n_elem), device)?,
        sin: Tensor::from_vec(sin, (seq_len, n_elem), device)?,
    })
}

/// `[x1, x2] -> [-x2, x1]` over the last dimension.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// Rotate all of `x`'s last dimension: `x * cos + rotate_half(x) * sin`.
///
/// `x` is `[batch, heads, T, n_elem]`, `cos`/`sin` are `[T, n_elem]`.
/// The rotation runs in the tables' precision; the result has `x`'s.
pub fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(cos.dtype())?;
    let roped = (x.broadcast_mul(cos)? + rotate_half(&x)?.broadcast_mul(sin)?)?;
    Ok(roped.to_dtype(dtype)?)
}

/// ChatGLM convention: rotate interleaved pairs `(x[2i], x[2i+1])`.
///
/// The pairs are gathered into halves, rotated as in [`apply_rope`], and
/// scattered back to the interleaved layout.
pub fn apply_rope_chatglm(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let (b, h, t, n) = x.dims4()?;
    let pairs = x.to_dtype(cos.dtype())?.reshape((b, h, t, n / 2, 2))?;
    let x1 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let x2 = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let halves = Tensor::cat(&[&x1, &x2], 3)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], 3)?;
    let roped = (halves.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?;

    let interleaved = roped
        .reshape((b, h, t, 2, n / 2))?
        .transpose(3, 4)?
        .reshape((b, h, t, n))?;
    Ok(interleaved.to_dtype(dtype)?)
}

/// Rotate the leading `n_elem` features of each head and pass the rest
/// through unchanged.
pub fn apply_rope_span(
    x: &Tensor,
    n_elem: usize,
    cos: &Tensor,
    sin: &Tensor,
    style: RopeStyle,
) -> Result<Tensor> {
    let head_size = x.dim(D::Minus1)?;
    let span = if n_elem == head_size {
        x.clone()
    } else {
        x.narrow(D::Minus1, 0, n_elem)?
    };
    let roped = match style {
        RopeStyle::Default => apply_rope(&span, cos, sin)?,
        RopeStyle::ChatGlm => apply_rope_chatglm(&span, cos, sin)?,
    };
    if n_elem == head_size {
        return Ok(roped);
    }
    let rest = x.narrow(D::Minus1, n_elem, head_size - n_elem)?;
    Ok(Tensor::cat(&[&roped, &rest], D::Minus1)?)
}

/// Model-owned rotary tables for the active length.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    n_elem: usize,
    base: f64,
    condense_ratio: usize,
    table: LazyTable<RopeTable>,
}

impl RotaryEmbedding {
    /// Declare tables for `config.block_size` positions. Nothing is built
    /// until [`resize`](Self::resize) or the first lookup.
    pub fn new(config: &Config) -> Self {
        Self {
            n_elem: config.rope_n_elem(),
            base: config.rope_base,
            condense_ratio: config.rope_condense_ratio,
            table: LazyTable::new("rope", config.block_size),
        }
    }

    /// Rotated features per head.
    pub fn n_elem(&self) -> usize {
        self.n_elem
    }

    /// Positions covered by the tables.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Always false; tables cover at least one position.
    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Whether the tables hold storage.
    pub fn is_built(&self) -> bool {
        self.table.is_built()
    }

    /// Width of the built tables, if built.
    pub fn built_width(&self) -> Option<usize> {
        self.table.table().map(RopeTable::n_elem)
    }

    /// Build the tables for `len` positions unless already built for it.
    pub fn resize(&mut self, len: usize, device: &Device) -> Result<()> {
        let (n_elem, base, ratio) = (self.n_elem, self.base, self.condense_ratio);
        self.table.resize(len, device, |len, device| {
            build_rope_cache(len, n_elem, base, ratio, device)
        })
    }

    /// Drop the tables; they are rebuilt on next use.
    pub fn invalidate(&mut self) {
        self.table.invalidate();
    }

    fn on(&mut self, device: &Device) -> Result<&RopeTable> {
        let (n_elem, base, ratio) = (self.n_elem, self.base, self.condense_ratio);
        self.table.get_on(device, |len, device| {
            build_rope_cache(len, n_elem, base, ratio, device)
        })
    }

    /// Rows `0..seq_len` of the tables on `device`.
    pub fn leading(&mut self, seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let table = self.on(device)?;
        Ok((
            table.cos.narrow(0, 0, seq_len)?,
            table.sin.narrow(0, 0, seq_len)?,
        ))
    }

    /// Rows at `positions` of the tables on `device`.
    pub fn at(&mut self, positions: &InputPositions, device: &Device) -> Result<(Tensor, Tensor)> {
        let table = self.on(device)?;
        Ok((
            table.cos.index_select(positions.tensor(), 0)?,
            table.sin.index_select(positions.tensor(), 0)?,
        ))
    }
}
