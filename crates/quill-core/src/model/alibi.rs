//! Additive distance bias (ALiBi).
//!
//! Each head adds `slope_h * j` to the score of key position `j`; keys in
//! the future get `-inf`. Combined with softmax this penalizes distant keys
//! linearly, with a different rate per head.

use super::InputPositions;
use crate::cache::LazyTable;
use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Per-head slopes.
///
/// For a power of two `n` the slopes are `start^1..=start^n` with
/// `start = 2^(-8/n)`. Otherwise the slopes of the closest smaller power
/// of two are followed by every other slope of twice that power.
pub fn alibi_slopes(n_head: usize) -> Vec<f64> {
    fn power_of_two(n: usize) -> Vec<f64> {
        let start = 2f64.powf(-8.0 / n as f64);
        (1..=n).map(|i| start.powi(i as i32)).collect()
    }

    if n_head == 0 {
        return Vec::new();
    }
    if n_head.is_power_of_two() {
        return power_of_two(n_head);
    }
    let closest = 1usize << n_head.ilog2();
    let mut slopes = power_of_two(closest);
    slopes.extend(
        alibi_slopes(2 * closest)
            .into_iter()
            .step_by(2)
            .take(n_head - closest),
    );
    slopes
}

/// Bias mask `[n_head, len, len]` in `F32`.
///
/// `mask[h, i, j]` is `slope_h * j` for `j <= i` and `-inf` otherwise.
pub fn build_alibi_mask(n_head: usize, len: usize, device: &Device) -> Result<Tensor> {
    let slopes: Vec<f32> = alibi_slopes(n_head).into_iter().map(|s| s as f32).collect();
    let slopes = Tensor::from_vec(slopes, (n_head, 1, 1), device)?;
    let distance = Tensor::arange(0u32, len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((1, 1, len))?;
    let bias = slopes.broadcast_mul(&distance)?;

    let causal = Tensor::tril2(len, DType::U8, device)?;
    let zeros = Tensor::zeros((len, len), DType::F32, device)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (len, len), device)?;
    let future = causal.where_cond(&zeros, &neg_inf)?.unsqueeze(0)?;

    Ok(future.broadcast_add(&bias)?)
}

/// Merge boolean mask rows with the matching alibi rows.
///
/// `allowed` is `[1, 1, T, S]` (`U8`), `bias` is `[n_head, T, S]`. Returns an
/// additive `[1, n_head, T, S]` mask that is `-inf` wherever `allowed` is 0.
pub fn combine_with_mask(allowed: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let bias = bias.unsqueeze(0)?;
    let shape = bias.shape();
    let allowed = allowed.broadcast_as(shape)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, shape, bias.device())?.to_dtype(bias.dtype())?;
    Ok(allowed.where_cond(&bias, &neg_inf)?)
}

/// Model-owned alibi bias for the active length.
#[derive(Debug, Clone)]
pub struct AlibiBias {
    n_head: usize,
    table: LazyTable<Tensor>,
}

impl AlibiBias {
    /// Declare a bias for `len` positions without building it.
    pub fn new(n_head: usize, len: usize) -> Self {
        Self {
            n_head,
            table: LazyTable::new("alibi", len),
        }
    }

    /// Positions covered by the bias.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Always false; the bias covers at least one position.
    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Whether the bias holds storage.
    pub fn is_built(&self) -> bool {
        self.table.is_built()
    }

    /// Build the bias for `len` positions unless already built for it.
    pub fn resize(&mut self, len: usize, device: &Device) -> Result<()> {
        let n_head = self.n_head;
        self.table
            .resize(len, device, |len, device| build_alibi_mask(n_head, len, device))
    }

    /// Drop the bias; it is rebuilt on next use.
    pub fn invalidate(&mut self) {
        self.table.invalidate();
    }

    fn on(&mut self, device: &Device) -> Result<&Tensor> {
        let n_head = self.n_head;
        self.table
            .get_on(device, |len, device| build_alibi_mask(n_head, len, device))
    }

    /// Additive mask `[1, n_head, T, T]` for a full pass over `T` tokens.
    pub fn full_pass(&mut self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let bias = self.on(device)?;
        Ok(bias
            .narrow(1, 0, seq_len)?
            .narrow(2, 0, seq_len)?
            .unsqueeze(0)?)
    }

    /// Additive mask `[1, n_head, T, len]` for incremental decoding.
    ///
    /// `allowed` holds the causal mask rows at `positions`.
    pub fn incremental(
        &mut self,
        allowed: &Tensor,
        positions: &InputPositions,
        device: &Device,
    ) -> Result<Tensor> {
        let bias = self.on(device)?.index_select(positions.tensor(), 1)?;
        combine_with_mask(allowed, &bias)
    }
}
