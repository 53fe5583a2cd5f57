//! Per-layer key/value cache for incremental decoding.

use crate::error::{QuillError, Result};
use candle_core::{DType, Device, Tensor};

/// Fixed-capacity key/value buffers for one attention layer.
///
/// Keys are stored as `[batch, heads, capacity, key_dim]`, values as
/// `[batch, heads, capacity, head_size]`. Writes land at absolute positions
/// and the buffers never grow. Slots that were never written hold zeros.
///
/// Not `Clone`: writes go into the buffers in place, so a cloned handle
/// would share history with its source.
#[derive(Debug)]
pub struct KvCache {
    /// Cached keys: [batch, heads, capacity, key_dim]
    key: Tensor,
    /// Cached values: [batch, heads, capacity, head_size]
    value: Tensor,
}

impl KvCache {
    /// Allocate zeroed buffers with the given shapes.
    pub fn new(
        k_shape: (usize, usize, usize, usize),
        v_shape: (usize, usize, usize, usize),
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if k_shape.0 != v_shape.0 || k_shape.1 != v_shape.1 || k_shape.2 != v_shape.2 {
            return Err(QuillError::ShapeMismatch(format!(
                "key shape {k_shape:?} and value shape {v_shape:?} disagree on batch, heads or capacity"
            )));
        }
        Ok(Self {
            key: Tensor::zeros(k_shape, dtype, device)?,
            value: Tensor::zeros(v_shape, dtype, device)?,
        })
    }

    /// Number of positions the cache can hold.
    pub fn capacity(&self) -> usize {
        self.key.dims()[2]
    }

    /// Width of each cached key.
    pub fn key_dim(&self) -> usize {
        self.key.dims()[3]
    }

    /// Number of cached heads.
    pub fn num_heads(&self) -> usize {
        self.key.dims()[1]
    }

    /// Current precision of the buffers.
    pub fn dtype(&self) -> DType {
        self.key.dtype()
    }

    /// Device holding the buffers.
    pub fn device(&self) -> &Device {
        self.key.device()
    }

    /// Full key buffer.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// Full value buffer.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Write `key`/`value` rows at `positions` and return the full buffers.
    ///
    /// `key` is `[batch, heads, T, key_dim]` and `value` is
    /// `[batch, heads, T, head_size]` with `T == positions.len()`. The
    /// buffers first follow the incoming precision and device.
    pub fn update(
        &mut self,
        positions: &[usize],
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        self.follow(key)?;

        let t = positions.len();
        if key.dim(2)? != t || value.dim(2)? != t {
            return Err(QuillError::ShapeMismatch(format!(
                "{t} positions for key/value of length {}/{}",
                key.dim(2)?,
                value.dim(2)?
            )));
        }
        let capacity = self.capacity();
        if let Some(&last) = positions.last() {
            if last >= capacity {
                return Err(QuillError::SequenceTooLong {
                    requested: last + 1,
                    limit: capacity,
                });
            }
        }

        // One write per run of consecutive positions.
        let mut start = 0;
        while start < t {
            let mut end = start + 1;
            while end < t && positions[end] == positions[end - 1] + 1 {
                end += 1;
            }
            let k = key.narrow(2, start, end - start)?.contiguous()?;
            let v = value.narrow(2, start, end - start)?.contiguous()?;
            self.key.slice_set(&k, 2, positions[start])?;
            self.value.slice_set(&v, 2, positions[start])?;
            start = end;
        }

        Ok((self.key.clone(), self.value.clone()))
    }

    fn follow(&mut self, incoming: &Tensor) -> Result<()> {
        if self.key.dtype() != incoming.dtype() {
            tracing::trace!(from = ?self.key.dtype(), to = ?incoming.dtype(), "kv cache precision change");
            self.key = self.key.to_dtype(incoming.dtype())?;
            self.value = self.value.to_dtype(incoming.dtype())?;
        }
        if !self.key.device().same_device(incoming.device()) {
            tracing::trace!(to = ?incoming.device().location(), "kv cache device change");
            self.key = self.key.to_device(incoming.device())?;
            self.value = self.value.to_device(incoming.device())?;
        }
        Ok(())
    }
}
