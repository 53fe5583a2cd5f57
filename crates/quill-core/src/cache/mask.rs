//! Causal mask cache.

use crate::error::Result;
use crate::model::InputPositions;
use candle_core::{DType, Device, Tensor};

/// Build a `[1, 1, len, len]` lower-triangular boolean mask (`U8`).
///
/// `mask[.., i, j]` is 1 when position `i` may attend to position `j`.
pub fn build_mask_cache(len: usize, device: &Device) -> Result<Tensor> {
    let mask = Tensor::tril2(len, DType::U8, device)?;
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

/// Shared causal mask used by incremental decoding.
///
/// Built by the cache setup call for the model's active length and dropped
/// by the teardown call.
#[derive(Debug, Clone, Default)]
pub struct MaskCache {
    mask: Option<Tensor>,
}

impl MaskCache {
    /// Create an empty mask cache.
    pub fn new() -> Self {
        Self { mask: None }
    }

    /// Whether a mask is present.
    pub fn is_built(&self) -> bool {
        self.mask.is_some()
    }

    /// Side length of the cached mask.
    pub fn len(&self) -> Option<usize> {
        self.mask.as_ref().map(|m| m.dims()[3])
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.mask.is_none()
    }

    /// The cached mask, if any.
    pub fn get(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    /// Build the mask unless one of side `len` already exists.
    pub fn ensure(&mut self, len: usize, device: &Device) -> Result<()> {
        if self.len() == Some(len) {
            return Ok(());
        }
        tracing::debug!(len, device = ?device.location(), "building mask cache");
        self.mask = Some(build_mask_cache(len, device)?);
        Ok(())
    }

    /// Mask rows for the given query positions: `[1, 1, T, len]`.
    ///
    /// Moves the mask to `device` first if it lives elsewhere.
    pub fn rows(&mut self, positions: &InputPositions, device: &Device) -> Result<Option<Tensor>> {
        let Some(mask) = self.mask.as_mut() else {
            return Ok(None);
        };
        if !mask.device().same_device(device) {
            tracing::debug!(to = ?device.location(), "relocating mask cache");
            *mask = mask.to_device(device)?;
        }
        Ok(Some(mask.index_select(positions.tensor(), 2)?))
    }

    /// Drop the mask.
    pub fn clear(&mut self) {
        if self.mask.take().is_some() {
            tracing::debug!("mask cache cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_shape() {
        let mask = build_mask_cache(16, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 16, 16]);
        assert_eq!(mask.dtype(), DType::U8);
    }

    #[test]
    fn mask_values() {
        let mask = build_mask_cache(4, &Device::Cpu).unwrap();
        let vals: Vec<Vec<u8>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        assert_eq!(vals[0], vec![1, 0, 0, 0]);
        assert_eq!(vals[2], vec![1, 1, 1, 0]);
        assert_eq!(vals[3], vec![1, 1, 1, 1]);
    }

    #[test]
    fn ensure_and_clear() {
        let mut cache = MaskCache::new();
        assert!(cache.is_empty());

        cache.ensure(8, &Device::Cpu).unwrap();
        assert_eq!(cache.len(), Some(8));

        cache.ensure(6, &Device::Cpu).unwrap();
        assert_eq!(cache.len(), Some(6));

        cache.clear();
        assert!(!cache.is_built());
        // Idempotent.
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn rows_select_positions() {
        let mut cache = MaskCache::new();
        cache.ensure(4, &Device::Cpu).unwrap();

        let positions = InputPositions::from_slice(&[1, 3], &Device::Cpu).unwrap();
        let rows = cache.rows(&positions, &Device::Cpu).unwrap().unwrap();
        assert_eq!(rows.dims(), &[1, 1, 2, 4]);

        let vals: Vec<Vec<u8>> = rows.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(vals[0], vec![1, 1, 0, 0]);
        assert_eq!(vals[1], vec![1, 1, 1, 1]);
    }

    #[test]
    fn rows_without_mask_is_none() {
        let mut cache = MaskCache::new();
        let positions = InputPositions::from_slice(&[0], &Device::Cpu).unwrap();
        assert!(cache.rows(&positions, &Device::Cpu).unwrap().is_none());
    }
}
