//! Absolute input positions for incremental decoding.

use crate::error::{QuillError, Result};
use candle_core::{DType, Device, Tensor};

/// Strictly ascending absolute positions, one per input token.
///
/// Holds both the device tensor (`U32`, used for table lookups) and a host
/// copy (used for cache writes and bounds checks).
#[derive(Debug, Clone)]
pub struct InputPositions {
    tensor: Tensor,
    host: Vec<usize>,
}

impl InputPositions {
    /// Validate a rank-1 integer tensor and move it to `device`.
    pub fn new(positions: &Tensor, device: &Device) -> Result<Self> {
        if positions.rank() != 1 {
            return Err(QuillError::ShapeMismatch(format!(
                "input positions must be rank 1, got shape {:?}",
                positions.dims()
            )));
        }
        // Checked in i64 so negative values cannot wrap.
        let raw = positions.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let host = raw
            .into_iter()
            .map(|p| {
                usize::try_from(p).map_err(|_| {
                    QuillError::ShapeMismatch(format!("input position {p} is negative"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_slice(&host, device)
    }

    /// Build from host positions.
    pub fn from_slice(positions: &[usize], device: &Device) -> Result<Self> {
        let data = positions
            .iter()
            .map(|&p| {
                u32::try_from(p).map_err(|_| QuillError::SequenceTooLong {
                    requested: p.saturating_add(1),
                    limit: u32::MAX as usize,
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        let tensor = Tensor::new(data.as_slice(), device)?;
        Self::checked(tensor, positions.to_vec())
    }

    fn checked(tensor: Tensor, host: Vec<usize>) -> Result<Self> {
        if host.is_empty() {
            return Err(QuillError::ShapeMismatch("input positions are empty".into()));
        }
        if host.windows(2).any(|w| w[1] <= w[0]) {
            return Err(QuillError::ShapeMismatch(format!(
                "input positions must be strictly ascending, got {host:?}"
            )));
        }
        Ok(Self { tensor, host })
    }

    /// Device tensor of positions.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Host copy of positions.
    pub fn as_slice(&self) -> &[usize] {
        &self.host
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.host.len()
    }

    /// Always false; empty position sets are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// Largest position.
    pub fn max_position(&self) -> usize {
        self.host.last().copied().unwrap_or(0)
    }
}
