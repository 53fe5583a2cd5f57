//! Inference caches.
//!
//! Three kinds of state outlive a single forward call:
//!
//! 1. **KV cache** - Per-layer key/value buffers written at absolute positions
//! 2. **Mask cache** - Shared lower-triangular mask for incremental decoding
//! 3. **Lazy tables** - Positional tables keyed by length and device
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use quill_core::cache::KvCache;
//!
//! // [batch, heads, capacity, head_size]
//! let mut cache = KvCache::new((1, 2, 8, 4), (1, 2, 8, 4), DType::F32, &Device::Cpu).unwrap();
//!
//! // Write two positions
//! let k = Tensor::ones((1, 2, 2, 4), DType::F32, &Device::Cpu).unwrap();
//! let (full_k, _full_v) = cache.update(&[0, 1], &k, &k).unwrap();
//! assert_eq!(full_k.dims(), &[1, 2, 8, 4]);
//! ```

mod kv;
mod mask;
mod table;

pub use kv::KvCache;
pub use mask::{build_mask_cache, MaskCache};
pub use table::{LazyTable, Relocate, TableState};
