//! # Quill Core
//!
//! Forward engine for decoder-only transformer language models.
//!
//! This crate provides:
//! - **Configurable architecture**: grouped-query attention, rotary or alibi
//!   positions, parallel or sequential residuals, several feed-forward and
//!   mixture-of-experts variants
//! - **Incremental decoding** through preallocated per-layer KV caches written
//!   at explicit absolute positions
//! - **Lazily built positional tables** that follow the active sequence length
//!   and the input device
//!
//! Parameters are resolved through a [`candle_nn::VarBuilder`], so any weight
//! source candle supports can feed the model.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod cache;
pub mod error;
pub mod model;

pub use error::{QuillError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{KvCache, MaskCache};
    pub use crate::error::{QuillError, Result};
    pub use crate::model::{Config, InputPositions, Transformer};
}
