//! # Quill
//!
//! Decoder-only transformer inference with cached incremental decoding.
//!
//! Quill re-exports [`quill_core`] and adds a [`Generator`] that runs the
//! cache lifecycle for autoregressive generation:
//! - **Prefill** the prompt at positions `0..T`
//! - **Decode** one token per step through the KV caches
//! - **Sample** greedily or from a seeded, optionally top-k filtered distribution
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quill::prelude::*;
//! use candle_core::{DType, Device};
//! use candle_nn::VarBuilder;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.json".as_ref())?;
//!     let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
//!     let generator = Generator::new(Transformer::new(config, vb)?);
//!
//!     let result = generator
//!         .generate(&[1, 2, 3])
//!         .max_new_tokens(16)
//!         .temperature(0.8)
//!         .top_k(40)
//!         .execute()?;
//!
//!     println!("{:?}", result.tokens);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use quill_core::*;

mod generate;

pub use generate::{GenerateRequest, GenerateResult, Generator, Sampler, StopReason};

/// Commonly used types.
pub mod prelude {
    pub use crate::generate::{GenerateRequest, GenerateResult, Generator, Sampler, StopReason};
    pub use quill_core::{
        cache::{KvCache, MaskCache},
        error::{QuillError, Result},
        model::{Config, InputPositions, Transformer},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
