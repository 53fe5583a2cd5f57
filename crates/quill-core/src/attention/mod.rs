//! Attention computation.
//!
//! Provides the math shared by every attention layer:
//! - [`scaled_dot_product_attention`] - Softmax attention, implicitly causal without a mask
//! - [`alibi_attention`] - The clamped bias-style variant used by one model family
//! - [`repeat_kv`] - Key/value head repetition for grouped queries

mod backend;

pub use backend::{
    alibi_attention, create_causal_mask, repeat_kv, scaled_dot_product_attention,
    AttentionConfig, AttentionMask,
};
