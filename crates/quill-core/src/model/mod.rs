//! Model definition and forward pass.
//!
//! Provides the pieces of a decoder-only transformer:
//! - Model configuration and its variant tags
//! - Positional encodings (rotary tables, alibi bias)
//! - Normalization, feed-forward and mixture-of-experts units
//! - Attention, blocks and the top-level [`Transformer`]

mod alibi;
mod config;
mod head;
mod layer;
mod mlp;
mod moe;
mod norm;
mod positions;
mod rope;
mod transformer;

pub use alibi::{alibi_slopes, build_alibi_mask, combine_with_mask, AlibiBias};
pub use config::{
    Config, GeluApproximation, LmHeadKind, MlpKind, NormKind, PositionEmbedding, RopeStyle,
};
pub use head::{LmHead, NormHead, NormHeadState};
pub use layer::{Block, CausalSelfAttention, LayerInputs};
pub use mlp::{ChatGlm2Mlp, FeedForward, GateActivation, GatedMlp, GptNeoxMlp};
pub use moe::{route_tokens, LLaMAMoE, Qwen2MoE, Routing, RoutingPolicy};
pub use norm::{Norm, RmsNorm};
pub use positions::InputPositions;
pub use rope::{
    apply_rope, apply_rope_chatglm, apply_rope_span, build_rope_cache, RopeTable,
    RotaryEmbedding,
};
pub use transformer::Transformer;
