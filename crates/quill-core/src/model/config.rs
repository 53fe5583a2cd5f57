//! Model configuration.

use crate::error::{QuillError, Result};
use serde::{Deserialize, Serialize};

/// Positional encoding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEmbedding {
    /// Rotary position embeddings.
    #[default]
    Rope,
    /// Additive per-head distance bias.
    Alibi,
}

/// Rotation convention for rotary embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeStyle {
    /// Rotate the two halves of the span.
    #[default]
    Default,
    /// Rotate interleaved pairs, then restore the interleaved layout.
    ChatGlm,
}

/// Normalization kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormKind {
    /// Root-mean-square normalization.
    #[serde(rename = "RMSNorm")]
    RmsNorm,
    /// Standard layer normalization.
    #[default]
    #[serde(rename = "LayerNorm")]
    LayerNorm,
}

/// Feed-forward kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MlpKind {
    /// Expand, GELU, project.
    #[default]
    #[serde(rename = "GptNeoxMLP")]
    GptNeox,
    /// `silu(fc_1(x)) * fc_2(x)`, project.
    #[serde(rename = "LLaMAMLP")]
    LLaMA,
    /// `gelu(fc_1(x)) * fc_2(x)`, project.
    #[serde(rename = "GemmaMLP")]
    Gemma,
    /// Expand to twice the width, chunk, `silu(a) * b`, project.
    #[serde(rename = "ChatGLM2MLP")]
    ChatGlm2,
    /// Top-k over gate logits, softmax over the selected experts.
    #[serde(rename = "LLaMAMoE")]
    LLaMAMoE,
    /// Softmax over all experts, top-k, plus a gated shared expert.
    #[serde(rename = "Qwen2MoE")]
    Qwen2MoE,
}

impl MlpKind {
    /// Whether this kind routes tokens over experts.
    pub fn is_moe(&self) -> bool {
        matches!(self, Self::LLaMAMoE | Self::Qwen2MoE)
    }
}

/// Output head kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmHeadKind {
    /// Plain affine projection.
    #[default]
    Linear,
    /// Projection through a row-normalized weight.
    NormHead,
}

/// GELU flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeluApproximation {
    /// Exact, erf based.
    #[default]
    None,
    /// Tanh approximation.
    Tanh,
}

/// Hyperparameters of a decoder-only transformer.
///
/// Optional fields are derived from the others when absent; read them
/// through the accessor of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model name. Only used to recognize model families with special cases.
    pub name: String,
    /// Maximum context length.
    pub block_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Padded vocabulary is rounded up to a multiple of this.
    pub padding_multiple: usize,
    /// Explicit padded vocabulary size.
    pub padded_vocab_size: Option<usize>,
    /// Number of blocks.
    pub n_layer: usize,
    /// Number of query heads.
    pub n_head: usize,
    /// Embedding width.
    pub n_embd: usize,
    /// Explicit head size.
    pub head_size: Option<usize>,
    /// Number of key/value heads.
    pub n_query_groups: Option<usize>,
    /// Feed-forward width.
    pub intermediate_size: Option<usize>,
    /// Per-expert feed-forward width (Qwen2-MoE).
    pub moe_intermediate_size: Option<usize>,
    /// Shared expert feed-forward width (Qwen2-MoE).
    pub shared_expert_intermediate_size: Option<usize>,
    /// Leading fraction of each head that is rotated.
    pub rotary_percentage: f64,
    /// Rotary frequency base.
    pub rope_base: f64,
    /// Positions are divided by this before rotation.
    pub rope_condense_ratio: usize,
    /// Rotation convention.
    pub rope_type: RopeStyle,
    /// Positional encoding scheme.
    pub position_emb_type: PositionEmbedding,
    /// Attention and feed-forward read the same residual stream.
    pub parallel_residual: bool,
    /// Feed-forward reuses the attention input norm.
    pub shared_attention_norm: bool,
    /// Bias on attention output and feed-forward projections.
    pub bias: bool,
    /// Bias on the fused qkv projection.
    pub add_qkv_bias: Option<bool>,
    /// Bias on the output head.
    pub lm_head_bias: bool,
    /// Output head kind.
    pub lm_head_type: LmHeadKind,
    /// Scale attention scores by `1/sqrt(head_size)`.
    pub add_attention_scale: bool,
    /// Multiply embeddings by `sqrt(n_embd)`.
    pub scale_embeddings: bool,
    /// Normalization kind.
    pub norm_class_name: NormKind,
    /// Normalization epsilon.
    pub norm_eps: f64,
    /// RMSNorm scales by `1 + weight`.
    pub rmsnorm_add_unit_offset: bool,
    /// Feed-forward kind.
    pub mlp_class_name: MlpKind,
    /// GELU flavor for the GELU based feed-forwards.
    pub gelu_approximate: GeluApproximation,
    /// Number of experts.
    pub n_expert: usize,
    /// Experts selected per token.
    pub n_expert_per_token: usize,
    /// Renormalize the selected Qwen2-MoE weights.
    pub norm_topk_prob: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            block_size: 4096,
            vocab_size: 50254,
            padding_multiple: 512,
            padded_vocab_size: None,
            n_layer: 16,
            n_head: 32,
            n_embd: 4096,
            head_size: None,
            n_query_groups: None,
            intermediate_size: None,
            moe_intermediate_size: None,
            shared_expert_intermediate_size: None,
            rotary_percentage: 1.0,
            rope_base: 10000.0,
            rope_condense_ratio: 1,
            rope_type: RopeStyle::Default,
            position_emb_type: PositionEmbedding::Rope,
            parallel_residual: true,
            shared_attention_norm: false,
            bias: true,
            add_qkv_bias: None,
            lm_head_bias: false,
            lm_head_type: LmHeadKind::Linear,
            add_attention_scale: true,
            scale_embeddings: false,
            norm_class_name: NormKind::LayerNorm,
            norm_eps: 1e-5,
            rmsnorm_add_unit_offset: false,
            mlp_class_name: MlpKind::GptNeox,
            gelu_approximate: GeluApproximation::None,
            n_expert: 0,
            n_expert_per_token: 0,
            norm_topk_prob: false,
        }
    }
}

impl Config {
    /// Head size; `n_embd / n_head` unless set explicitly.
    pub fn head_size(&self) -> usize {
        self.head_size.unwrap_or(self.n_embd / self.n_head.max(1))
    }

    /// Number of key/value heads; `n_head` unless set explicitly.
    pub fn n_query_groups(&self) -> usize {
        self.n_query_groups.unwrap_or(self.n_head)
    }

    /// Width of the fused qkv projection output.
    pub fn qkv_size(&self) -> usize {
        (self.n_head + 2 * self.n_query_groups()) * self.head_size()
    }

    /// Vocabulary size rounded up to `padding_multiple`.
    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size.unwrap_or_else(|| {
            let multiple = self.padding_multiple.max(1);
            self.vocab_size.div_ceil(multiple) * multiple
        })
    }

    /// Number of rotated features per head.
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size() as f64) as usize
    }

    /// Whether the qkv projection carries a bias.
    pub fn add_qkv_bias(&self) -> bool {
        self.add_qkv_bias.unwrap_or(self.bias)
    }

    /// Feed-forward width; `4 * n_embd` for the GptNeox MLP unless set.
    pub fn intermediate_size(&self) -> Result<usize> {
        match (self.intermediate_size, self.mlp_class_name) {
            (Some(size), _) => Ok(size),
            (None, MlpKind::GptNeox) => Ok(4 * self.n_embd),
            (None, kind) => Err(QuillError::unsupported(format!(
                "{kind:?} requires an explicit intermediate_size"
            ))),
        }
    }

    /// Whether this model family truncates the key history to the largest
    /// input position before its bias-style attention.
    pub fn truncates_alibi_history(&self) -> bool {
        self.name.to_lowercase().contains("baichuan2-13b")
    }

    /// Reject combinations the model cannot build.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_layer == 0 || self.n_embd == 0 {
            return Err(QuillError::unsupported(
                "n_head, n_layer and n_embd must be positive",
            ));
        }
        if self.head_size() == 0 {
            return Err(QuillError::unsupported("head_size must be positive"));
        }
        let groups = self.n_query_groups();
        if groups == 0 || self.n_head % groups != 0 {
            return Err(QuillError::unsupported(format!(
                "n_head ({}) must be divisible by n_query_groups ({groups})",
                self.n_head
            )));
        }
        if !self.parallel_residual && self.shared_attention_norm {
            return Err(QuillError::unsupported(
                "shared_attention_norm requires parallel_residual",
            ));
        }
        if self.block_size == 0 {
            return Err(QuillError::unsupported("block_size must be positive"));
        }
        if self.padded_vocab_size() < self.vocab_size {
            return Err(QuillError::unsupported(format!(
                "padded_vocab_size ({}) is smaller than vocab_size ({})",
                self.padded_vocab_size(),
                self.vocab_size
            )));
        }
        if self.position_emb_type == PositionEmbedding::Rope {
            if !(0.0..=1.0).contains(&self.rotary_percentage) {
                return Err(QuillError::unsupported(format!(
                    "rotary_percentage must lie in [0, 1], got {}",
                    self.rotary_percentage
                )));
            }
            let n_elem = self.rope_n_elem();
            if n_elem == 0 || n_elem % 2 != 0 {
                return Err(QuillError::unsupported(format!(
                    "rotary span must be positive and even, got {n_elem}"
                )));
            }
            if self.rope_condense_ratio == 0 {
                return Err(QuillError::unsupported("rope_condense_ratio must be positive"));
            }
        }

        match self.mlp_class_name {
            MlpKind::GptNeox => {}
            MlpKind::LLaMA | MlpKind::Gemma | MlpKind::ChatGlm2 | MlpKind::LLaMAMoE => {
                self.intermediate_size()?;
            }
            MlpKind::Qwen2MoE => {
                if self.moe_intermediate_size.is_none()
                    || self.shared_expert_intermediate_size.is_none()
                {
                    return Err(QuillError::unsupported(
                        "Qwen2MoE requires moe_intermediate_size and shared_expert_intermediate_size",
                    ));
                }
            }
        }
        if self.mlp_class_name.is_moe()
            && (self.n_expert == 0
                || self.n_expert_per_token == 0
                || self.n_expert_per_token > self.n_expert)
        {
            return Err(QuillError::unsupported(format!(
                "{:?} needs 1 <= n_expert_per_token ({}) <= n_expert ({})",
                self.mlp_class_name, self.n_expert_per_token, self.n_expert
            )));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
