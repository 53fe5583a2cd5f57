//! Transformer block implementation.
//!
//! A single decoder block combining:
//! - Pre-attention norm
//! - Grouped-query causal self-attention with an optional KV cache
//! - Second norm (or the shared first norm)
//! - Feed-forward, in parallel with attention or after it

use super::rope::apply_rope_span;
use super::{Config, FeedForward, InputPositions, Norm, PositionEmbedding, RopeStyle};
use crate::attention::{
    alibi_attention, scaled_dot_product_attention, AttentionConfig, AttentionMask,
};
use crate::cache::KvCache;
use crate::error::{QuillError, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear_b, Linear, Module, VarBuilder};

/// Per-call inputs shared by every block.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerInputs<'a> {
    /// Rotary cos/sin rows for the input positions, `[T, n_elem]` each.
    pub rope: Option<(&'a Tensor, &'a Tensor)>,
    /// Explicit attention mask; `None` means implicit causal masking.
    pub mask: Option<&'a AttentionMask>,
    /// Absolute positions; present only when decoding incrementally.
    pub positions: Option<&'a InputPositions>,
}

/// Causal self-attention with grouped key/value heads.
///
/// Cloning keeps the projections but not the KV cache; a clone must call
/// [`CausalSelfAttention::set_kv_cache`] before decoding incrementally.
#[derive(Debug)]
pub struct CausalSelfAttention {
    /// Fused qkv projection: [n_embd] -> [(n_head + 2 * groups) * head_size]
    attn: Linear,
    /// Output projection: [n_head * head_size] -> [n_embd]
    proj: Linear,
    /// Head layout and score scale.
    config: AttentionConfig,
    /// Rotated features per head.
    rope_n_elem: usize,
    rotary_percentage: f64,
    rope_style: RopeStyle,
    position_embedding: PositionEmbedding,
    /// Key history is cut at the largest input position (one model family).
    truncate_alibi_history: bool,
    kv_cache: Option<KvCache>,
    layer_idx: usize,
}

impl Clone for CausalSelfAttention {
    fn clone(&self) -> Self {
        Self {
            attn: self.attn.clone(),
            proj: self.proj.clone(),
            config: self.config.clone(),
            rope_n_elem: self.rope_n_elem,
            rotary_percentage: self.rotary_percentage,
            rope_style: self.rope_style,
            position_embedding: self.position_embedding,
            truncate_alibi_history: self.truncate_alibi_history,
            kv_cache: None,
            layer_idx: self.layer_idx,
        }
    }
}

impl CausalSelfAttention {
    /// Resolve `attn` and `proj` from `vb`.
    pub fn new(config: &Config, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let head_size = config.head_size();
        let attn = linear_b(config.n_embd, config.qkv_size(), config.add_qkv_bias(), vb.pp("attn"))?;
        let proj = linear_b(config.n_head * head_size, config.n_embd, config.bias, vb.pp("proj"))?;
        Ok(Self::with_projections(config, attn, proj, layer_idx))
    }

    fn with_projections(config: &Config, attn: Linear, proj: Linear, layer_idx: usize) -> Self {
        let attention = AttentionConfig::new(config.n_head, config.n_query_groups(), config.head_size());
        let attention = if config.add_attention_scale {
            attention
        } else {
            attention.unscaled()
        };
        Self {
            attn,
            proj,
            config: attention,
            rope_n_elem: config.rope_n_elem(),
            rotary_percentage: config.rotary_percentage,
            rope_style: config.rope_type,
            position_embedding: config.position_emb_type,
            truncate_alibi_history: config.position_emb_type == PositionEmbedding::Alibi
                && config.truncates_alibi_history(),
            kv_cache: None,
            layer_idx,
        }
    }

    /// Number of query heads.
    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    /// Number of key/value groups.
    pub fn num_query_groups(&self) -> usize {
        self.config.num_kv_heads
    }

    /// Head size.
    pub fn head_size(&self) -> usize {
        self.config.head_dim
    }

    /// Allocate a KV cache for `batch` sequences of up to `max_seq_length`.
    ///
    /// Keys hold `rope_cache_length + head_size - rope_n_elem` features when
    /// a rotary cache length is given, else `head_size`. Without a length,
    /// a partial rotary span is ambiguous and rejected.
    pub fn build_kv_cache(
        &self,
        batch: usize,
        max_seq_length: usize,
        rope_cache_length: Option<usize>,
        device: &Device,
        dtype: DType,
    ) -> Result<KvCache> {
        let head_size = self.head_size();
        let heads = if self.num_query_groups() == 1 {
            1
        } else {
            self.num_heads()
        };
        let key_dim = match (self.position_embedding, rope_cache_length) {
            (PositionEmbedding::Rope, None) => {
                if self.rotary_percentage != 1.0 {
                    return Err(QuillError::MissingRopeCacheLength);
                }
                head_size
            }
            (PositionEmbedding::Rope, Some(len)) => len + head_size - self.rope_n_elem,
            (PositionEmbedding::Alibi, _) => head_size,
        };
        KvCache::new(
            (batch, heads, max_seq_length, key_dim),
            (batch, heads, max_seq_length, head_size),
            dtype,
            device,
        )
    }

    /// Install or drop the KV cache.
    pub fn set_kv_cache(&mut self, cache: Option<KvCache>) {
        self.kv_cache = cache;
    }

    /// The KV cache, if installed.
    pub fn kv_cache(&self) -> Option<&KvCache> {
        self.kv_cache.as_ref()
    }

    /// Forward pass over `x` (`[batch, T, n_embd]`).
    pub fn forward(&mut self, x: &Tensor, inputs: &LayerInputs<'_>) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let n_head = self.num_heads();
        let groups = self.num_query_groups();
        let head_size = self.head_size();
        let q_per_kv = self.config.num_queries_per_kv();

        // [B, T, groups, q_per_kv + 2, hs] -> [B, groups, q_per_kv + 2, T, hs]
        let qkv = self.attn.forward(x)?;
        let qkv = qkv
            .reshape((b, t, groups, q_per_kv + 2, head_size))?
            .permute((0, 2, 3, 1, 4))?;
        let q = qkv.narrow(2, 0, q_per_kv)?;
        let mut k = qkv.narrow(2, q_per_kv, 1)?;
        let mut v = qkv.narrow(2, q_per_kv + 1, 1)?;

        // Multi-query decoding keeps a single cached head.
        if groups != n_head && (inputs.positions.is_none() || groups != 1) {
            let shape = (b, groups, q_per_kv, t, head_size);
            k = k.broadcast_as(shape)?;
            v = v.broadcast_as(shape)?;
        }
        let q = q.reshape((b, (), t, head_size))?;
        let k = k.reshape((b, (), t, head_size))?;
        let v = v.reshape((b, (), t, head_size))?;

        let (q, k) = match inputs.rope {
            Some((cos, sin)) => (
                apply_rope_span(&q, self.rope_n_elem, cos, sin, self.rope_style)?,
                apply_rope_span(&k, self.rope_n_elem, cos, sin, self.rope_style)?,
            ),
            None => (q, k),
        };

        let (k, v) = match inputs.positions {
            Some(positions) => {
                let layer_idx = self.layer_idx;
                let cache = self.kv_cache.as_mut().ok_or_else(|| {
                    QuillError::CacheNotInitialized(format!(
                        "layer {layer_idx} has no kv cache; call set_kv_cache first"
                    ))
                })?;
                cache.update(positions.as_slice(), &k, &v)?
            }
            None => (k, v),
        };

        let y = if self.truncate_alibi_history {
            match inputs.positions {
                Some(positions) => {
                    let len = positions.max_position() + 1;
                    let mask = inputs.mask.map(|m| m.narrow_keys(len)).transpose()?;
                    let k = k.narrow(2, 0, len)?;
                    let v = v.narrow(2, 0, len)?;
                    alibi_attention(&q, &k, &v, mask.as_ref(), head_size)?
                }
                None => alibi_attention(&q, &k, &v, inputs.mask, head_size)?,
            }
        } else {
            scaled_dot_product_attention(&q, &k, &v, inputs.mask, &self.config)?
        };

        // [B, n_head, T, hs] -> [B, T, n_head * hs]
        let y = y.transpose(1, 2)?.reshape((b, t, n_head * head_size))?;
        Ok(self.proj.forward(&y)?)
    }
}

/// One decoder block.
#[derive(Debug, Clone)]
pub struct Block {
    norm_1: Norm,
    attn: CausalSelfAttention,
    /// Absent when the feed-forward reuses `norm_1`.
    norm_2: Option<Norm>,
    mlp: FeedForward,
    parallel_residual: bool,
    layer_idx: usize,
}

impl Block {
    /// Resolve the block's parameters from `vb` (`transformer.h.{i}`).
    pub fn new(config: &Config, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        if !config.parallel_residual && config.shared_attention_norm {
            return Err(QuillError::unsupported(
                "no checkpoint combines a sequential residual with a shared attention norm",
            ));
        }
        let norm_2 = if config.shared_attention_norm {
            None
        } else {
            Some(Norm::new(config, vb.pp("norm_2"))?)
        };
        Ok(Self {
            norm_1: Norm::new(config, vb.pp("norm_1"))?,
            attn: CausalSelfAttention::new(config, layer_idx, vb.pp("attn"))?,
            norm_2,
            mlp: FeedForward::new(config, vb.pp("mlp"))?,
            parallel_residual: config.parallel_residual,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// Parallel: `x + attn(norm_1(x)) + mlp(norm_2(x))`, with `norm_1(x)`
    /// feeding the MLP under a shared norm. Sequential:
    /// `h = x + attn(norm_1(x)); h + mlp(norm_2(h))`.
    pub fn forward(&mut self, x: &Tensor, inputs: &LayerInputs<'_>) -> Result<Tensor> {
        let x_normed = self.norm_1.forward(x)?;
        let attention_output = self.attn.forward(&x_normed, inputs)?;

        if self.parallel_residual {
            let mlp_input = match &self.norm_2 {
                Some(norm) => norm.forward(x)?,
                None => x_normed,
            };
            let mlp_output = self.mlp.forward(&mlp_input)?;
            Ok(((mlp_output + attention_output)? + x)?)
        } else {
            let norm_2 = self.norm_2.as_ref().ok_or_else(|| {
                QuillError::unsupported(format!("layer {} has no second norm", self.layer_idx))
            })?;
            let x = (attention_output + x)?;
            let mlp_output = self.mlp.forward(&norm_2.forward(&x)?)?;
            Ok((mlp_output + x)?)
        }
    }

    /// Get the attention module.
    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attn
    }

    /// Mutable access to the attention module.
    pub fn attention_mut(&mut self) -> &mut CausalSelfAttention {
        &mut self.attn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MlpKind;
    use candle_nn::VarMap;

    const C: usize = 8;
    const HS: usize = 4;

    fn config(n_head: usize, groups: usize) -> Config {
        Config {
            n_embd: C,
            n_head,
            head_size: Some(HS),
            n_query_groups: Some(groups),
            n_layer: 1,
            block_size: 8,
            bias: false,
            ..Default::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    fn randn(dims: (usize, usize)) -> Tensor {
        Tensor::randn(0f32, 0.5, dims, &Device::Cpu).unwrap()
    }

    /// Rows `[block * HS, (block + 1) * HS)` of `w`.
    fn head_rows(w: &Tensor, block: usize) -> Tensor {
        w.narrow(0, block * HS, HS).unwrap()
    }

    #[test]
    fn grouped_matches_duplicated_heads() {
        let (n_head, groups) = (4, 2);
        let q_per_kv = n_head / groups;
        let wq = randn((n_head * HS, C));
        let wk = randn((groups * HS, C));
        let wv = randn((groups * HS, C));
        let wo = randn((C, n_head * HS));

        // [q.., k, v] per group
        let mut grouped_rows = Vec::new();
        for g in 0..groups {
            for j in 0..q_per_kv {
                grouped_rows.push(head_rows(&wq, g * q_per_kv + j));
            }
            grouped_rows.push(head_rows(&wk, g));
            grouped_rows.push(head_rows(&wv, g));
        }
        // [q, k, v] per head, sharing the group's k/v
        let mut mha_rows = Vec::new();
        for h in 0..n_head {
            mha_rows.push(head_rows(&wq, h));
            mha_rows.push(head_rows(&wk, h / q_per_kv));
            mha_rows.push(head_rows(&wv, h / q_per_kv));
        }

        let mut gqa = CausalSelfAttention::with_projections(
            &config(n_head, groups),
            Linear::new(Tensor::cat(&grouped_rows, 0).unwrap(), None),
            Linear::new(wo.clone(), None),
            0,
        );
        let mut mha = CausalSelfAttention::with_projections(
            &config(n_head, n_head),
            Linear::new(Tensor::cat(&mha_rows, 0).unwrap(), None),
            Linear::new(wo, None),
            0,
        );

        let x = Tensor::randn(0f32, 1.0, (2, 5, C), &Device::Cpu).unwrap();
        let inputs = LayerInputs::default();
        let a = gqa.forward(&x, &inputs).unwrap();
        let b = mha.forward(&x, &inputs).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn full_groups_match_per_head_reference() {
        let n_head = 2;
        let w = randn((3 * n_head * HS, C));
        let wo = randn((C, n_head * HS));
        let mut attn = CausalSelfAttention::with_projections(
            &config(n_head, n_head),
            Linear::new(w.clone(), None),
            Linear::new(wo.clone(), None),
            0,
        );

        let x = Tensor::randn(0f32, 1.0, (3, C), &Device::Cpu).unwrap();
        let causal = crate::attention::create_causal_mask(3, 3, &Device::Cpu).unwrap();
        let mut heads = Vec::new();
        for h in 0..n_head {
            let q = x.matmul(&head_rows(&w, 3 * h).t().unwrap()).unwrap();
            let k = x.matmul(&head_rows(&w, 3 * h + 1).t().unwrap()).unwrap();
            let v = x.matmul(&head_rows(&w, 3 * h + 2).t().unwrap()).unwrap();
            let scores = (q.matmul(&k.t().unwrap()).unwrap() / (HS as f64).sqrt()).unwrap();
            let scores = (scores + &causal).unwrap();
            let weights = candle_nn::ops::softmax(&scores, 1).unwrap();
            heads.push(weights.matmul(&v).unwrap());
        }
        let expected = Tensor::cat(&heads, 1).unwrap().matmul(&wo.t().unwrap()).unwrap();

        let y = attn
            .forward(&x.unsqueeze(0).unwrap(), &LayerInputs::default())
            .unwrap()
            .squeeze(0)
            .unwrap();
        assert!(max_abs_diff(&y, &expected) < 1e-5);
    }

    #[test]
    fn output_is_causal() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut block = Block::new(&config(2, 1), 0, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 6, C), &Device::Cpu).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 3, C), &Device::Cpu).unwrap();
        let changed = Tensor::cat(&[&x.narrow(1, 0, 3).unwrap(), &noise], 1).unwrap();

        let a = block.forward(&x, &LayerInputs::default()).unwrap();
        let b = block.forward(&changed, &LayerInputs::default()).unwrap();
        let prefix_a = a.narrow(1, 0, 3).unwrap();
        let prefix_b = b.narrow(1, 0, 3).unwrap();
        assert!(max_abs_diff(&prefix_a, &prefix_b) < 1e-5);
    }

    #[test]
    fn kv_cache_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        // Multi-query keeps one cached head.
        let mqa = CausalSelfAttention::new(&config(4, 1), 0, vb.pp("a")).unwrap();
        let cache = mqa.build_kv_cache(2, 8, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(cache.key().dims(), &[2, 1, 8, HS]);

        // Grouped caches the expanded heads.
        let gqa = CausalSelfAttention::new(&config(4, 2), 0, vb.pp("b")).unwrap();
        let cache = gqa.build_kv_cache(1, 8, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(cache.key().dims(), &[1, 4, 8, HS]);
    }

    #[test]
    fn partial_rotary_needs_cache_length() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Config {
            rotary_percentage: 0.5,
            ..config(2, 2)
        };
        let attn = CausalSelfAttention::new(&config, 0, vb).unwrap();

        let err = attn.build_kv_cache(1, 8, None, &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, QuillError::MissingRopeCacheLength));

        // 2 rotated + 2 passed through
        let cache = attn.build_kv_cache(1, 8, Some(2), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(cache.key_dim(), HS);
        let cache = attn.build_kv_cache(1, 8, Some(6), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(cache.key_dim(), 8);
        assert_eq!(cache.value().dims(), &[1, 2, 8, HS]);
    }

    #[test]
    fn incremental_without_cache_fails() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut attn = CausalSelfAttention::new(&config(2, 2), 3, vb).unwrap();
        let x = Tensor::zeros((1, 1, C), DType::F32, &Device::Cpu).unwrap();
        let positions = InputPositions::from_slice(&[0], &Device::Cpu).unwrap();
        let inputs = LayerInputs {
            positions: Some(&positions),
            ..Default::default()
        };
        let err = attn.forward(&x, &inputs).unwrap_err();
        assert!(matches!(err, QuillError::CacheNotInitialized(_)));
    }

    #[test]
    fn sequential_shared_norm_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Config {
            parallel_residual: false,
            shared_attention_norm: true,
            ..config(2, 2)
        };
        let err = Block::new(&config, 0, vb).unwrap_err();
        assert!(matches!(err, QuillError::ConfigurationUnsupported(_)));
    }

    #[test]
    fn block_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Config {
            mlp_class_name: MlpKind::LLaMA,
            intermediate_size: Some(16),
            shared_attention_norm: true,
            add_qkv_bias: Some(true),
            ..config(2, 1)
        };
        Block::new(&config, 0, vb.pp("transformer.h.0")).unwrap();

        let data = varmap.data().lock().unwrap();
        // (2 + 2 * 1) * 4 = 16
        assert_eq!(data.get("transformer.h.0.attn.attn.weight").unwrap().dims(), &[16, C]);
        assert!(data.contains_key("transformer.h.0.attn.attn.bias"));
        assert!(!data.contains_key("transformer.h.0.attn.proj.bias"));
        assert!(data.contains_key("transformer.h.0.norm_1.weight"));
        assert!(!data.contains_key("transformer.h.0.norm_2.weight"));
        assert!(data.contains_key("transformer.h.0.mlp.fc_1.weight"));
    }

    #[test]
    fn sequential_residual_forward() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = Config {
            parallel_residual: false,
            norm_class_name: crate::model::NormKind::RmsNorm,
            ..config(2, 2)
        };
        let mut block = Block::new(&config, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, C), &Device::Cpu).unwrap();
        let y = block.forward(&x, &LayerInputs::default()).unwrap();
        assert_eq!(y.dims(), &[1, 4, C]);
    }
}
