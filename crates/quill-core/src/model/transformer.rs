//! Decoder-only transformer.

use super::{
    AlibiBias, Block, Config, InputPositions, LayerInputs, LmHead, Norm, PositionEmbedding,
    RotaryEmbedding,
};
use crate::attention::AttentionMask;
use crate::cache::MaskCache;
use crate::error::{QuillError, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

/// Positional encoding owned by the model.
#[derive(Debug, Clone)]
enum Positional {
    Rope(RotaryEmbedding),
    Alibi(AlibiBias),
}

/// A decoder-only transformer for inference.
///
/// Owns the embedding table, the blocks, the final norm and the output
/// head, plus the shared positional tables and causal mask. Calls that
/// touch caches take `&mut self`; share a model across threads behind a
/// lock.
///
/// A clone shares the parameters but starts without caches.
#[derive(Debug)]
pub struct Transformer {
    config: Config,
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: Norm,
    lm_head: LmHead,
    /// Active sequence length, at most `config.block_size`.
    max_seq_length: usize,
    positional: Positional,
    mask_cache: MaskCache,
    device: Device,
    dtype: DType,
}

impl Clone for Transformer {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            wte: self.wte.clone(),
            blocks: self.blocks.clone(),
            ln_f: self.ln_f.clone(),
            lm_head: self.lm_head.clone(),
            max_seq_length: self.max_seq_length,
            positional: self.positional.clone(),
            mask_cache: MaskCache::new(),
            device: self.device.clone(),
            dtype: self.dtype,
        }
    }
}

impl Transformer {
    /// Validate `config` and resolve every parameter from `vb`.
    ///
    /// The active length starts at `block_size`; positional tables are
    /// built on first use.
    pub fn new(config: Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let vb_t = vb.pp("transformer");
        let wte = embedding(config.padded_vocab_size(), config.n_embd, vb_t.pp("wte"))?;
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&config, i, vb_t.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = Norm::new(&config, vb_t.pp("ln_f"))?;
        let lm_head = LmHead::new(&config, vb.pp("lm_head"))?;

        let positional = match config.position_emb_type {
            PositionEmbedding::Rope => Positional::Rope(RotaryEmbedding::new(&config)),
            PositionEmbedding::Alibi => {
                Positional::Alibi(AlibiBias::new(config.n_head, config.block_size))
            }
        };

        tracing::debug!(
            name = %config.name,
            n_layer = config.n_layer,
            n_head = config.n_head,
            n_query_groups = config.n_query_groups(),
            head_size = config.head_size(),
            "transformer initialized"
        );

        Ok(Self {
            max_seq_length: config.block_size,
            config,
            wte,
            blocks,
            ln_f,
            lm_head,
            positional,
            mask_cache: MaskCache::new(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Get model configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Active sequence length.
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Device the parameters were loaded on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter precision.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The blocks, in order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Whether the causal mask cache is built.
    pub fn has_kv_cache(&self) -> bool {
        self.mask_cache.is_built()
    }

    /// Change the active sequence length.
    ///
    /// Rebuilds the positional table when its length changes or when it
    /// has never been built.
    pub fn set_max_seq_length(&mut self, value: usize) -> Result<()> {
        if value > self.config.block_size {
            return Err(QuillError::SequenceTooLong {
                requested: value,
                limit: self.config.block_size,
            });
        }
        self.max_seq_length = value;
        match &mut self.positional {
            Positional::Rope(rope) => rope.resize(value, &self.device),
            Positional::Alibi(alibi) => alibi.resize(value, &self.device),
        }
    }

    /// Switch the output head between training and inference behavior.
    pub fn set_training(&mut self, training: bool) {
        self.lm_head.set_training(training);
    }

    /// Mark the positional table stale; it is rebuilt on next use.
    pub fn reset_rope_cache(&mut self) {
        match &mut self.positional {
            Positional::Rope(rope) => rope.invalidate(),
            Positional::Alibi(alibi) => alibi.invalidate(),
        }
    }

    /// Allocate every layer's KV cache for `batch` sequences of the active
    /// length and build the causal mask cache.
    ///
    /// `rope_cache_length` defaults to the width of the built rotary table.
    pub fn set_kv_cache(
        &mut self,
        batch: usize,
        rope_cache_length: Option<usize>,
        device: &Device,
        dtype: DType,
    ) -> Result<()> {
        let rope_cache_length = match (&self.positional, rope_cache_length) {
            (_, Some(len)) => Some(len),
            (Positional::Rope(rope), None) => rope.built_width(),
            (Positional::Alibi(_), None) => None,
        };

        let max_seq_length = self.max_seq_length;
        for block in &mut self.blocks {
            let cache = block.attention().build_kv_cache(
                batch,
                max_seq_length,
                rope_cache_length,
                device,
                dtype,
            )?;
            block.attention_mut().set_kv_cache(Some(cache));
        }
        tracing::debug!(
            batch,
            max_seq_length,
            n_layer = self.blocks.len(),
            ?dtype,
            "kv caches allocated"
        );

        self.mask_cache.ensure(max_seq_length, device)
    }

    /// Drop the mask cache and every KV cache. Idempotent.
    pub fn clear_kv_cache(&mut self) {
        self.mask_cache.clear();
        for block in &mut self.blocks {
            block.attention_mut().set_kv_cache(None);
        }
    }

    /// Compute logits `[batch, T, padded_vocab_size]` for `idx` (`[batch, T]`).
    ///
    /// With `input_pos` (one ascending absolute position per token) the call
    /// decodes incrementally through the KV caches; without it, it is a
    /// full pass over positions `0..T`.
    pub fn forward(&mut self, idx: &Tensor, input_pos: Option<&Tensor>) -> Result<Tensor> {
        let (_, t) = idx.dims2()?;
        if t > self.max_seq_length {
            return Err(QuillError::SequenceTooLong {
                requested: t,
                limit: self.max_seq_length,
            });
        }
        let device = idx.device().clone();

        let positions = match input_pos {
            Some(pos) => {
                let positions = InputPositions::new(pos, &device)?;
                if positions.len() != t {
                    return Err(QuillError::ShapeMismatch(format!(
                        "{} positions for {t} tokens",
                        positions.len()
                    )));
                }
                if positions.max_position() >= self.max_seq_length {
                    return Err(QuillError::SequenceTooLong {
                        requested: positions.max_position() + 1,
                        limit: self.max_seq_length,
                    });
                }
                Some(positions)
            }
            None => None,
        };

        let allowed = match &positions {
            Some(positions) => self.mask_cache.rows(positions, &device)?,
            None => None,
        };

        let (rope, mask) = match (&mut self.positional, &positions, allowed) {
            (Positional::Rope(rope), None, _) => (Some(rope.leading(t, &device)?), None),
            (Positional::Rope(rope), Some(positions), Some(allowed)) => (
                Some(rope.at(positions, &device)?),
                Some(AttentionMask::Boolean(allowed)),
            ),
            (Positional::Alibi(alibi), None, _) => {
                (None, Some(AttentionMask::Additive(alibi.full_pass(t, &device)?)))
            }
            (Positional::Alibi(alibi), Some(positions), Some(allowed)) => (
                None,
                Some(AttentionMask::Additive(alibi.incremental(&allowed, positions, &device)?)),
            ),
            (_, Some(_), None) => {
                return Err(QuillError::CacheNotInitialized(
                    "mask cache is not built; call set_kv_cache first".to_string(),
                ))
            }
        };

        let inputs = LayerInputs {
            rope: rope.as_ref().map(|(cos, sin)| (cos, sin)),
            mask: mask.as_ref(),
            positions: positions.as_ref(),
        };

        let mut x = self.wte.forward(idx)?;
        if self.config.scale_embeddings {
            x = (x * (self.config.n_embd as f64).sqrt())?;
        }
        for block in &mut self.blocks {
            x = block.forward(&x, &inputs)?;
        }
        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MlpKind, NormKind, RopeStyle};
    use candle_nn::VarMap;

    fn scenario() -> Config {
        Config {
            n_embd: 8,
            n_head: 2,
            head_size: Some(4),
            n_layer: 1,
            block_size: 8,
            vocab_size: 16,
            padded_vocab_size: Some(16),
            rotary_percentage: 1.0,
            rope_base: 10000.0,
            rope_condense_ratio: 1,
            ..Default::default()
        }
    }

    fn build(config: Config) -> (VarMap, Transformer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Transformer::new(config, vb).unwrap();
        (varmap, model)
    }

    fn tokens(ids: &[u32]) -> Tensor {
        Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn positions(pos: &[u32]) -> Tensor {
        Tensor::new(pos, &Device::Cpu).unwrap()
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

    /// Full pass over `ids` against one-token-at-a-time incremental decoding.
    fn assert_incremental_matches_full(
        model: &mut Transformer,
        ids: &[u32],
        rope_cache_length: Option<usize>,
    ) {
        let full = model.forward(&tokens(ids), None).unwrap();

        model
            .set_kv_cache(1, rope_cache_length, &Device::Cpu, DType::F32)
            .unwrap();
        for (i, &id) in ids.iter().enumerate() {
            let step = model
                .forward(&tokens(&[id]), Some(&positions(&[i as u32])))
                .unwrap();
            let expected = full.narrow(1, i, 1).unwrap();
            let diff = max_abs_diff(&step, &expected);
            assert!(diff < 1e-4, "position {i}: diff {diff}");
        }
        model.clear_kv_cache();
    }

    #[test]
    fn incremental_matches_full_pass() {
        let (_varmap, mut model) = build(scenario());
        assert_incremental_matches_full(&mut model, &[1, 2, 3], None);
    }

    #[test]
    fn logits_shape() {
        let (_varmap, mut model) = build(Config {
            vocab_size: 10,
            padded_vocab_size: None,
            padding_multiple: 4,
            ..scenario()
        });
        let ids = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 12]);
    }

    #[test]
    fn active_length_above_block_size_fails() {
        let (_varmap, mut model) = build(scenario());
        let err = model.set_max_seq_length(9).unwrap_err();
        assert!(matches!(
            err,
            QuillError::SequenceTooLong {
                requested: 9,
                limit: 8
            }
        ));
        assert_eq!(model.max_seq_length(), 8);
    }

    #[test]
    fn forward_longer_than_active_length_fails() {
        let (_varmap, mut model) = build(scenario());
        model.set_max_seq_length(4).unwrap();
        let err = model.forward(&tokens(&[1, 2, 3, 4, 5]), None).unwrap_err();
        assert!(matches!(err, QuillError::SequenceTooLong { .. }));
    }

    #[test]
    fn partial_rotary_needs_cache_length_until_table_built() {
        let (_varmap, mut model) = build(Config {
            rotary_percentage: 0.5,
            ..scenario()
        });
        let err = model
            .set_kv_cache(1, None, &Device::Cpu, DType::F32)
            .unwrap_err();
        assert!(matches!(err, QuillError::MissingRopeCacheLength));

        // Establishing the active length builds the table it defaults to.
        model.set_max_seq_length(8).unwrap();
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let cache = model.blocks()[0].attention().kv_cache().unwrap();
        assert_eq!(cache.key_dim(), 4);
    }

    #[test]
    fn partial_rotary_incremental() {
        let (_varmap, mut model) = build(Config {
            rotary_percentage: 0.5,
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[4, 0, 9, 2], Some(2));
    }

    #[test]
    fn incremental_before_setup_fails() {
        let (_varmap, mut model) = build(scenario());
        let err = model
            .forward(&tokens(&[1]), Some(&positions(&[0])))
            .unwrap_err();
        assert!(matches!(err, QuillError::CacheNotInitialized(_)));
    }

    #[test]
    fn negative_positions_rejected() {
        let (_varmap, mut model) = build(scenario());
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let pos = Tensor::new(&[-1i64], &Device::Cpu).unwrap();
        let err = model.forward(&tokens(&[1]), Some(&pos)).unwrap_err();
        assert!(matches!(err, QuillError::ShapeMismatch(_)));
    }

    #[test]
    fn position_count_must_match_tokens() {
        let (_varmap, mut model) = build(scenario());
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let err = model
            .forward(&tokens(&[1, 2]), Some(&positions(&[0])))
            .unwrap_err();
        assert!(matches!(err, QuillError::ShapeMismatch(_)));
    }

    #[test]
    fn prefill_then_decode() {
        let (_varmap, mut model) = build(scenario());
        let ids = [5, 3, 7, 1];
        let full = model.forward(&tokens(&ids), None).unwrap();

        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let prefill = model
            .forward(&tokens(&ids[..3]), Some(&positions(&[0, 1, 2])))
            .unwrap();
        assert!(max_abs_diff(&prefill, &full.narrow(1, 0, 3).unwrap()) < 1e-4);

        let step = model
            .forward(&tokens(&ids[3..]), Some(&positions(&[3])))
            .unwrap();
        assert!(max_abs_diff(&step, &full.narrow(1, 3, 1).unwrap()) < 1e-4);
    }

    #[test]
    fn clear_kv_cache_is_idempotent() {
        let (_varmap, mut model) = build(scenario());
        model.clear_kv_cache();
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        assert!(model.has_kv_cache());
        model.clear_kv_cache();
        model.clear_kv_cache();
        assert!(!model.has_kv_cache());
        assert!(model.blocks()[0].attention().kv_cache().is_none());
    }

    #[test]
    fn clone_does_not_share_kv_cache() {
        let (_varmap, mut model) = build(scenario());
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let mut copy = model.clone();
        assert!(!copy.has_kv_cache());
        assert!(copy.blocks()[0].attention().kv_cache().is_none());

        copy.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        let cached_sum = |m: &Transformer| -> f32 {
            m.blocks()[0]
                .attention()
                .kv_cache()
                .unwrap()
                .key()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap()
        };

        model
            .forward(&tokens(&[1, 2, 3]), Some(&positions(&[0, 1, 2])))
            .unwrap();
        assert!(cached_sum(&model) > 0.0);
        assert_eq!(cached_sum(&copy), 0.0);

        // The copy decodes its own history.
        let ids = [4, 5, 6, 7];
        let full = copy.forward(&tokens(&ids), None).unwrap();
        let step = copy
            .forward(&tokens(&ids), Some(&positions(&[0, 1, 2, 3])))
            .unwrap();
        assert!(max_abs_diff(&step, &full) < 1e-4);
    }

    #[test]
    fn output_is_causal() {
        let (_varmap, mut model) = build(scenario());
        let a = model.forward(&tokens(&[1, 2, 3, 4, 5]), None).unwrap();
        let b = model.forward(&tokens(&[1, 2, 3, 9, 0]), None).unwrap();
        let diff = max_abs_diff(&a.narrow(1, 0, 3).unwrap(), &b.narrow(1, 0, 3).unwrap());
        assert!(diff < 1e-5);
    }

    #[test]
    fn multi_query_incremental() {
        let (_varmap, mut model) = build(Config {
            n_head: 4,
            head_size: Some(2),
            n_query_groups: Some(1),
            n_layer: 2,
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[3, 1, 4, 1, 5], None);
        model.set_kv_cache(1, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(model.blocks()[0].attention().kv_cache().unwrap().num_heads(), 1);
    }

    #[test]
    fn grouped_query_incremental() {
        let (_varmap, mut model) = build(Config {
            n_head: 4,
            head_size: Some(2),
            n_query_groups: Some(2),
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[3, 1, 4, 1, 5], None);
    }

    #[test]
    fn chatglm_rotation_incremental() {
        let (_varmap, mut model) = build(Config {
            rope_type: RopeStyle::ChatGlm,
            mlp_class_name: MlpKind::ChatGlm2,
            intermediate_size: Some(16),
            norm_class_name: NormKind::RmsNorm,
            parallel_residual: false,
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[2, 7, 1], None);
    }

    #[test]
    fn alibi_incremental() {
        let (_varmap, mut model) = build(Config {
            position_emb_type: PositionEmbedding::Alibi,
            parallel_residual: false,
            norm_class_name: NormKind::RmsNorm,
            mlp_class_name: MlpKind::LLaMA,
            intermediate_size: Some(16),
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[6, 2, 8, 3], None);
    }

    #[test]
    fn alibi_history_truncation_incremental() {
        let (_varmap, mut model) = build(Config {
            name: "Baichuan2-13B-Chat".to_string(),
            position_emb_type: PositionEmbedding::Alibi,
            parallel_residual: false,
            bias: false,
            norm_class_name: NormKind::RmsNorm,
            mlp_class_name: MlpKind::LLaMA,
            intermediate_size: Some(16),
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[6, 2, 8, 3], None);
    }

    #[test]
    fn shared_norm_and_scaled_embeddings() {
        let (_varmap, mut model) = build(Config {
            shared_attention_norm: true,
            scale_embeddings: true,
            mlp_class_name: MlpKind::Gemma,
            intermediate_size: Some(16),
            norm_class_name: NormKind::RmsNorm,
            rmsnorm_add_unit_offset: true,
            ..scenario()
        });
        assert_incremental_matches_full(&mut model, &[1, 2, 3], None);
    }

    #[test]
    fn mixture_of_experts_models() {
        for config in [
            Config {
                mlp_class_name: MlpKind::LLaMAMoE,
                intermediate_size: Some(8),
                n_expert: 4,
                n_expert_per_token: 2,
                ..scenario()
            },
            Config {
                mlp_class_name: MlpKind::Qwen2MoE,
                moe_intermediate_size: Some(8),
                shared_expert_intermediate_size: Some(12),
                n_expert: 4,
                n_expert_per_token: 2,
                norm_topk_prob: true,
                ..scenario()
            },
        ] {
            let (_varmap, mut model) = build(config);
            assert_incremental_matches_full(&mut model, &[9, 8, 7], None);
        }
    }

    #[test]
    fn norm_head_model() {
        let (_varmap, mut model) = build(Config {
            lm_head_type: crate::model::LmHeadKind::NormHead,
            ..scenario()
        });
        let inference = model.forward(&tokens(&[1, 2]), None).unwrap();
        model.set_training(true);
        let training = model.forward(&tokens(&[1, 2]), None).unwrap();
        assert!(max_abs_diff(&inference, &training) < 1e-5);
    }

    #[test]
    fn unsupported_topology_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = Transformer::new(
            Config {
                parallel_residual: false,
                shared_attention_norm: true,
                ..scenario()
            },
            vb,
        )
        .unwrap_err();
        assert!(matches!(err, QuillError::ConfigurationUnsupported(_)));
        // Nothing was allocated.
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn reset_rope_cache_rebuilds() {
        let (_varmap, mut model) = build(scenario());
        let before = model.forward(&tokens(&[1, 2, 3]), None).unwrap();
        model.reset_rope_cache();
        let after = model.forward(&tokens(&[1, 2, 3]), None).unwrap();
        assert!(max_abs_diff(&before, &after) < 1e-6);
    }

    #[test]
    fn parameter_names() {
        let (varmap, _model) = build(Config {
            lm_head_bias: true,
            ..scenario()
        });
        let data = varmap.data().lock().unwrap();
        for name in [
            "transformer.wte.weight",
            "transformer.h.0.norm_1.weight",
            "transformer.h.0.norm_1.bias",
            "transformer.h.0.attn.attn.weight",
            "transformer.h.0.attn.proj.weight",
            "transformer.h.0.norm_2.weight",
            "transformer.h.0.mlp.fc.weight",
            "transformer.h.0.mlp.proj.weight",
            "transformer.ln_f.weight",
            "lm_head.weight",
            "lm_head.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data["transformer.wte.weight"].dims(), &[16, 8]);
    }
}
