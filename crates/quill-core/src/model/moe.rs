//! Mixture-of-experts feed-forward layers.
//!
//! Routing happens on the host: gate logits are pulled out of the tensor,
//! sorted per token, and turned into per-expert token lists. Each expert
//! then runs once on the tokens routed to it and its weighted output is
//! scattered back into a zero-initialized buffer. Experts with no tokens
//! are skipped.

use super::mlp::GatedMlp;
use super::Config;
use crate::error::{QuillError, Result};
use candle_core::{DType, Tensor};
use candle_nn::ops::sigmoid;
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

/// How gate logits turn into expert weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Pick the top-k logits, then softmax over just those.
    SoftmaxSelected,
    /// Softmax over all experts, then pick the top-k probabilities.
    SoftmaxAll {
        /// Rescale the selected probabilities to sum to 1.
        renormalize: bool,
    },
}

/// Per-expert token assignment for one forward call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    tokens: Vec<Vec<u32>>,
    weights: Vec<Vec<f32>>,
}

impl Routing {
    /// Number of experts.
    pub fn n_expert(&self) -> usize {
        self.tokens.len()
    }

    /// Tokens routed to `expert`, ascending.
    pub fn tokens_for(&self, expert: usize) -> &[u32] {
        &self.tokens[expert]
    }

    /// Weights matching [`tokens_for`](Self::tokens_for).
    pub fn weights_for(&self, expert: usize) -> &[f32] {
        &self.weights[expert]
    }

    /// Number of experts that received at least one token.
    pub fn active_experts(&self) -> usize {
        self.tokens.iter().filter(|t| !t.is_empty()).count()
    }

    /// Sum of applied weights per token.
    pub fn weight_per_token(&self, n_tokens: usize) -> Vec<f32> {
        let mut sums = vec![0f32; n_tokens];
        for (tokens, weights) in self.tokens.iter().zip(&self.weights) {
            for (&t, &w) in tokens.iter().zip(weights) {
                sums[t as usize] += w;
            }
        }
        sums
    }
}

fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Route each row of `logits` (`[tokens][experts]`) to its top `top_k`
/// experts.
///
/// Ties keep ascending expert order.
pub fn route_tokens(logits: &[Vec<f32>], top_k: usize, policy: RoutingPolicy) -> Routing {
    let n_expert = logits.first().map(Vec::len).unwrap_or(0);
    let mut routing = Routing {
        tokens: vec![Vec::new(); n_expert],
        weights: vec![Vec::new(); n_expert],
    };

    for (token, row) in logits.iter().enumerate() {
        let scores = match policy {
            RoutingPolicy::SoftmaxSelected => row.clone(),
            RoutingPolicy::SoftmaxAll { .. } => softmax(row),
        };
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&i, &j| scores[j].total_cmp(&scores[i]));
        let selected = &order[..top_k.min(order.len())];

        let picked: Vec<f32> = selected.iter().map(|&e| scores[e]).collect();
        let weights = match policy {
            RoutingPolicy::SoftmaxSelected => softmax(&picked),
            RoutingPolicy::SoftmaxAll { renormalize: true } => {
                let sum: f32 = picked.iter().sum();
                picked.iter().map(|w| w / sum).collect()
            }
            RoutingPolicy::SoftmaxAll { renormalize: false } => picked,
        };

        for (&expert, weight) in selected.iter().zip(weights) {
            routing.tokens[expert].push(token as u32);
            routing.weights[expert].push(weight);
        }
    }
    routing
}

/// Run `experts` over the rows of `x` (`[tokens, n_embd]`) as `routing`
/// assigns them and sum the weighted outputs per token.
fn dispatch(x: &Tensor, routing: &Routing, experts: &[GatedMlp]) -> Result<Tensor> {
    if routing.n_expert() != experts.len() {
        return Err(QuillError::ShapeMismatch(format!(
            "routing over {} experts for a bank of {}",
            routing.n_expert(),
            experts.len()
        )));
    }
    let mut ys = x.zeros_like()?;
    for (expert_idx, expert) in experts.iter().enumerate() {
        let tokens = routing.tokens_for(expert_idx);
        if tokens.is_empty() {
            continue;
        }
        let idx = Tensor::new(tokens, x.device())?;
        let weights = Tensor::new(routing.weights_for(expert_idx), x.device())?
            .to_dtype(x.dtype())?
            .reshape(((), 1))?;
        let out = expert.forward(&x.index_select(&idx, 0)?)?;
        ys = ys.index_add(&idx, &out.broadcast_mul(&weights)?, 0)?;
    }
    Ok(ys)
}

fn gate_logits(gate: &Linear, x: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(gate.forward(x)?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

fn load_experts(config: &Config, intermediate: usize, vb: VarBuilder) -> Result<Vec<GatedMlp>> {
    (0..config.n_expert)
        .map(|j| GatedMlp::llama(config, Some(intermediate), vb.pp(j)))
        .collect()
}

/// LLaMA-style mixture of experts (Mixtral).
#[derive(Debug, Clone)]
pub struct LLaMAMoE {
    gate: Linear,
    experts: Vec<GatedMlp>,
    top_k: usize,
}

impl LLaMAMoE {
    /// Resolve `gate` and `experts.{j}` from `vb`.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate: linear_no_bias(config.n_embd, config.n_expert, vb.pp("gate"))?,
            experts: load_experts(config, config.intermediate_size()?, vb.pp("experts"))?,
            top_k: config.n_expert_per_token,
        })
    }

    /// Routing decision for rows of `x` (`[tokens, n_embd]`).
    pub fn route(&self, x: &Tensor) -> Result<Routing> {
        let logits = gate_logits(&self.gate, x)?;
        Ok(route_tokens(&logits, self.top_k, RoutingPolicy::SoftmaxSelected))
    }

    /// Forward pass over `(batch, T, n_embd)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let x = x.reshape((b * t, c))?;
        let routing = self.route(&x)?;
        tracing::trace!(tokens = b * t, active = routing.active_experts(), "moe routing");
        Ok(dispatch(&x, &routing, &self.experts)?.reshape((b, t, c))?)
    }
}

/// Qwen2-style mixture of experts with a gated shared expert.
#[derive(Debug, Clone)]
pub struct Qwen2MoE {
    gate: Linear,
    experts: Vec<GatedMlp>,
    shared_expert: GatedMlp,
    shared_expert_gate: Linear,
    top_k: usize,
    norm_topk_prob: bool,
}

impl Qwen2MoE {
    /// Resolve `gate`, `experts.{j}`, `shared_expert` and
    /// `shared_expert_gate` from `vb`.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let missing = |field: &str| QuillError::unsupported(format!("Qwen2MoE requires {field}"));
        let expert_size = config
            .moe_intermediate_size
            .ok_or_else(|| missing("moe_intermediate_size"))?;
        let shared_size = config
            .shared_expert_intermediate_size
            .ok_or_else(|| missing("shared_expert_intermediate_size"))?;
        Ok(Self {
            gate: linear_no_bias(config.n_embd, config.n_expert, vb.pp("gate"))?,
            experts: load_experts(config, expert_size, vb.pp("experts"))?,
            shared_expert: GatedMlp::llama(config, Some(shared_size), vb.pp("shared_expert"))?,
            shared_expert_gate: linear_no_bias(config.n_embd, 1, vb.pp("shared_expert_gate"))?,
            top_k: config.n_expert_per_token,
            norm_topk_prob: config.norm_topk_prob,
        })
    }

    /// Routing decision for rows of `x` (`[tokens, n_embd]`).
    pub fn route(&self, x: &Tensor) -> Result<Routing> {
        let logits = gate_logits(&self.gate, x)?;
        let policy = RoutingPolicy::SoftmaxAll {
            renormalize: self.norm_topk_prob,
        };
        Ok(route_tokens(&logits, self.top_k, policy))
    }

    /// Forward pass over `(batch, T, n_embd)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let x = x.reshape((b * t, c))?;
        let routing = self.route(&x)?;
        tracing::trace!(tokens = b * t, active = routing.active_experts(), "moe routing");
        let sparse = dispatch(&x, &routing, &self.experts)?;

        let shared = self.shared_expert.forward(&x)?;
        let shared_gate = sigmoid(&self.shared_expert_gate.forward(&x)?)?;
        let shared = shared.broadcast_mul(&shared_gate)?;

        Ok((sparse + shared)?.reshape((b, t, c))?)
    }
}
