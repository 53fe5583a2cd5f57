//! Autoregressive generation.

use anyhow::Result;
use candle_core::{DType, Tensor};
use parking_lot::{Mutex, MutexGuard};
use quill_core::model::Transformer;
use quill_core::QuillError;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

/// Token sampler over one row of logits.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f64,
    top_k: Option<usize>,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler. Temperature 0 is greedy.
    pub fn new(temperature: f64, top_k: Option<usize>, seed: u64) -> Self {
        Self {
            temperature,
            top_k,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick a token id from `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            anyhow::bail!("cannot sample from empty logits");
        }

        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        // Descending; stable so ties keep the lower id first.
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.temperature <= 0.0 {
            return Ok(candidates[0].0 as u32);
        }
        if let Some(k) = self.top_k {
            candidates.truncate(k.max(1));
        }

        let max = candidates[0].1 as f64;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|&(_, logit)| ((logit as f64 - max) / self.temperature).exp())
            .collect();
        let dist = WeightedIndex::new(&weights)?;
        Ok(candidates[dist.sample(&mut self.rng)].0 as u32)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-sequence token was produced.
    EndOfSequence,
    /// `max_new_tokens` were produced.
    MaxTokens,
}

/// Result of a generation.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Generated token ids, excluding the prompt.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Why generation stopped.
    pub stop_reason: StopReason,
}

/// Drives a [`Transformer`] through prefill and one-token decode steps.
///
/// The model sits behind a mutex since every forward call mutates its
/// caches.
pub struct Generator {
    model: Mutex<Transformer>,
}

impl Generator {
    /// Wrap a model.
    pub fn new(model: Transformer) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    /// Lock the model.
    pub fn model(&self) -> MutexGuard<'_, Transformer> {
        self.model.lock()
    }

    /// Unwrap the model.
    pub fn into_inner(self) -> Transformer {
        self.model.into_inner()
    }

    /// Start a generation request from `prompt` token ids.
    pub fn generate(&self, prompt: &[u32]) -> GenerateRequest<'_> {
        GenerateRequest {
            generator: self,
            prompt: prompt.to_vec(),
            max_new_tokens: 32,
            temperature: 0.0,
            top_k: None,
            eos_token: None,
            seed: 0,
        }
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator").finish_non_exhaustive()
    }
}

/// A generation request.
#[derive(Debug)]
pub struct GenerateRequest<'a> {
    generator: &'a Generator,
    prompt: Vec<u32>,
    max_new_tokens: usize,
    temperature: f64,
    top_k: Option<usize>,
    eos_token: Option<u32>,
    seed: u64,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    /// Set temperature. 0 samples greedily.
    pub fn temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    /// Sample only among the `k` most likely tokens.
    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    /// Stop after this token is produced.
    pub fn eos_token(mut self, token: u32) -> Self {
        self.eos_token = Some(token);
        self
    }

    /// Seed the sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Run the generation. Caches are torn down afterwards, also on error.
    pub fn execute(self) -> Result<GenerateResult> {
        if self.prompt.is_empty() {
            return Err(QuillError::ShapeMismatch("prompt is empty".to_string()).into());
        }

        let mut model = self.generator.model.lock();
        let limit = model.max_seq_length();
        // The last sampled token is returned but never fed back.
        let requested = self.prompt.len() + self.max_new_tokens.saturating_sub(1);
        if requested > limit {
            return Err(QuillError::SequenceTooLong { requested, limit }.into());
        }

        tracing::info!(
            prompt_tokens = self.prompt.len(),
            max_new_tokens = self.max_new_tokens,
            temperature = self.temperature,
            "generation started"
        );
        let start = Instant::now();

        let outcome = self.decode(&mut model);
        model.clear_kv_cache();

        if let Ok(result) = &outcome {
            tracing::info!(
                generated = result.num_generated_tokens,
                stop_reason = ?result.stop_reason,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "generation finished"
            );
        }
        outcome
    }

    fn decode(&self, model: &mut Transformer) -> Result<GenerateResult> {
        let num_prompt_tokens = self.prompt.len();
        if self.max_new_tokens == 0 {
            return Ok(GenerateResult {
                tokens: Vec::new(),
                num_prompt_tokens,
                num_generated_tokens: 0,
                stop_reason: StopReason::MaxTokens,
            });
        }

        let device = model.device().clone();
        let vocab_size = model.config().vocab_size;

        // Builds the positional table the cache layout defaults to.
        let active = model.max_seq_length();
        model.set_max_seq_length(active)?;
        let dtype = model.dtype();
        model.set_kv_cache(1, None, &device, dtype)?;

        let mut sampler = Sampler::new(self.temperature, self.top_k, self.seed);

        let prompt = Tensor::new(self.prompt.as_slice(), &device)?.unsqueeze(0)?;
        let positions = Tensor::arange(0u32, num_prompt_tokens as u32, &device)?;
        let logits = model.forward(&prompt, Some(&positions))?;
        let mut next = sampler.sample(&last_row(&logits, vocab_size)?)?;

        let mut tokens = Vec::with_capacity(self.max_new_tokens);
        let stop_reason = loop {
            tokens.push(next);
            if self.eos_token == Some(next) {
                break StopReason::EndOfSequence;
            }
            if tokens.len() == self.max_new_tokens {
                break StopReason::MaxTokens;
            }

            let pos = (num_prompt_tokens + tokens.len() - 1) as u32;
            let input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
            let logits = model.forward(&input, Some(&Tensor::new(&[pos], &device)?))?;
            next = sampler.sample(&last_row(&logits, vocab_size)?)?;
            tracing::trace!(pos, token = next, "decoded");
        };

        Ok(GenerateResult {
            num_generated_tokens: tokens.len(),
            tokens,
            num_prompt_tokens,
            stop_reason,
        })
    }
}

/// Logits of the last position, without vocabulary padding.
fn last_row(logits: &Tensor, vocab_size: usize) -> Result<Vec<f32>> {
    let (_, t, width) = logits.dims3()?;
    let row = logits
        .narrow(1, t - 1, 1)?
        .flatten_all()?
        .narrow(0, 0, vocab_size.min(width))?
        .to_dtype(DType::F32)?;
    Ok(row.to_vec1()?)
}
