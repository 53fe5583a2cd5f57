//! Generation example.
//!
//! Builds a small randomly initialized model and generates a few tokens
//! greedily and with sampling. Set `RUST_LOG=quill_core=debug` to watch the
//! caches being built and torn down.

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use quill::model::{MlpKind, NormKind};
use quill::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config {
        name: "tiny-llama".to_string(),
        block_size: 64,
        vocab_size: 100,
        padding_multiple: 64,
        n_layer: 2,
        n_head: 4,
        n_query_groups: Some(2),
        n_embd: 32,
        intermediate_size: Some(86),
        parallel_residual: false,
        bias: false,
        norm_class_name: NormKind::RmsNorm,
        mlp_class_name: MlpKind::LLaMA,
        ..Default::default()
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let generator = Generator::new(Transformer::new(config, vb)?);

    println!("Model initialized");

    let prompt = [1, 17, 42, 7];

    let greedy = generator.generate(&prompt).max_new_tokens(12).execute()?;
    println!("Greedy ({:?}): {:?}", greedy.stop_reason, greedy.tokens);

    let sampled = generator
        .generate(&prompt)
        .max_new_tokens(12)
        .temperature(0.8)
        .top_k(20)
        .seed(2024)
        .execute()?;
    println!("Sampled ({:?}): {:?}", sampled.stop_reason, sampled.tokens);

    Ok(())
}
