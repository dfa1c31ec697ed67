//! Tiny seeded models for tests
//!
//! Every architecture gets a 3-4 layer, 16-wide model with deterministic
//! random weights and a word-level tokenizer, so the full pipeline runs on
//! CPU in milliseconds without downloads. Fixture constructors panic on
//! failure.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokenizers::Tokenizer;

use crate::catalog::CatalogEntry;
use crate::forward_gemma2::{Gemma2Config, LensGemma2};
use crate::forward_gpt2::{Gpt2Config, LensGpt2};
use crate::forward_llama::{LensLlama, LlamaConfig, LlamaVariant};
use crate::model::{LensBackend, LensModel, ModelArchitecture};
use crate::registry::ModelLoader;

/// Tokenizer vocabulary, in id order
pub const TINY_WORDS: &[&str] = &[
    "[UNK]", "<|endoftext|>", "the", "cat", "sat", "on", "mat", "a", "dog", "ran", "bird",
    "hi", "yo", "hello", "good", "bad", "great", "i", "think", "is", "and", "to", "in",
    "happy", "sad", "love", "hate", "user", "assistant", ".", ",", "!",
];

pub const TINY_VOCAB: usize = TINY_WORDS.len();

const D_MODEL: usize = 16;
const D_FF: usize = 32;
const N_CTX: usize = 64;

/// Word-level tokenizer over [`TINY_WORDS`], whitespace pre-tokenized
pub fn tiny_tokenizer_json() -> String {
    let vocab: serde_json::Map<String, serde_json::Value> = TINY_WORDS
        .iter()
        .enumerate()
        .map(|(id, word)| ((*word).to_string(), json!(id)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    })
    .to_string()
}

pub fn tiny_tokenizer() -> Tokenizer {
    tiny_tokenizer_json()
        .parse()
        .unwrap_or_else(|e| panic!("tiny tokenizer: {e}"))
}

/// HuggingFace-style `config.json` for the tiny model of `arch`
pub fn tiny_config_json(arch: ModelArchitecture) -> serde_json::Value {
    match arch {
        ModelArchitecture::Gpt2 => json!({
            "n_embd": D_MODEL,
            "n_head": 2,
            "n_layer": 3,
            "n_positions": N_CTX,
            "vocab_size": TINY_VOCAB,
            "n_inner": null
        }),
        ModelArchitecture::Qwen2 | ModelArchitecture::Llama => json!({
            "hidden_size": D_MODEL,
            "intermediate_size": D_FF,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 3,
            "vocab_size": TINY_VOCAB,
            "max_position_embeddings": N_CTX,
            "tie_word_embeddings": arch == ModelArchitecture::Qwen2
        }),
        ModelArchitecture::Gemma2 => json!({
            "hidden_size": D_MODEL,
            "intermediate_size": D_FF,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "head_dim": 8,
            "num_hidden_layers": 4,
            "vocab_size": TINY_VOCAB,
            "max_position_embeddings": N_CTX,
            "attn_logit_softcapping": 50.0,
            "final_logit_softcapping": 30.0,
            "query_pre_attn_scalar": 8,
            "sliding_window": 4
        }),
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(arch: ModelArchitecture) -> T {
    serde_json::from_value(tiny_config_json(arch))
        .unwrap_or_else(|e| panic!("tiny {arch:?} config: {e}"))
}

/// Seeded random checkpoint tensors
pub struct WeightBuilder {
    rng: StdRng,
    tensors: HashMap<String, Tensor>,
}

impl WeightBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            tensors: HashMap::new(),
        }
    }

    /// Uniform in `[-scale, scale)`
    pub fn random(&mut self, name: impl Into<String>, shape: &[usize], scale: f32) -> Result<()> {
        let n = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|_| self.rng.gen_range(-scale..scale)).collect();
        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
        self.tensors.insert(name.into(), tensor);
        Ok(())
    }

    pub fn constant(&mut self, name: impl Into<String>, shape: &[usize], value: f32) -> Result<()> {
        // `full` broadcasts a scalar; norm kernels need real strides
        let tensor = Tensor::full(value, shape, &Device::Cpu)?.contiguous()?;
        self.tensors.insert(name.into(), tensor);
        Ok(())
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }

    pub fn var_builder(self) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors, DType::F32, &Device::Cpu)
    }
}

fn gpt2_weights(w: &mut WeightBuilder) -> Result<()> {
    let (d, ff) = (D_MODEL, 4 * D_MODEL);
    w.random("wte.weight", &[TINY_VOCAB, d], 1.0)?;
    w.random("wpe.weight", &[N_CTX, d], 0.1)?;
    for i in 0..3 {
        let p = format!("h.{i}");
        for ln in ["ln_1", "ln_2"] {
            w.constant(format!("{p}.{ln}.weight"), &[d], 1.0)?;
            w.constant(format!("{p}.{ln}.bias"), &[d], 0.0)?;
        }
        // Conv1D layout: [in, out]
        for (name, din, dout) in [
            ("attn.c_attn", d, 3 * d),
            ("attn.c_proj", d, d),
            ("mlp.c_fc", d, ff),
            ("mlp.c_proj", ff, d),
        ] {
            w.random(format!("{p}.{name}.weight"), &[din, dout], 0.3)?;
            w.random(format!("{p}.{name}.bias"), &[dout], 0.05)?;
        }
    }
    w.constant("ln_f.weight", &[d], 1.0)?;
    w.constant("ln_f.bias", &[d], 0.0)
}

fn llama_weights(w: &mut WeightBuilder, variant: LlamaVariant) -> Result<()> {
    let (d, ff, hd) = (D_MODEL, D_FF, D_MODEL / 4);
    let (q_out, kv_out) = (4 * hd, 2 * hd);
    w.random("model.embed_tokens.weight", &[TINY_VOCAB, d], 1.0)?;
    for i in 0..3 {
        let p = format!("model.layers.{i}");
        for (name, out) in [("q_proj", q_out), ("k_proj", kv_out), ("v_proj", kv_out)] {
            w.random(format!("{p}.self_attn.{name}.weight"), &[out, d], 0.3)?;
            if variant == LlamaVariant::Qwen2 {
                w.random(format!("{p}.self_attn.{name}.bias"), &[out], 0.05)?;
            }
        }
        w.random(format!("{p}.self_attn.o_proj.weight"), &[d, q_out], 0.3)?;
        w.random(format!("{p}.mlp.gate_proj.weight"), &[ff, d], 0.3)?;
        w.random(format!("{p}.mlp.up_proj.weight"), &[ff, d], 0.3)?;
        w.random(format!("{p}.mlp.down_proj.weight"), &[d, ff], 0.3)?;
        w.constant(format!("{p}.input_layernorm.weight"), &[d], 1.0)?;
        w.constant(format!("{p}.post_attention_layernorm.weight"), &[d], 1.0)?;
    }
    w.constant("model.norm.weight", &[d], 1.0)?;
    if variant == LlamaVariant::Llama {
        w.random("lm_head.weight", &[TINY_VOCAB, d], 0.5)?;
    }
    Ok(())
}

fn gemma2_weights(w: &mut WeightBuilder) -> Result<()> {
    let (d, ff, hd) = (D_MODEL, D_FF, 8);
    w.random("model.embed_tokens.weight", &[TINY_VOCAB, d], 0.5)?;
    for i in 0..4 {
        let p = format!("model.layers.{i}");
        w.random(format!("{p}.self_attn.q_proj.weight"), &[4 * hd, d], 0.3)?;
        w.random(format!("{p}.self_attn.k_proj.weight"), &[2 * hd, d], 0.3)?;
        w.random(format!("{p}.self_attn.v_proj.weight"), &[2 * hd, d], 0.3)?;
        w.random(format!("{p}.self_attn.o_proj.weight"), &[d, 4 * hd], 0.3)?;
        w.random(format!("{p}.mlp.gate_proj.weight"), &[ff, d], 0.3)?;
        w.random(format!("{p}.mlp.up_proj.weight"), &[ff, d], 0.3)?;
        w.random(format!("{p}.mlp.down_proj.weight"), &[d, ff], 0.3)?;
        // Gemma norms scale by (1 + weight)
        for norm in [
            "input_layernorm",
            "post_attention_layernorm",
            "pre_feedforward_layernorm",
            "post_feedforward_layernorm",
        ] {
            w.random(format!("{p}.{norm}.weight"), &[d], 0.1)?;
        }
    }
    w.random("model.norm.weight", &[d], 0.1)
}

/// Seeded checkpoint tensors for the tiny model of `arch`
pub fn tiny_weights(arch: ModelArchitecture) -> Result<HashMap<String, Tensor>> {
    let mut w = WeightBuilder::new(0x5eed ^ arch as u64);
    match arch {
        ModelArchitecture::Gpt2 => gpt2_weights(&mut w)?,
        ModelArchitecture::Qwen2 => llama_weights(&mut w, LlamaVariant::Qwen2)?,
        ModelArchitecture::Llama => llama_weights(&mut w, LlamaVariant::Llama)?,
        ModelArchitecture::Gemma2 => gemma2_weights(&mut w)?,
    }
    Ok(w.into_tensors())
}

fn tiny_vb(arch: ModelArchitecture) -> VarBuilder<'static> {
    let tensors = tiny_weights(arch).unwrap_or_else(|e| panic!("tiny {arch:?} weights: {e}"));
    VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu)
}

pub fn tiny_gpt2() -> LensGpt2 {
    let config: Gpt2Config = parse_config(ModelArchitecture::Gpt2);
    LensGpt2::load(tiny_vb(ModelArchitecture::Gpt2), &config)
        .unwrap_or_else(|e| panic!("tiny gpt2: {e}"))
}

pub fn tiny_llama(variant: LlamaVariant) -> LensLlama {
    let arch = match variant {
        LlamaVariant::Llama => ModelArchitecture::Llama,
        LlamaVariant::Qwen2 => ModelArchitecture::Qwen2,
    };
    let config: LlamaConfig = parse_config(arch);
    LensLlama::load(tiny_vb(arch), &config, variant)
        .unwrap_or_else(|e| panic!("tiny {variant:?}: {e}"))
}

pub fn tiny_gemma2() -> LensGemma2 {
    let config: Gemma2Config = parse_config(ModelArchitecture::Gemma2);
    LensGemma2::load(tiny_vb(ModelArchitecture::Gemma2), &config)
        .unwrap_or_else(|e| panic!("tiny gemma2: {e}"))
}

/// A complete tiny model under an explicit name
pub fn tiny_model_named(name: &str, arch: ModelArchitecture) -> LensModel {
    let backend: Box<dyn LensBackend> = match arch {
        ModelArchitecture::Gpt2 => Box::new(tiny_gpt2()),
        ModelArchitecture::Qwen2 => Box::new(tiny_llama(LlamaVariant::Qwen2)),
        ModelArchitecture::Llama => Box::new(tiny_llama(LlamaVariant::Llama)),
        ModelArchitecture::Gemma2 => Box::new(tiny_gemma2()),
    };
    LensModel::from_parts(name, arch, backend, tiny_tokenizer(), Device::Cpu, false)
}

pub fn tiny_model(arch: ModelArchitecture) -> LensModel {
    tiny_model_named(&format!("tiny-{arch:?}").to_lowercase(), arch)
}

/// Write `config.json`, `tokenizer.json` and `model.safetensors` for the
/// tiny model of `arch` into `dir`, laid out like a hub snapshot.
pub fn write_tiny_checkpoint(dir: &Path, arch: ModelArchitecture) -> Result<()> {
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&tiny_config_json(arch))?,
    )?;
    std::fs::write(dir.join("tokenizer.json"), tiny_tokenizer_json())?;
    candle_core::safetensors::save(&tiny_weights(arch)?, dir.join("model.safetensors"))?;
    Ok(())
}

/// Loader that builds tiny models instead of downloading.
///
/// Counts calls, can sleep to widen race windows, and can fail a fixed
/// number of times before succeeding.
#[derive(Debug, Default)]
pub struct TinyLoader {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
}

impl TinyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Number of load attempts so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for TinyLoader {
    fn load(&self, entry: &CatalogEntry) -> Result<LensModel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        anyhow::ensure!(!failed, "simulated load failure for {}", entry.name);
        Ok(tiny_model_named(entry.name, entry.architecture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookSpec;
    use crate::model::GenerationConfig;

    #[test]
    fn test_constant_weights_are_contiguous() {
        let mut w = WeightBuilder::new(0);
        w.constant("ln.weight", &[D_MODEL], 1.0).unwrap();
        let tensors = w.into_tensors();
        assert!(tensors["ln.weight"].is_contiguous());
    }

    #[test]
    fn test_every_fixture_generates() {
        for arch in [
            ModelArchitecture::Gpt2,
            ModelArchitecture::Qwen2,
            ModelArchitecture::Llama,
            ModelArchitecture::Gemma2,
        ] {
            let model = tiny_model(arch);
            let prompt = model.encode("the cat").unwrap();
            let out = model
                .generate(&prompt, &GenerationConfig::greedy(3), &HookSpec::new())
                .unwrap_or_else(|e| panic!("{arch:?}: {e}"));
            assert!(out.len() >= prompt.len());
        }
    }
}
