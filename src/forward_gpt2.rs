//! GPT-2 forward pass with hook points
//!
//! Layer-by-layer implementation of the OpenAI GPT-2 family
//! (openai-community/gpt2, gpt2-medium):
//! - Learned absolute position embeddings (`wpe`)
//! - Pre-LayerNorm blocks with fused QKV projection (`c_attn`)
//! - Conv1D weights stored as `[in, out]`, transposed once at load
//! - GELU (tanh approximation) MLP
//! - Unembedding tied to the token embedding matrix

use anyhow::Result;
use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::cache::ActivationCache;
use crate::hooks::{HookPoint, HookSpec};
use crate::kv_cache::{append_kv, KVCache, LayerKv};
use crate::masks::attention_mask;
use crate::model::LensBackend;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// GPT-2 configuration (HuggingFace config.json field names).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// MLP width; `null` in config.json means `4 * n_embd`
    #[serde(default)]
    pub n_inner: Option<usize>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// Load a Conv1D weight (`[in, out]`) as a regular `Linear`.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            c_attn: conv1d(d, 3 * d, vb.pp("c_attn"))?,
            c_proj: conv1d(d, d, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: d / config.n_head,
        })
    }

    fn forward(&self, x: &Tensor, start_pos: usize, kv: Option<LayerKv<'_>>) -> Result<Tensor> {
        let (b, seq_len, d) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |idx: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, idx * d, d)?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let (k, v) = append_kv(kv, split(1)?, split(2)?)?;
        let total_seq_len = k.dim(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let mask = attention_mask(seq_len, total_seq_len, start_pos, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, d))?;
        Ok(self.c_proj.forward(&attn_output)?)
    }
}

// ---------------------------------------------------------------------------
// MLP + block
// ---------------------------------------------------------------------------

#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let inner = config.inner_dim();
        Ok(Self {
            c_fc: conv1d(config.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: conv1d(inner, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor, start_pos: usize, kv: Option<LayerKv<'_>>) -> Result<Tensor> {
        let residual = x;
        let h = self.attn.forward(&self.ln_1.forward(x)?, start_pos, kv)?;
        let x = (residual + h)?;
        let h = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        Ok((x + h)?)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// GPT-2 with hook points at the embedding, every block boundary and the
/// final LayerNorm.
pub struct LensGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Gpt2Config,
}

impl LensGpt2 {
    /// Build from a weight source. Accepts checkpoints with or without the
    /// `transformer.` prefix.
    pub fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        info!(
            "GPT-2 config: {} layers, n_embd={}, heads={}, vocab={}",
            config.n_layer, config.n_embd, config.n_head, config.vocab_size
        );

        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), config)?);
        }

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
        })
    }

    fn embed(&self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            start_pos + seq_len <= self.config.n_positions,
            "Sequence of {} tokens exceeds context window of {}",
            start_pos + seq_len,
            self.config.n_positions
        );
        let positions = Tensor::arange(
            start_pos as u32,
            (start_pos + seq_len) as u32,
            input_ids.device(),
        )?;
        let tokens = self.wte.forward(input_ids)?;
        let positions = self.wpe.forward(&positions)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    /// Shared block loop. Returns the final-normed hidden state.
    fn run(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        cache: &mut ActivationCache,
        mut kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let start_pos = kv_cache.as_ref().map_or(0, |c| c.seq_len());

        let mut hidden = self.embed(input_ids, start_pos)?;
        hidden = hooks.run(&HookPoint::Embed, hidden, cache)?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = hooks.run(&HookPoint::ResidPre(i), hidden, cache)?;
            let kv = kv_cache.as_mut().map(|c| c.layer_mut(i));
            hidden = block.forward(&hidden, start_pos, kv)?;
            hidden = hooks.run(&HookPoint::ResidPost(i), hidden, cache)?;
        }

        let normed = self.ln_f.forward(&hidden)?;
        hooks.run(&HookPoint::FinalNorm, normed, cache)
    }
}

impl LensBackend for LensGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn n_heads(&self) -> usize {
        self.config.n_head
    }

    fn max_context(&self) -> usize {
        self.config.n_positions
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::with_capacity(hooks.n_captures());
        let normed = self.run(input_ids, hooks, &mut cache, None)?;
        Ok((self.lm_head.forward(&normed)?, cache))
    }

    fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
        hooks: &HookSpec,
    ) -> Result<Tensor> {
        let mut scratch = ActivationCache::default();
        let normed = self.run(input_ids, hooks, &mut scratch, Some(kv_cache))?;
        let seq_len = normed.dim(1)?;
        let last = normed.i((.., seq_len - 1, ..))?;
        Ok(self.lm_head.forward(&last)?)
    }

    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.ln_f.forward(hidden)?)
    }

    fn unembed(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_gpt2, TINY_VOCAB};
    use candle_core::Device;

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = tiny_gpt2();
        let (logits, cache) = model
            .forward(&ids(&[1, 2, 3]), &HookSpec::resid_post_all(model.n_layers()))
            .unwrap();
        assert_eq!(logits.dims(), &[1, 3, TINY_VOCAB]);
        assert_eq!(cache.len(), model.n_layers());
        let layers: Vec<usize> = cache.resid_posts().map(|(i, _)| i).collect();
        assert_eq!(layers, (0..model.n_layers()).collect::<Vec<_>>());
    }

    #[test]
    fn test_kv_cache_matches_full_forward() {
        let model = tiny_gpt2();
        let tokens = [4u32, 5, 6, 7];
        let (full, _) = model.forward(&ids(&tokens), &HookSpec::new()).unwrap();
        let expected: Vec<f32> = full.i((0, 3)).unwrap().to_vec1().unwrap();

        let mut kv = model.new_kv_cache();
        model
            .forward_with_kv_cache(&ids(&tokens[..3]), &mut kv, &HookSpec::new())
            .unwrap();
        let step = model
            .forward_with_kv_cache(&ids(&tokens[3..]), &mut kv, &HookSpec::new())
            .unwrap();
        let got: Vec<f32> = step.i(0).unwrap().to_vec1().unwrap();

        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_final_resid_post_lens_matches_logits() {
        let model = tiny_gpt2();
        let n = model.n_layers();
        let (logits, cache) = model
            .forward(&ids(&[2, 3]), &HookSpec::resid_post_all(n))
            .unwrap();
        let last = cache.require(&HookPoint::ResidPost(n - 1)).unwrap();
        let lens = model.logit_lens(last).unwrap();
        let diff = (lens - logits)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(diff.iter().all(|d| *d < 1e-5));
    }

    #[test]
    fn test_context_window_enforced() {
        let model = tiny_gpt2();
        let too_long: Vec<u32> = vec![1; 65];
        assert!(model.forward(&ids(&too_long), &HookSpec::new()).is_err());
    }
}
