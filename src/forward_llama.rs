//! LLaMA-family forward pass with hook points
//!
//! Covers the two decoder layouts that share the LLaMA block structure:
//! - LLaMA 2 (meta-llama/Llama-2-7b-chat-hf): no projection bias, separate lm_head
//! - Qwen2 / Qwen2.5 (Qwen/Qwen2.5-0.5B-Instruct): bias on Q/K/V, tied embeddings
//!
//! Both use RMSNorm, half-split RoPE, grouped-query attention and a SwiGLU MLP.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::info;

use crate::cache::ActivationCache;
use crate::hooks::{HookPoint, HookSpec};
use crate::kv_cache::{append_kv, KVCache, LayerKv};
use crate::masks::attention_mask;
use crate::model::LensBackend;

/// Which member of the family a checkpoint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlamaVariant {
    Llama,
    Qwen2,
}

/// Model configuration (matches HuggingFace config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary position embeddings, half-split layout (HF `rotate_half`)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        // [max_seq_len, head_dim / 2]
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        anyhow::ensure!(
            start_pos + seq_len <= self.cos.dim(0)?,
            "Sequence of {} tokens exceeds context window of {}",
            start_pos + seq_len,
            self.cos.dim(0)?
        );
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Grouped-query attention
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_kv_heads = config.num_kv_heads();
        let proj = |out: usize, name: &str| -> Result<Linear> {
            if qkv_bias {
                Ok(linear(config.hidden_size, out, vb.pp(name))?)
            } else {
                Ok(linear_no_bias(config.hidden_size, out, vb.pp(name))?)
            }
        };

        Ok(Self {
            q_proj: proj(config.num_attention_heads * head_dim, "q_proj")?,
            k_proj: proj(num_kv_heads * head_dim, "k_proj")?,
            v_proj: proj(num_kv_heads * head_dim, "v_proj")?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        kv: Option<LayerKv<'_>>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;

        // Cache holds un-expanded KV heads
        let (k, v) = append_kv(kv, k, v)?;
        let total_seq_len = k.dim(2)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let mask = attention_mask(seq_len, total_seq_len, start_pos, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU MLP, no bias
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, qkv_bias)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        kv: Option<LayerKv<'_>>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, rotary, start_pos, kv)?;
        let x = (residual + h)?;

        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((x + h)?)
    }
}

/// LLaMA / Qwen2 decoder with hook points at every block boundary
pub struct LensLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    variant: LlamaVariant,
    config: LlamaConfig,
}

impl LensLlama {
    /// Build from a weight source rooted at the checkpoint top level
    /// (`model.*` plus `lm_head.*`).
    pub fn load(vb: VarBuilder, config: &LlamaConfig, variant: LlamaVariant) -> Result<Self> {
        info!(
            "{:?} config: {} layers, hidden={}, heads={}, kv_heads={}, vocab={}",
            variant,
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.vocab_size
        );

        let qkv_bias = variant == LlamaVariant::Qwen2 || config.attention_bias;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                config,
                qkv_bias,
            )?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            info!("Using tied embeddings for lm_head");
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            vb.device(),
            vb.dtype(),
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            variant,
            config: config.clone(),
        })
    }

    pub fn variant(&self) -> LlamaVariant {
        self.variant
    }

    fn run(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        cache: &mut ActivationCache,
        mut kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let start_pos = kv_cache.as_ref().map_or(0, |c| c.seq_len());

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        hidden = hooks.run(&HookPoint::Embed, hidden, cache)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = hooks.run(&HookPoint::ResidPre(i), hidden, cache)?;
            let kv = kv_cache.as_mut().map(|c| c.layer_mut(i));
            hidden = layer.forward(&hidden, &self.rotary, start_pos, kv)?;
            hidden = hooks.run(&HookPoint::ResidPost(i), hidden, cache)?;
        }

        let normed = self.norm.forward(&hidden)?;
        hooks.run(&HookPoint::FinalNorm, normed, cache)
    }
}

impl LensBackend for LensLlama {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn n_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn max_context(&self) -> usize {
        self.config.max_position_embeddings
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
        Ok(self.norm.forward(hidden)?)
    }

    fn unembed(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
    }

    fn chat_template(&self, user: &str, assistant: &str) -> Option<String> {
        Some(match self.variant {
            LlamaVariant::Llama => format!("[INST] {user} [/INST] {assistant}"),
            LlamaVariant::Qwen2 => format!(
                "<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n{assistant}"
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_llama, TINY_VOCAB};

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_forward_shapes_both_variants() {
        for variant in [LlamaVariant::Llama, LlamaVariant::Qwen2] {
            let model = tiny_llama(variant);
            let (logits, cache) = model
                .forward(&ids(&[1, 2, 3, 4]), &HookSpec::resid_post_all(model.n_layers()))
                .unwrap();
            assert_eq!(logits.dims(), &[1, 4, TINY_VOCAB]);
            assert_eq!(cache.len(), model.n_layers());
        }
    }

    #[test]
    fn test_kv_cache_matches_full_forward() {
        let model = tiny_llama(LlamaVariant::Qwen2);
        let tokens = [3u32, 1, 4, 1, 5];
        let (full, _) = model.forward(&ids(&tokens), &HookSpec::new()).unwrap();
        let expected: Vec<f32> = full.i((0, 4)).unwrap().to_vec1().unwrap();

        let mut kv = model.new_kv_cache();
        model
            .forward_with_kv_cache(&ids(&tokens[..2]), &mut kv, &HookSpec::new())
            .unwrap();
        model
            .forward_with_kv_cache(&ids(&tokens[2..4]), &mut kv, &HookSpec::new())
            .unwrap();
        let step = model
            .forward_with_kv_cache(&ids(&tokens[4..]), &mut kv, &HookSpec::new())
            .unwrap();
        let got: Vec<f32> = step.i(0).unwrap().to_vec1().unwrap();

        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_chat_templates() {
        let llama = tiny_llama(LlamaVariant::Llama);
        assert_eq!(
            llama.chat_template("hi", "yo").unwrap(),
            "[INST] hi [/INST] yo"
        );
        let qwen = tiny_llama(LlamaVariant::Qwen2);
        assert!(qwen
            .chat_template("hi", "yo")
            .unwrap()
            .starts_with("<|im_start|>user\nhi<|im_end|>"));
    }

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{"hidden_size": 8, "intermediate_size": 16, "num_attention_heads": 2,
                "num_hidden_layers": 1, "vocab_size": 10}"#,
        )
        .unwrap();
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(!config.tie_word_embeddings);
    }
}
