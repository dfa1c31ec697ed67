//! Gemma 2 forward pass with hook points
//!
//! Layer-by-layer implementation for google/gemma-2-2b-it:
//! - Alternating sliding window / global attention per layer
//! - Attention logit soft-capping and final logit soft-capping
//! - Four-norm decoder layers (pre/post attention + pre/post MLP)
//! - GQA with explicit `head_dim` (not derived from hidden_size/num_heads)
//! - Embeddings scaled by `sqrt(hidden_size)` and tied to the unembedding

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::info;

use crate::cache::ActivationCache;
use crate::hooks::{HookPoint, HookSpec};
use crate::kv_cache::{append_kv, KVCache, LayerKv};
use crate::masks::{attention_mask, create_sliding_window_mask};
use crate::model::LensBackend;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Gemma 2 model configuration (matches HuggingFace config.json).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gemma2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default = "default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

fn default_rope_theta() -> f64 {
    10000.0
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_max_position_embeddings() -> usize {
    8192
}
fn default_query_pre_attn_scalar() -> usize {
    256
}

fn softcap(x: &Tensor, cap: f64) -> Result<Tensor> {
    Ok(((x / cap)?.tanh()? * cap)?)
}

// ---------------------------------------------------------------------------
// RmsNorm (Gemma-style: weight + 1.0)
// ---------------------------------------------------------------------------

struct GemmaRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GemmaRmsNorm {
    fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let internal_dtype = match x_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        let hidden_size = x.dim(D::Minus1)?;
        let x = x.to_dtype(internal_dtype)?;
        let norm_x = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
        let x_normed = x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)?;
        let weight_plus_one = (self.weight.to_dtype(internal_dtype)? + 1.0)?;
        Ok(x_normed
            .broadcast_mul(&weight_plus_one)?
            .to_dtype(x_dtype)?)
    }
}

// ---------------------------------------------------------------------------
// Rotary Embedding
// ---------------------------------------------------------------------------

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0f32 / (rope_theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        anyhow::ensure!(
            start_pos + seq_len <= self.cos.dim(0)?,
            "Sequence of {} tokens exceeds context window of {}",
            start_pos + seq_len,
            self.cos.dim(0)?
        );
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    n_rep: usize,
    head_dim: usize,
    attn_logit_softcapping: Option<f64>,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim;
        let hidden_size = config.hidden_size;

        Ok(Self {
            q_proj: linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            n_rep: num_heads / num_kv_heads,
            head_dim,
            attn_logit_softcapping: config.attn_logit_softcapping,
            scale: 1.0 / (config.query_pre_attn_scalar as f64).sqrt(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        start_pos: usize,
        kv: Option<LayerKv<'_>>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;
        let (k, v) = append_kv(kv, k, v)?;

        // GQA: expand KV heads
        let k = repeat_kv(k, self.n_rep)?.contiguous()?;
        let v = repeat_kv(v, self.n_rep)?.contiguous()?;

        let mut attn_weights = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        if let Some(sc) = self.attn_logit_softcapping {
            attn_weights = softcap(&attn_weights, sc)?;
        }
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, n_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, n_kv_heads * n_rep, seq_len, head_dim))?)
}

// ---------------------------------------------------------------------------
// MLP (GeGLU)
// ---------------------------------------------------------------------------

#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.gelu()?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

// ---------------------------------------------------------------------------
// Decoder Layer (4 norms: pre/post attention + pre/post MLP)
// ---------------------------------------------------------------------------

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: GemmaRmsNorm,
    post_attention_layernorm: GemmaRmsNorm,
    pre_feedforward_layernorm: GemmaRmsNorm,
    post_feedforward_layernorm: GemmaRmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let norm = |name: &str| GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp(name));
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            pre_feedforward_layernorm: norm("pre_feedforward_layernorm")?,
            post_feedforward_layernorm: norm("post_feedforward_layernorm")?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        start_pos: usize,
        kv: Option<LayerKv<'_>>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, rotary, mask, start_pos, kv)?;
        let xs = self.post_attention_layernorm.forward(&xs)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = self.pre_feedforward_layernorm.forward(&xs)?;
        let xs = self.mlp.forward(&xs)?;
        let xs = self.post_feedforward_layernorm.forward(&xs)?;
        Ok((residual + xs)?)
    }
}

// ---------------------------------------------------------------------------
// LensGemma2
// ---------------------------------------------------------------------------

/// Gemma 2 with hook points at every block boundary.
pub struct LensGemma2 {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: GemmaRmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: Gemma2Config,
}

impl LensGemma2 {
    /// Build from a weight source rooted at the checkpoint top level.
    pub fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        info!(
            "Gemma 2 config: {} layers, hidden={}, heads={}, kv_heads={}, head_dim={}, vocab={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim,
            config.vocab_size
        );
        info!(
            "  attn_softcap={:?}, final_softcap={:?}, sliding_window={:?}",
            config.attn_logit_softcapping, config.final_logit_softcapping, config.sliding_window
        );

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
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), config)?);
        }

        let norm = GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let lm_head = Linear::new(embed_tokens.embeddings().clone(), None);

        let rotary = RotaryEmbedding::new(
            config.head_dim,
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
            config: config.clone(),
        })
    }

    /// Even layers use the sliding window, odd layers attend globally.
    fn mask_for_layer(
        &self,
        layer_idx: usize,
        seq_len: usize,
        total_seq_len: usize,
        start_pos: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        match self.config.sliding_window {
            Some(window) if layer_idx % 2 == 0 => {
                create_sliding_window_mask(seq_len, total_seq_len, start_pos, window, device, dtype)
            }
            _ => attention_mask(seq_len, total_seq_len, start_pos, device, dtype),
        }
    }

    fn run(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        cache: &mut ActivationCache,
        mut kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let start_pos = kv_cache.as_ref().map_or(0, |c| c.seq_len());
        let total_seq_len = start_pos + seq_len;
        let device = input_ids.device();
        let dtype = self.embed_tokens.embeddings().dtype();

        // Embedding with sqrt(hidden_size) scaling
        let hidden = self.embed_tokens.forward(input_ids)?;
        let mut hidden = (hidden * (self.config.hidden_size as f64).sqrt())?;
        hidden = hooks.run(&HookPoint::Embed, hidden, cache)?;

        // Two distinct masks cover every layer
        let even_mask =
            self.mask_for_layer(0, seq_len, total_seq_len, start_pos, device, dtype)?;
        let odd_mask = self.mask_for_layer(1, seq_len, total_seq_len, start_pos, device, dtype)?;

        for (i, layer) in self.layers.iter().enumerate() {
            let mask = if i % 2 == 0 { &even_mask } else { &odd_mask };
            hidden = hooks.run(&HookPoint::ResidPre(i), hidden, cache)?;
            let kv = kv_cache.as_mut().map(|c| c.layer_mut(i));
            hidden = layer.forward(&hidden, &self.rotary, mask, start_pos, kv)?;
            hidden = hooks.run(&HookPoint::ResidPost(i), hidden, cache)?;
        }

        let normed = self.norm.forward(&hidden)?;
        hooks.run(&HookPoint::FinalNorm, normed, cache)
    }

    /// Apply final logit soft-capping: `sc * tanh(logits / sc)`.
    fn apply_final_softcap(&self, logits: Tensor) -> Result<Tensor> {
        match self.config.final_logit_softcapping {
            Some(sc) => softcap(&logits, sc),
            None => Ok(logits),
        }
    }
}

impl LensBackend for LensGemma2 {
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
        let logits = self.apply_final_softcap(self.lm_head.forward(&normed)?)?;
        Ok((logits, cache))
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
        self.apply_final_softcap(self.lm_head.forward(&last)?)
    }

    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        self.norm.forward(hidden)
    }

    /// Tied unembedding without the final softcap.
    fn unembed(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
    }

    fn chat_template(&self, user: &str, assistant: &str) -> Option<String> {
        Some(format!(
            "<start_of_turn>user\n{user}<end_of_turn>\n<start_of_turn>model\n{assistant}"
        ))
    }
}
