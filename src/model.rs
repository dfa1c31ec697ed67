//! LensModel wrapper: backend + tokenizer + device
//!
//! Supports GPT-2, LLaMA 2, Qwen2 and Gemma 2 backends behind one
//! interface. Every forward pass takes a [`HookSpec`], so captures and
//! interventions are always scoped to the call that asked for them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use rand::Rng;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::catalog::CatalogEntry;
use crate::config::SecretToken;
use crate::error::{LensError, LensResult};
use crate::forward_gemma2::{Gemma2Config, LensGemma2};
use crate::forward_gpt2::{Gpt2Config, LensGpt2};
use crate::forward_llama::{LensLlama, LlamaConfig, LlamaVariant};
use crate::hooks::HookSpec;
use crate::kv_cache::KVCache;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// GPT-2 (OpenAI)
    Gpt2,
    /// Qwen2 / Qwen2.5 (Alibaba)
    Qwen2,
    /// Gemma 2 (Google)
    Gemma2,
    /// LLaMA 2 (Meta)
    Llama,
}

/// Per-architecture forward pass with hook points.
///
/// Backends run the residual stream layer by layer and call
/// [`HookSpec::run`] at `Embed`, `ResidPre(i)`, `ResidPost(i)` and
/// `FinalNorm`.
pub trait LensBackend: Send + Sync {
    // Model info
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn n_heads(&self) -> usize;
    /// Longest sequence the position encoding covers
    fn max_context(&self) -> usize;

    /// Full forward pass. Returns logits `[batch, seq, vocab]` and the
    /// captures requested by `hooks`.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<(Tensor, ActivationCache)>;

    /// Incremental forward pass. Returns logits `[batch, vocab]` for the
    /// last position. Interventions in `hooks` apply; captures are dropped.
    fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
        hooks: &HookSpec,
    ) -> Result<Tensor>;

    /// The model's own final normalization
    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor>;

    /// The model's own output projection
    fn unembed(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Decode a residual-stream tensor: final norm, then unembedding
    fn logit_lens(&self, hidden: &Tensor) -> Result<Tensor> {
        self.unembed(&self.final_norm(hidden)?)
    }

    fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.n_layers())
    }

    /// Render one user/assistant exchange. `None` means no chat format.
    fn chat_template(&self, _user: &str, _assistant: &str) -> Option<String> {
        None
    }
}

/// Options for loading from the HuggingFace Hub
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Access token for gated repositories
    pub hf_token: Option<SecretToken>,
    /// Skip CUDA detection
    pub force_cpu: bool,
}

/// Generation settings
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of new tokens
    pub max_tokens: usize,
    /// 0.0 = greedy
    pub temperature: f32,
    /// Extra stop tokens (EOS always stops)
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.0,
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Deterministic generation of at most `max_tokens` tokens
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl SafetensorsIndex {
    fn read(path: &Path) -> Result<Vec<String>> {
        let index_str = std::fs::read_to_string(path).context("Failed to read index")?;
        let index: Self = serde_json::from_str(&index_str)?;
        let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
        shard_names.sort();
        shard_names.dedup();
        Ok(shard_names)
    }
}

/// Local paths of everything needed to build a model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Fetch (or reuse from the local hub cache) a repository's files
    pub fn download(repo: &ApiRepo) -> Result<Self> {
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;

        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let shard_names = SafetensorsIndex::read(&index_path)?;
            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Use a directory laid out like a hub snapshot
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        let tokenizer = dir.join("tokenizer.json");
        anyhow::ensure!(config.exists(), "Missing {}", config.display());
        anyhow::ensure!(tokenizer.exists(), "Missing {}", tokenizer.display());

        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.exists() {
            SafetensorsIndex::read(&index_path)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        for path in &weights {
            anyhow::ensure!(path.exists(), "Missing {}", path.display());
        }

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let config_str = std::fs::read_to_string(path).context("Failed to read config")?;
    Ok(serde_json::from_str(&config_str)?)
}

/// CUDA with BF16 when available, otherwise CPU with F32
fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// High-level model wrapper used by the services
pub struct LensModel {
    backend: Box<dyn LensBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    name: String,
    prepend_bos: bool,
}

impl LensModel {
    /// Load a catalog model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(entry: &CatalogEntry, opts: &LoadOptions) -> Result<Self> {
        info!("Loading model: {} ({})", entry.name, entry.repo_id);

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(token) = &opts.hf_token {
            builder = builder.with_token(Some(token.expose().to_string()));
        }
        let api = builder.build()?;
        let repo = api.repo(Repo::new(entry.repo_id.to_string(), RepoType::Model));

        let files = ModelFiles::download(&repo)?;
        Self::from_files(entry, &files, opts)
    }

    /// Build a catalog model from files already on disk
    pub fn from_files(entry: &CatalogEntry, files: &ModelFiles, opts: &LoadOptions) -> Result<Self> {
        let (device, dtype) = select_device(opts.force_cpu);
        info!("Architecture: {:?}", entry.architecture);
        info!("Device: {:?}, dtype: {:?}", device, dtype);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        info!("Loading weights from {} file(s)...", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };

        let backend: Box<dyn LensBackend> = match entry.architecture {
            ModelArchitecture::Gpt2 => {
                let config: Gpt2Config = read_config(&files.config)?;
                Box::new(LensGpt2::load(vb, &config)?)
            }
            ModelArchitecture::Qwen2 => {
                let config: LlamaConfig = read_config(&files.config)?;
                Box::new(LensLlama::load(vb, &config, LlamaVariant::Qwen2)?)
            }
            ModelArchitecture::Llama => {
                let config: LlamaConfig = read_config(&files.config)?;
                Box::new(LensLlama::load(vb, &config, LlamaVariant::Llama)?)
            }
            ModelArchitecture::Gemma2 => {
                let config: Gemma2Config = read_config(&files.config)?;
                Box::new(LensGemma2::load(vb, &config)?)
            }
        };

        info!(
            "Model loaded: {} layers, d_model={}, vocab={}",
            backend.n_layers(),
            backend.d_model(),
            backend.vocab_size()
        );

        Ok(Self::from_parts(
            entry.name,
            entry.architecture,
            backend,
            tokenizer,
            device,
            entry.prepend_bos,
        ))
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        name: impl Into<String>,
        architecture: ModelArchitecture,
        backend: Box<dyn LensBackend>,
        tokenizer: Tokenizer,
        device: Device,
        prepend_bos: bool,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            architecture,
            name: name.into(),
            prepend_bos,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backend(&self) -> &dyn LensBackend {
        self.backend.as_ref()
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    pub fn n_heads(&self) -> usize {
        self.backend.n_heads()
    }

    pub fn max_context(&self) -> usize {
        self.backend.max_context()
    }

    /// Reject a request input of `n_tokens` that the window cannot hold
    pub fn check_fits(&self, what: &str, n_tokens: usize) -> LensResult<()> {
        let max_context = self.max_context();
        if n_tokens > max_context {
            return Err(LensError::invalid(format!(
                "{what} is {n_tokens} tokens, longer than the context window of {max_context}"
            )));
        }
        Ok(())
    }

    /// Get the EOS token ID for this model
    pub fn eos_token_id(&self) -> Option<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        ["<|im_end|>", "<|endoftext|>", "</s>", "<end_of_turn>", "<eos>"]
            .iter()
            .find_map(|t| vocab.get(*t).copied())
    }

    /// Token IDs for `text`, with special tokens only when the model
    /// expects a leading BOS
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, self.prepend_bos)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Decode a full sequence, keeping special tokens
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    /// Render a user/assistant pair with the model's chat format,
    /// falling back to a plain `User:`/`Assistant:` layout
    pub fn apply_chat_template(&self, user: &str, assistant: &str) -> String {
        self.backend
            .chat_template(user, assistant)
            .unwrap_or_else(|| format!("User: {user}\nAssistant: {assistant}"))
    }

    /// Right-pad a batch of token sequences into one `[batch, max_len]`
    /// tensor. Returns the tensor and each row's real length.
    pub fn batch_tensor(&self, sequences: &[Vec<u32>]) -> Result<(Tensor, Vec<usize>)> {
        anyhow::ensure!(!sequences.is_empty(), "Empty batch");
        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        anyhow::ensure!(max_len > 0, "Batch contains only empty sequences");

        let pad = self.eos_token_id().unwrap_or(0);
        let mut flat = Vec::with_capacity(sequences.len() * max_len);
        for seq in sequences {
            flat.extend_from_slice(seq);
            flat.extend(std::iter::repeat(pad).take(max_len - seq.len()));
        }
        let tensor = Tensor::from_vec(flat, (sequences.len(), max_len), &self.device)?;
        Ok((tensor, lengths))
    }

    /// One forward pass over a prepared batch
    pub fn run_with_hooks(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
    ) -> Result<(Tensor, ActivationCache)> {
        self.backend.forward(input_ids, hooks)
    }

    /// Generate tokens autoregressively with a KV-cache.
    ///
    /// `hooks` apply on every step: the prompt prefill and each new token.
    /// Returns the full sequence (prompt + completion). Generation stops
    /// early at a stop token or when the sequence fills the context window.
    pub fn generate(
        &self,
        prompt_ids: &[u32],
        config: &GenerationConfig,
        hooks: &HookSpec,
    ) -> Result<Vec<u32>> {
        anyhow::ensure!(!prompt_ids.is_empty(), "Cannot generate from an empty prompt");
        let max_context = self.max_context();
        anyhow::ensure!(
            prompt_ids.len() <= max_context,
            "Prompt of {} tokens exceeds context window of {}",
            prompt_ids.len(),
            max_context
        );

        let mut stop_tokens = config.stop_tokens.clone();
        stop_tokens.extend(self.eos_token_id());

        let mut kv_cache = self.backend.new_kv_cache();
        let mut tokens = prompt_ids.to_vec();

        let prompt_tensor = Tensor::new(prompt_ids, &self.device)?.unsqueeze(0)?;
        let mut logits = self
            .backend
            .forward_with_kv_cache(&prompt_tensor, &mut kv_cache, hooks)?;

        for step in 0..config.max_tokens {
            let next_token = sample_from_logits(&logits, config.temperature)?;
            if stop_tokens.contains(&next_token) {
                debug!("Stop token {} after {} new tokens", next_token, step);
                break;
            }
            tokens.push(next_token);
            if step + 1 == config.max_tokens {
                break;
            }
            if tokens.len() >= max_context {
                debug!("Context window of {} filled after {} new tokens", max_context, step + 1);
                break;
            }

            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            logits = self
                .backend
                .forward_with_kv_cache(&input, &mut kv_cache, hooks)?;
        }

        Ok(tokens)
    }
}

/// Sample a token from logits with temperature (0.0 = argmax)
pub fn sample_from_logits(logits: &Tensor, temperature: f32) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    if temperature <= 0.0 {
        let (max_idx, _) = logits_vec
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
        return Ok(max_idx as u32);
    }

    // Softmax over temperature-scaled logits
    let scaled: Vec<f32> = logits_vec.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rand::thread_rng().gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }

    Ok((exp_vals.len() - 1) as u32)
}
