// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // LensModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! lenscope: logit lens and activation steering over HTTP
//!
//! Runs small transformer language models with hook points on the
//! residual stream and serves two interpretability tools: the logit lens
//! (decode every block's residual stream through the unembedding) and
//! difference-of-means activation steering.
//!
//! ## Architecture
//!
//! - `hooks`: Hook points and per-call capture/intervention specs
//! - `cache`: ActivationCache for storing captured activations
//! - `forward_gpt2`: GPT-2 forward pass with hook points
//! - `forward_llama`: LLaMA 2 / Qwen2 forward pass with hook points
//! - `forward_gemma2`: Gemma 2 forward pass with hook points
//! - `kv_cache`: KV-cache for efficient autoregressive generation
//! - `masks`: Shared attention mask utilities (causal, generation, sliding window)
//! - `model`: High-level LensModel wrapper (backend + tokenizer + device)
//! - `logit_lens`: Per-layer decode of the residual stream
//! - `steering`: Steering vectors and steered generation
//! - `catalog`: Supported model names
//! - `registry`: Load-once model cache with usage timestamps
//! - `dispatch`: Local and remote executors
//! - `schema`: JSON request/response bodies
//! - `api`: axum router
//! - `config`: Service configuration
//! - `error`: Service error taxonomy
//! - `testing`: Tiny seeded models for tests (`testing` feature)

pub mod api;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward_gemma2;
pub mod forward_gpt2;
pub mod forward_llama;
pub mod hooks;
pub mod kv_cache;
pub mod logit_lens;
pub mod masks;
pub mod model;
pub mod registry;
pub mod schema;
pub mod steering;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::ActivationCache;
pub use catalog::CatalogEntry;
pub use config::{Config, ExecutionMode, RemoteConfig, SecretToken};
pub use dispatch::{Executor, LocalExecutor, RemoteExecutor};
pub use error::{LensError, LensResult};
pub use forward_gemma2::LensGemma2;
pub use forward_gpt2::LensGpt2;
pub use forward_llama::{LensLlama, LlamaVariant};
pub use hooks::{HookPoint, HookSpec, Intervention};
pub use kv_cache::KVCache;
pub use logit_lens::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
pub use masks::{clear_mask_caches, create_causal_mask, create_generation_mask};
pub use model::{GenerationConfig, LensBackend, LensModel, LoadOptions, ModelArchitecture};
pub use registry::{ModelHandle, ModelLoader, ModelRegistry, UsageLog};
pub use steering::{ContrastPrompts, SteeredGeneration, SteeringHook, SteeringVectors};
