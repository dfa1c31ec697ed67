//! Supported models
//!
//! The service only loads models listed here. Names are the public
//! identifiers used in requests; each maps to a HuggingFace repository and
//! the backend that runs it.

use crate::model::ModelArchitecture;

/// One supported model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Public model name used in requests
    pub name: &'static str,
    /// HuggingFace repository id
    pub repo_id: &'static str,
    pub architecture: ModelArchitecture,
    /// Download needs an access token
    pub gated: bool,
    /// Encode with the tokenizer's special tokens (leading BOS)
    pub prepend_bos: bool,
    /// Chat model offered for steering
    pub steering: bool,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "gpt2-small",
        repo_id: "openai-community/gpt2",
        architecture: ModelArchitecture::Gpt2,
        gated: false,
        prepend_bos: false,
        steering: false,
    },
    CatalogEntry {
        name: "gpt2-medium",
        repo_id: "openai-community/gpt2-medium",
        architecture: ModelArchitecture::Gpt2,
        gated: false,
        prepend_bos: false,
        steering: false,
    },
    CatalogEntry {
        name: "qwen2.5-0.5b-instruct",
        repo_id: "Qwen/Qwen2.5-0.5B-Instruct",
        architecture: ModelArchitecture::Qwen2,
        gated: false,
        prepend_bos: false,
        steering: true,
    },
    CatalogEntry {
        name: "gemma-2-2b-it",
        repo_id: "google/gemma-2-2b-it",
        architecture: ModelArchitecture::Gemma2,
        gated: true,
        prepend_bos: true,
        steering: true,
    },
    CatalogEntry {
        name: "llama-2-7b-chat",
        repo_id: "meta-llama/Llama-2-7b-chat-hf",
        architecture: ModelArchitecture::Llama,
        gated: true,
        prepend_bos: true,
        steering: true,
    },
];

/// Look up a model by its public name
pub fn lookup(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.name == name)
}

/// Every supported model name, in catalog order
pub fn available_models() -> Vec<&'static str> {
    CATALOG.iter().map(|e| e.name).collect()
}

/// Names of models offered for steering
pub fn steering_models() -> Vec<&'static str> {
    CATALOG.iter().filter(|e| e.steering).map(|e| e.name).collect()
}

/// URL-safe form of a model name (`qwen2.5-0.5b-instruct` -> `qwen2-5-0-5b-instruct`)
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
