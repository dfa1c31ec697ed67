//! Integration tests for lenscope
//!
//! Note: Tests marked with #[ignore] download real models from the Hub.
//! Run them explicitly with: cargo test --ignored

use lenscope::catalog;
use lenscope::logit_lens;
use lenscope::model::{LensModel, LoadOptions, ModelArchitecture, ModelFiles};
use lenscope::steering::{self, ContrastPrompts};
use lenscope::testing::write_tiny_checkpoint;
use tempfile::TempDir;

fn cpu() -> LoadOptions {
    LoadOptions {
        hf_token: None,
        force_cpu: true,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Build every architecture from a snapshot directory on disk
#[test]
fn test_load_from_snapshot_directory() {
    for name in ["gpt2-small", "qwen2.5-0.5b-instruct", "gemma-2-2b-it", "llama-2-7b-chat"] {
        let entry = catalog::lookup(name).unwrap();
        let dir = TempDir::new().unwrap();
        write_tiny_checkpoint(dir.path(), entry.architecture).unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        let model = LensModel::from_files(entry, &files, &cpu()).unwrap();
        assert_eq!(model.name(), name);
        assert_eq!(model.d_model(), 16);

        let analysis = logit_lens::analyze(&model, "the cat sat").unwrap();
        assert_eq!(analysis.layer_results.len(), model.n_layers());
    }
}

/// Missing files are reported, not panicked on
#[test]
fn test_incomplete_snapshot_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_tiny_checkpoint(dir.path(), ModelArchitecture::Gpt2).unwrap();
    std::fs::remove_file(dir.path().join("model.safetensors")).unwrap();
    assert!(ModelFiles::from_dir(dir.path()).is_err());
}

/// Hub test: GPT-2 small predicts through all 12 blocks
#[test]
#[ignore = "requires model download"]
fn test_gpt2_small_logit_lens() {
    let entry = catalog::lookup("gpt2-small").unwrap();
    let model = LensModel::from_pretrained(entry, &cpu()).unwrap();
    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.d_model(), 768);

    let analysis = logit_lens::analyze(&model, "The Eiffel Tower is in the city of").unwrap();
    assert_eq!(analysis.layer_results.len(), 12);
    assert!(!analysis.input_tokens.is_empty());
    assert!(analysis.most_likely_token.contains("Paris"));
}

/// Hub test: steering vectors on the smallest chat model
#[test]
#[ignore = "requires model download"]
fn test_qwen_steering_vectors() {
    let entry = catalog::lookup("qwen2.5-0.5b-instruct").unwrap();
    let model = LensModel::from_pretrained(entry, &cpu()).unwrap();

    let prompts = ContrastPrompts::PairedChat {
        user: strings(&["How was your day?", "What do you think of the movie?"]),
        positive_responses: strings(&["Wonderful, thank you!", "I loved it."]),
        negative_responses: strings(&["Terrible, honestly.", "I hated it."]),
    };
    let vectors = steering::calculate_steering_vectors(&model, &prompts, None, 16).unwrap();
    assert_eq!(vectors.len(), model.n_layers());
    assert!(vectors.values().all(|v| v.len() == model.d_model()));

    let out = steering::run_with_steering(
        &model,
        "I think that",
        &vectors,
        model.n_layers() / 2,
        4.0,
        20,
        512,
    )
    .unwrap();
    assert!(out.unsteered.starts_with("I think that"));
}
