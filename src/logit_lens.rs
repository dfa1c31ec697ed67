//! Logit Lens: what would the model predict after each block?
//!
//! Captures the residual stream after every transformer block and decodes
//! it through the model's own final norm and unembedding. For each block
//! and each input position we report the arg-max token and its
//! probability.

use candle_core::{DType, IndexOp, Tensor, D};
use tracing::debug;

use crate::error::{LensError, LensResult};
use crate::hooks::{HookPoint, HookSpec};
use crate::model::LensModel;

/// Number of final-position candidates kept per layer
pub const TOP_K: usize = 5;

/// A single token prediction
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    /// Token ID
    pub token_id: u32,
    /// Decoded token string
    pub token: String,
    /// Probability (0.0 - 1.0)
    pub probability: f32,
}

/// Result of applying logit lens at a single layer
#[derive(Debug, Clone)]
pub struct LogitLensResult {
    /// Layer index (0-indexed)
    pub layer: usize,
    /// Hook the residual was read from (`blocks.{layer}.hook_resid_post`)
    pub hook_name: String,
    /// Arg-max prediction at every input position
    pub positions: Vec<TokenPrediction>,
    /// Top-k predictions at the final position, most likely first
    pub top_k: Vec<TokenPrediction>,
}

impl LogitLensResult {
    pub fn max_probs(&self) -> Vec<f32> {
        self.positions.iter().map(|p| p.probability).collect()
    }

    pub fn max_prob_tokens(&self) -> Vec<String> {
        self.positions.iter().map(|p| p.token.clone()).collect()
    }
}

/// Full logit lens analysis across all layers
#[derive(Debug)]
pub struct LogitLensAnalysis {
    /// Input text that was analyzed
    pub input_text: String,
    /// One decoded string per input token
    pub input_tokens: Vec<String>,
    /// Arg-max of the model's real output at the last position
    pub most_likely_token: String,
    /// Results for each layer, in block order
    pub layer_results: Vec<LogitLensResult>,
    /// Number of layers analyzed
    pub n_layers: usize,
}

impl LogitLensAnalysis {
    pub fn new(input_text: String, input_tokens: Vec<String>, n_layers: usize) -> Self {
        Self {
            input_text,
            input_tokens,
            most_likely_token: String::new(),
            layer_results: Vec::with_capacity(n_layers),
            n_layers,
        }
    }

    /// Add a layer's result
    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    /// Final-position top prediction at each layer
    pub fn top_predictions(&self) -> Vec<(&str, f32)> {
        self.layer_results
            .iter()
            .filter_map(|r| r.top_k.first())
            .map(|p| (p.token.as_str(), p.probability))
            .collect()
    }

    /// First layer whose final-position top-k contains `token`
    pub fn first_appearance(&self, token: &str, k: usize) -> Option<usize> {
        self.layer_results
            .iter()
            .find(|r| r.top_k.iter().take(k).any(|p| p.token.contains(token)))
            .map(|r| r.layer)
    }

    /// Print a summary of the analysis
    pub fn print_summary(&self) {
        println!("=== Logit Lens Analysis ===");
        println!("Input: {}", self.input_text);
        println!(
            "Tokens: [{}]",
            self.input_tokens
                .iter()
                .map(|t| format!("\"{}\"", format_token(t)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("Model output: \"{}\"", format_token(&self.most_likely_token));
        println!("\nTop prediction at each layer:");
        for result in &self.layer_results {
            if let Some(top) = result.top_k.first() {
                println!(
                    "  Layer {:2}: {:>12} ({:.1}%)",
                    result.layer,
                    format!("\"{}\"", format_token(&top.token)),
                    top.probability * 100.0
                );
            }
        }
    }

    /// Print the top-k candidates at the final position for each layer
    pub fn print_detailed(&self, top_k: usize) {
        println!("=== Logit Lens Detailed Analysis ===");
        println!("Input: {}", self.input_text);
        for result in &self.layer_results {
            println!("\n{}:", result.hook_name);
            for (i, pred) in result.top_k.iter().take(top_k).enumerate() {
                println!(
                    "  {}. {:>15} ({:.2}%)",
                    i + 1,
                    format!("\"{}\"", format_token(&pred.token)),
                    pred.probability * 100.0
                );
            }
        }
    }
}

/// Softmax over the vocabulary, then max and arg-max for every position.
///
/// `logits` has shape `[seq_len, vocab]`. Computed in f32 whatever the
/// model dtype.
pub fn max_prob_per_position(logits: &Tensor) -> anyhow::Result<(Vec<f32>, Vec<u32>)> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    let max_probs: Vec<f32> = probs.max(D::Minus1)?.to_vec1()?;
    let argmax: Vec<u32> = probs.argmax(D::Minus1)?.to_vec1()?;
    Ok((max_probs, argmax))
}

/// The `k` most likely tokens in a probability row, most likely first
fn top_k_of(probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// Decode `(token_id, probability)` pairs to predictions
pub fn decode_predictions(model: &LensModel, predictions: &[(u32, f32)]) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, probability)| TokenPrediction {
            token_id,
            token: model.decode_token(token_id),
            probability,
        })
        .collect()
}

/// Escape whitespace control characters for display
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

/// Run the logit lens over `text`: one forward pass, every block decoded.
pub fn analyze(model: &LensModel, text: &str) -> LensResult<LogitLensAnalysis> {
    let ids = model.encode(text)?;
    if ids.is_empty() {
        return Err(LensError::invalid("input tokenizes to zero tokens"));
    }
    model.check_fits("input", ids.len())?;
    let input_tokens: Vec<String> = ids.iter().map(|&id| model.decode_token(id)).collect();
    let seq_len = ids.len();
    debug!("Logit lens over {} tokens on {}", seq_len, model.name());

    let input = Tensor::new(ids.as_slice(), model.device())?.unsqueeze(0)?;
    let hooks = HookSpec::resid_post_all(model.n_layers());
    let (logits, cache) = model.run_with_hooks(&input, &hooks)?;

    let mut analysis = LogitLensAnalysis::new(text.to_string(), input_tokens, model.n_layers());

    let (_, final_argmax) = max_prob_per_position(&logits.i(0)?)?;
    if let Some(&last) = final_argmax.last() {
        analysis.most_likely_token = model.decode_token(last);
    }

    for (layer, resid) in cache.resid_posts() {
        let layer_logits = model.backend().logit_lens(resid)?.i(0)?;
        let (max_probs, argmax) = max_prob_per_position(&layer_logits)?;
        let pairs: Vec<(u32, f32)> = argmax.into_iter().zip(max_probs).collect();

        let last_probs: Vec<f32> = candle_nn::ops::softmax_last_dim(
            &layer_logits.i(seq_len - 1)?.to_dtype(DType::F32)?,
        )?
        .to_vec1()?;

        analysis.push(LogitLensResult {
            layer,
            hook_name: HookPoint::ResidPost(layer).to_string(),
            positions: decode_predictions(model, &pairs),
            top_k: decode_predictions(model, &top_k_of(&last_probs, TOP_K)),
        });
    }

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelArchitecture;
    use crate::testing::tiny_model;
    use candle_core::Device;

    fn prediction(token_id: u32, token: &str, probability: f32) -> TokenPrediction {
        TokenPrediction {
            token_id,
            token: token.to_string(),
            probability,
        }
    }

    #[test]
    fn test_first_appearance() {
        let mut analysis = LogitLensAnalysis::new("test".to_string(), vec![], 2);
        analysis.push(LogitLensResult {
            layer: 0,
            hook_name: "blocks.0.hook_resid_post".into(),
            positions: vec![],
            top_k: vec![prediction(1, "a", 0.5)],
        });
        analysis.push(LogitLensResult {
            layer: 1,
            hook_name: "blocks.1.hook_resid_post".into(),
            positions: vec![],
            top_k: vec![prediction(3, "b", 0.6), prediction(2, "dog", 0.3)],
        });

        assert_eq!(analysis.first_appearance("dog", 2), Some(1));
        assert_eq!(analysis.first_appearance("dog", 1), None);
        assert_eq!(analysis.top_predictions(), vec![("a", 0.5), ("b", 0.6)]);
    }

    #[test]
    fn test_max_prob_per_position() {
        let logits = Tensor::new(&[[0f32, 0.0, 0.0, 0.0], [0.0, 10.0, 0.0, 0.0]], &Device::Cpu)
            .unwrap();
        let (probs, ids) = max_prob_per_position(&logits).unwrap();
        assert!((probs[0] - 0.25).abs() < 1e-6);
        assert!(probs[1] > 0.99);
        assert_eq!(ids[1], 1);
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let logits = Tensor::new(&[[1000f32, 999.0, -1000.0]], &Device::Cpu).unwrap();
        let (probs, ids) = max_prob_per_position(&logits).unwrap();
        assert!(probs[0].is_finite());
        assert_eq!(ids[0], 0);
    }

    #[test]
    fn test_analyze_reports_every_layer_in_order() {
        for arch in [
            ModelArchitecture::Gpt2,
            ModelArchitecture::Qwen2,
            ModelArchitecture::Gemma2,
        ] {
            let model = tiny_model(arch);
            let analysis = analyze(&model, "the cat sat on the mat").unwrap();

            assert_eq!(analysis.layer_results.len(), model.n_layers());
            assert_eq!(analysis.input_tokens.len(), 6);
            for (i, result) in analysis.layer_results.iter().enumerate() {
                assert_eq!(result.layer, i);
                assert_eq!(result.hook_name, format!("blocks.{i}.hook_resid_post"));
                assert_eq!(result.positions.len(), 6);
                for p in &result.positions {
                    assert!((0.0..=1.0).contains(&p.probability));
                }
                assert_eq!(result.top_k.len(), TOP_K);
            }
            assert!(!analysis.most_likely_token.is_empty());
        }
    }

    #[test]
    fn test_last_layer_matches_model_output() {
        let model = tiny_model(ModelArchitecture::Qwen2);
        let analysis = analyze(&model, "the cat").unwrap();
        let last = analysis.layer_results.last().unwrap();
        // Qwen2 has no final softcap, so the last block decodes to the real output
        assert_eq!(last.positions.last().unwrap().token, analysis.most_likely_token);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let err = analyze(&model, "").unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)));
    }

    #[test]
    fn test_input_longer_than_context_is_rejected() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let ctx = model.max_context();

        let fits = "the ".repeat(ctx);
        assert_eq!(analyze(&model, &fits).unwrap().input_tokens.len(), ctx);

        let err = analyze(&model, &"the ".repeat(ctx + 16)).unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)), "{err}");
    }
}
