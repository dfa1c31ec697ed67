//! Activation steering: difference-of-means vectors and steered generation
//!
//! ## Vectors
//!
//! For a positive and a negative prompt set, capture the residual stream
//! after every block at each prompt's last real token, average per set and
//! subtract. Prompts are run in right-padded batches; with causal attention
//! padding never reaches a real position, so the result does not depend on
//! the batch size. Sums are accumulated in f64 so prompt order does not
//! matter either.
//!
//! ## Generation
//!
//! A [`SteeringHook`] adds `scale * vector` to `blocks.{layer}.hook_resid_post`
//! on every forward step. It is turned into a [`HookSpec`] owned by the
//! generation call, so it is gone as soon as that call returns.
//!
//! ```ignore
//! use lenscope::steering::{calculate_steering_vectors, run_with_steering, ContrastPrompts};
//!
//! let prompts = ContrastPrompts::Unpaired { positive, negative };
//! let vectors = calculate_steering_vectors(&model, &prompts, None, 16)?;
//! let out = run_with_steering(&model, "I think", &vectors, 6, 4.0, 40, 512)?;
//! println!("{}\n---\n{}", out.steered, out.unsteered);
//! ```

use std::collections::BTreeMap;

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::error::{is_out_of_memory, LensError, LensResult};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::model::{GenerationConfig, LensModel};

/// Layer index -> `d_model` steering vector
pub type SteeringVectors = BTreeMap<usize, Vec<f32>>;

/// The two prompt sets to contrast
#[derive(Debug, Clone)]
pub enum ContrastPrompts {
    /// Raw prompt strings
    Unpaired {
        positive: Vec<String>,
        negative: Vec<String>,
    },
    /// One user turn answered once positively and once negatively,
    /// rendered through the model's chat template
    PairedChat {
        user: Vec<String>,
        positive_responses: Vec<String>,
        negative_responses: Vec<String>,
    },
}

impl ContrastPrompts {
    /// Validate and render into `(positive, negative)` prompt lists
    pub fn render(&self, model: &LensModel) -> LensResult<(Vec<String>, Vec<String>)> {
        match self {
            Self::Unpaired { positive, negative } => {
                if positive.is_empty() || negative.is_empty() {
                    return Err(LensError::invalid(
                        "positive_prompts and negative_prompts must both be non-empty",
                    ));
                }
                if positive.len() != negative.len() {
                    return Err(LensError::invalid(format!(
                        "positive_prompts ({}) and negative_prompts ({}) differ in length",
                        positive.len(),
                        negative.len()
                    )));
                }
                Ok((positive.clone(), negative.clone()))
            }
            Self::PairedChat {
                user,
                positive_responses,
                negative_responses,
            } => {
                if user.is_empty() {
                    return Err(LensError::invalid("user_prompts must be non-empty"));
                }
                if user.len() != positive_responses.len() || user.len() != negative_responses.len()
                {
                    return Err(LensError::invalid(format!(
                        "user_prompts ({}), assistant_positive_responses ({}) and \
                         assistant_negative_responses ({}) must have equal length",
                        user.len(),
                        positive_responses.len(),
                        negative_responses.len()
                    )));
                }
                let render = |responses: &[String]| -> Vec<String> {
                    user.iter()
                        .zip(responses)
                        .map(|(u, r)| model.apply_chat_template(u, r))
                        .collect()
                };
                Ok((render(positive_responses), render(negative_responses)))
            }
        }
    }
}

/// Running per-layer sums of last-token activations
struct MeanAccumulator {
    sums: BTreeMap<usize, Vec<f64>>,
    count: usize,
}

impl MeanAccumulator {
    fn new(layers: &[usize], d_model: usize) -> Self {
        Self {
            sums: layers.iter().map(|&l| (l, vec![0.0; d_model])).collect(),
            count: 0,
        }
    }

    fn add(&mut self, layer: usize, activation: &[f32]) {
        if let Some(sum) = self.sums.get_mut(&layer) {
            for (s, &a) in sum.iter_mut().zip(activation) {
                *s += f64::from(a);
            }
        }
    }

    fn means(self) -> BTreeMap<usize, Vec<f64>> {
        let n = self.count.max(1) as f64;
        self.sums
            .into_iter()
            .map(|(layer, sum)| (layer, sum.into_iter().map(|s| s / n).collect()))
            .collect()
    }
}

/// Run one batch and add each prompt's last-token activations to `acc`
fn accumulate_batch(
    model: &LensModel,
    batch: &[Vec<u32>],
    layers: &[usize],
    acc: &mut MeanAccumulator,
) -> anyhow::Result<()> {
    let (input, lengths) = model.batch_tensor(batch)?;

    let mut hooks = HookSpec::new();
    for &layer in layers {
        hooks.capture(HookPoint::ResidPost(layer));
    }
    let (_, cache) = model.run_with_hooks(&input, &hooks)?;

    // Copy to host before touching the accumulator so a failure mid-batch
    // leaves the sums untouched
    let mut rows = Vec::with_capacity(layers.len() * batch.len());
    for &layer in layers {
        let point = HookPoint::ResidPost(layer);
        for (row, &len) in lengths.iter().enumerate() {
            rows.push((layer, cache.position_f32(&point, row, len - 1)?));
        }
    }
    drop(cache);
    drop(input);
    model.device().synchronize()?;

    for (layer, activation) in &rows {
        acc.add(*layer, activation);
    }
    acc.count += batch.len();
    Ok(())
}

/// Mean last-token residual activation per layer over `prompts`.
///
/// Batches shrink by half on device out-of-memory; at batch size 1 the
/// request fails with [`LensError::ResourceExhausted`].
pub fn mean_last_token_activations(
    model: &LensModel,
    prompts: &[String],
    layers: &[usize],
    batch_size: usize,
) -> LensResult<BTreeMap<usize, Vec<f64>>> {
    let encoded = prompts
        .iter()
        .map(|p| model.encode(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if let Some(i) = encoded.iter().position(Vec::is_empty) {
        return Err(LensError::invalid(format!("prompt {i} tokenizes to zero tokens")));
    }
    for (i, ids) in encoded.iter().enumerate() {
        model.check_fits(&format!("prompt {i}"), ids.len())?;
    }

    let mut acc = MeanAccumulator::new(layers, model.d_model());
    run_batches(&encoded, batch_size, &mut acc, |batch, acc| {
        accumulate_batch(model, batch, layers, acc)
    })?;
    Ok(acc.means())
}

/// Feed `encoded` to `run_batch` in chunks of `batch_size`, halving the
/// chunk on out-of-memory and retrying from the same prompt.
fn run_batches<F>(
    encoded: &[Vec<u32>],
    batch_size: usize,
    acc: &mut MeanAccumulator,
    mut run_batch: F,
) -> LensResult<()>
where
    F: FnMut(&[Vec<u32>], &mut MeanAccumulator) -> anyhow::Result<()>,
{
    let mut batch_size = batch_size.max(1);
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + batch_size).min(encoded.len());
        match run_batch(&encoded[start..end], acc) {
            Ok(()) => {
                debug!("Captured prompts {}..{} of {}", start, end, encoded.len());
                start = end;
            }
            Err(e) if is_out_of_memory(&e) => {
                if batch_size == 1 {
                    return Err(LensError::ResourceExhausted(format!(
                        "out of device memory at batch size 1: {e}"
                    )));
                }
                batch_size /= 2;
                warn!("Out of memory, retrying with batch size {}", batch_size);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Difference-of-means steering vectors, one per requested layer.
///
/// `layers = None` means every block.
pub fn calculate_steering_vectors(
    model: &LensModel,
    prompts: &ContrastPrompts,
    layers: Option<&[usize]>,
    batch_size: usize,
) -> LensResult<SteeringVectors> {
    let n_layers = model.n_layers();
    let layers: Vec<usize> = match layers {
        Some(requested) => {
            if let Some(&bad) = requested.iter().find(|&&l| l >= n_layers) {
                return Err(LensError::invalid(format!(
                    "layer {bad} out of range (model has {n_layers} layers)"
                )));
            }
            let mut layers = requested.to_vec();
            layers.sort_unstable();
            layers.dedup();
            layers
        }
        None => (0..n_layers).collect(),
    };
    let (positive, negative) = prompts.render(model)?;

    info!(
        "Steering vectors on {}: {} prompt pairs, {} layers",
        model.name(),
        positive.len(),
        layers.len()
    );
    let pos_means = mean_last_token_activations(model, &positive, &layers, batch_size)?;
    let neg_means = mean_last_token_activations(model, &negative, &layers, batch_size)?;

    Ok(pos_means
        .into_iter()
        .map(|(layer, pos)| {
            let neg = &neg_means[&layer];
            let diff = pos.iter().zip(neg).map(|(p, n)| (p - n) as f32).collect();
            (layer, diff)
        })
        .collect())
}

/// Additive residual-stream steering at one block
#[derive(Debug, Clone)]
pub struct SteeringHook {
    pub layer: usize,
    pub vector: Vec<f32>,
    pub scale: f32,
}

impl SteeringHook {
    /// Whether adding this hook changes nothing
    pub fn is_noop(&self) -> bool {
        self.scale == 0.0 || self.vector.iter().all(|&v| v == 0.0)
    }

    /// Hooks for one call. A no-op hook yields an empty spec.
    pub fn hook_spec(&self, model: &LensModel) -> anyhow::Result<HookSpec> {
        let mut spec = HookSpec::new();
        if self.is_noop() {
            return Ok(spec);
        }
        let scaled: Vec<f32> = self.vector.iter().map(|v| v * self.scale).collect();
        let delta = Tensor::from_vec(scaled, self.vector.len(), model.device())?;
        spec.intervene(HookPoint::ResidPost(self.layer), Intervention::Add(delta));
        Ok(spec)
    }
}

/// Steered and baseline completions of the same prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeredGeneration {
    pub steered: String,
    pub unsteered: String,
}

/// Greedy generation with and without a steering vector.
///
/// Both outputs are the decoded prompt plus completion.
pub fn run_with_steering(
    model: &LensModel,
    prompt: &str,
    vectors: &SteeringVectors,
    layer: usize,
    scale: f32,
    max_tokens: usize,
    max_tokens_limit: usize,
) -> LensResult<SteeredGeneration> {
    if max_tokens == 0 || max_tokens > max_tokens_limit {
        return Err(LensError::invalid(format!(
            "max_tokens must be between 1 and {max_tokens_limit}, got {max_tokens}"
        )));
    }
    let vector = vectors.get(&layer).ok_or_else(|| {
        LensError::invalid(format!("layer {layer} not present in steering_vectors"))
    })?;
    if layer >= model.n_layers() {
        return Err(LensError::invalid(format!(
            "layer {layer} out of range (model has {} layers)",
            model.n_layers()
        )));
    }
    if vector.len() != model.d_model() {
        return Err(LensError::invalid(format!(
            "steering vector for layer {layer} has length {}, expected {}",
            vector.len(),
            model.d_model()
        )));
    }

    let ids = model.encode(prompt)?;
    if ids.is_empty() {
        return Err(LensError::invalid("prompt tokenizes to zero tokens"));
    }
    model.check_fits("prompt", ids.len())?;

    let hook = SteeringHook {
        layer,
        vector: vector.clone(),
        scale,
    };
    let config = GenerationConfig::greedy(max_tokens);
    info!(
        "Steered generation on {}: layer {}, scale {}, max_tokens {}",
        model.name(),
        layer,
        scale,
        max_tokens
    );

    let steered = model.generate(&ids, &config, &hook.hook_spec(model)?)?;
    let unsteered = model.generate(&ids, &config, &HookSpec::new())?;

    Ok(SteeredGeneration {
        steered: model.decode(&steered)?,
        unsteered: model.decode(&unsteered)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelArchitecture;
    use crate::testing::tiny_model;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn contrast() -> ContrastPrompts {
        ContrastPrompts::Unpaired {
            positive: strings(&["the cat sat", "a dog ran on the mat", "the bird", "cat"]),
            negative: strings(&["the dog sat", "a cat ran", "the mat on the dog", "bird"]),
        }
    }

    fn assert_close(a: &SteeringVectors, b: &SteeringVectors) {
        assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
        for (layer, va) in a {
            for (x, y) in va.iter().zip(&b[layer]) {
                assert!((x - y).abs() < 1e-4, "layer {layer}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn test_one_vector_per_layer() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let vectors = calculate_steering_vectors(&model, &contrast(), None, 16).unwrap();
        assert_eq!(vectors.len(), model.n_layers());
        for v in vectors.values() {
            assert_eq!(v.len(), model.d_model());
        }

        let only = calculate_steering_vectors(&model, &contrast(), Some(&[1]), 16).unwrap();
        assert_eq!(only.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_close(
            &only,
            &vectors.iter().filter(|(l, _)| **l == 1).map(|(l, v)| (*l, v.clone())).collect(),
        );
    }

    #[test]
    fn test_batch_size_does_not_change_vectors() {
        let model = tiny_model(ModelArchitecture::Qwen2);
        let full = calculate_steering_vectors(&model, &contrast(), None, 16).unwrap();
        for batch_size in [1, 3] {
            let other = calculate_steering_vectors(&model, &contrast(), None, batch_size).unwrap();
            assert_close(&full, &other);
        }
    }

    #[test]
    fn test_prompt_order_does_not_change_vectors() {
        let model = tiny_model(ModelArchitecture::Gemma2);
        let forward = calculate_steering_vectors(&model, &contrast(), None, 2).unwrap();

        let ContrastPrompts::Unpaired { mut positive, mut negative } = contrast() else {
            unreachable!()
        };
        positive.reverse();
        negative.reverse();
        let reversed = ContrastPrompts::Unpaired { positive, negative };
        let backward = calculate_steering_vectors(&model, &reversed, None, 2).unwrap();
        assert_close(&forward, &backward);
    }

    fn out_of_memory() -> anyhow::Error {
        anyhow::anyhow!("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")")
    }

    #[test]
    fn test_out_of_memory_halves_batch_and_retries() {
        let model = tiny_model(ModelArchitecture::Qwen2);
        let layers: Vec<usize> = (0..model.n_layers()).collect();
        let (positive, _) = contrast().render(&model).unwrap();
        let encoded: Vec<Vec<u32>> = positive.iter().map(|p| model.encode(p).unwrap()).collect();

        let mut clean = MeanAccumulator::new(&layers, model.d_model());
        run_batches(&encoded, 4, &mut clean, |batch, acc| {
            accumulate_batch(&model, batch, &layers, acc)
        })
        .unwrap();

        // Fail the first two attempts: batch sizes 4 and 2 run out of memory
        let mut sizes = Vec::new();
        let mut failures = 2;
        let mut retried = MeanAccumulator::new(&layers, model.d_model());
        run_batches(&encoded, 4, &mut retried, |batch, acc| {
            sizes.push(batch.len());
            if failures > 0 {
                failures -= 1;
                return Err(out_of_memory());
            }
            accumulate_batch(&model, batch, &layers, acc)
        })
        .unwrap();

        assert_eq!(sizes, vec![4, 2, 1, 1, 1, 1]);
        assert_eq!(retried.count, encoded.len());
        let (clean, retried) = (clean.means(), retried.means());
        for layer in &layers {
            for (a, b) in clean[layer].iter().zip(&retried[layer]) {
                assert!((a - b).abs() < 1e-4, "layer {layer}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_out_of_memory_at_batch_size_one_is_exhausted() {
        let encoded = vec![vec![2u32, 3], vec![4]];
        let mut acc = MeanAccumulator::new(&[0], 4);
        let mut attempts = 0;
        let err = run_batches(&encoded, 8, &mut acc, |_, _| {
            attempts += 1;
            Err(out_of_memory())
        })
        .unwrap_err();
        assert!(matches!(err, LensError::ResourceExhausted(_)), "{err}");
        // 8 -> 4 -> 2 -> 1, then give up
        assert_eq!(attempts, 4);
        assert_eq!(acc.count, 0);

        let err = run_batches(&encoded, 2, &mut acc, |_, _| anyhow::bail!("shape mismatch"))
            .unwrap_err();
        assert!(matches!(err, LensError::Internal(_)), "{err}");
    }

    #[test]
    fn test_identical_sets_give_zero_vectors() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let same = strings(&["the cat sat", "the dog"]);
        let prompts = ContrastPrompts::Unpaired {
            positive: same.clone(),
            negative: same,
        };
        let vectors = calculate_steering_vectors(&model, &prompts, None, 16).unwrap();
        assert!(vectors.values().flatten().all(|&x| x.abs() < 1e-6));
    }

    #[test]
    fn test_invalid_prompt_sets() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let empty = ContrastPrompts::Unpaired {
            positive: vec![],
            negative: strings(&["the cat"]),
        };
        let uneven = ContrastPrompts::Unpaired {
            positive: strings(&["the cat", "the dog"]),
            negative: strings(&["the cat"]),
        };
        let paired = ContrastPrompts::PairedChat {
            user: strings(&["hi"]),
            positive_responses: strings(&["good", "great"]),
            negative_responses: strings(&["bad"]),
        };
        for prompts in [empty, uneven, paired] {
            let err = calculate_steering_vectors(&model, &prompts, None, 16).unwrap_err();
            assert!(matches!(err, LensError::InvalidRequest(_)), "{err}");
        }

        let err = calculate_steering_vectors(&model, &contrast(), Some(&[99]), 16).unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)));
    }

    #[test]
    fn test_paired_chat_renders_template() {
        let model = tiny_model(ModelArchitecture::Qwen2);
        let prompts = ContrastPrompts::PairedChat {
            user: strings(&["the cat"]),
            positive_responses: strings(&["sat"]),
            negative_responses: strings(&["ran"]),
        };
        let (pos, neg) = prompts.render(&model).unwrap();
        assert_eq!(pos[0], model.apply_chat_template("the cat", "sat"));
        assert_eq!(neg[0], model.apply_chat_template("the cat", "ran"));
        assert!(calculate_steering_vectors(&model, &prompts, None, 16).is_ok());
    }

    #[test]
    fn test_zero_vector_matches_unsteered() {
        let model = tiny_model(ModelArchitecture::Llama);
        let mut vectors = SteeringVectors::new();
        vectors.insert(1, vec![0.0; model.d_model()]);

        let out = run_with_steering(&model, "the cat", &vectors, 1, 8.0, 6, 512).unwrap();
        assert_eq!(out.steered, out.unsteered);

        vectors.insert(1, vec![1.0; model.d_model()]);
        let out = run_with_steering(&model, "the cat", &vectors, 1, 0.0, 6, 512).unwrap();
        assert_eq!(out.steered, out.unsteered);
    }

    #[test]
    fn test_steering_hook_changes_forward_pass() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let hook = SteeringHook {
            layer: 0,
            vector: (0..model.d_model()).map(|i| i as f32).collect(),
            scale: 10.0,
        };
        let spec = hook.hook_spec(&model).unwrap();
        assert!(spec.has_interventions());

        let (input, _) = model.batch_tensor(&[model.encode("the cat").unwrap()]).unwrap();
        let (base, _) = model.run_with_hooks(&input, &HookSpec::new()).unwrap();
        let (steered, _) = model.run_with_hooks(&input, &spec).unwrap();
        let diff = (base - steered)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_run_with_steering_validation() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let d = model.d_model();
        let mut vectors = SteeringVectors::new();
        vectors.insert(0, vec![1.0; d]);
        vectors.insert(7, vec![1.0; d]);
        vectors.insert(2, vec![1.0; d + 1]);

        let cases = [
            (5, 10),  // layer absent
            (7, 10),  // layer beyond model depth
            (2, 10),  // wrong vector length
            (0, 0),   // zero tokens requested
            (0, 513), // above limit
        ];
        for (layer, max_tokens) in cases {
            let err = run_with_steering(&model, "the cat", &vectors, layer, 1.0, max_tokens, 512)
                .unwrap_err();
            assert!(matches!(err, LensError::InvalidRequest(_)), "{err}");
        }

        let out = run_with_steering(&model, "the cat", &vectors, 0, 1.0, 3, 512).unwrap();
        assert!(out.unsteered.starts_with("the"));
    }

    #[test]
    fn test_generation_is_bounded_by_context_window() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let ctx = model.max_context();
        let mut vectors = SteeringVectors::new();
        vectors.insert(0, vec![0.5; model.d_model()]);

        // More new tokens than the window has room for: truncated, not failed
        let out = run_with_steering(&model, "the cat", &vectors, 0, 1.0, 100, 512).unwrap();
        assert!(out.steered.starts_with("the"));
        assert!(out.unsteered.starts_with("the"));

        let long = "the ".repeat(ctx + 1);
        let err = run_with_steering(&model, &long, &vectors, 0, 1.0, 4, 512).unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)), "{err}");
    }

    #[test]
    fn test_overlong_contrast_prompt_is_rejected() {
        let model = tiny_model(ModelArchitecture::Gpt2);
        let prompts = ContrastPrompts::Unpaired {
            positive: vec!["the cat".into(), "the ".repeat(model.max_context() + 1)],
            negative: strings(&["the dog", "a bird"]),
        };
        let err = calculate_steering_vectors(&model, &prompts, None, 16).unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)), "{err}");
    }
}
