//! JSON request and response bodies
//!
//! The same types travel between the HTTP facade, the executors and remote
//! workers, so a worker is just this server running in local mode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LensError, LensResult};
use crate::logit_lens::LogitLensAnalysis;
use crate::steering::{ContrastPrompts, SteeredGeneration, SteeringVectors};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitLensRequest {
    pub model_name: String,
    pub input: String,
}

/// Per-block decode of the residual stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub hook_name: String,
    pub max_probs: Vec<f32>,
    pub max_prob_tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitLensResponse {
    pub input_tokens: Vec<String>,
    pub most_likely_token: String,
    pub logit_lens: Vec<LayerRecord>,
}

impl From<LogitLensAnalysis> for LogitLensResponse {
    fn from(analysis: LogitLensAnalysis) -> Self {
        Self {
            logit_lens: analysis
                .layer_results
                .iter()
                .map(|r| LayerRecord {
                    hook_name: r.hook_name.clone(),
                    max_probs: r.max_probs(),
                    max_prob_tokens: r.max_prob_tokens(),
                })
                .collect(),
            input_tokens: analysis.input_tokens,
            most_likely_token: analysis.most_likely_token,
        }
    }
}

/// Either raw prompt sets or chat triples; exactly one must be given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteeringVectorRequest {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive_prompts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_positive_responses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_negative_responses: Option<Vec<String>>,
    /// Restrict the layers reported; all blocks when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<usize>>,
}

impl SteeringVectorRequest {
    /// Pick the request variant, rejecting mixed or partial bodies
    pub fn contrast_prompts(&self) -> LensResult<ContrastPrompts> {
        let unpaired = self.positive_prompts.is_some() || self.negative_prompts.is_some();
        let paired = self.user_prompts.is_some()
            || self.assistant_positive_responses.is_some()
            || self.assistant_negative_responses.is_some();

        match (unpaired, paired) {
            (true, false) => match (&self.positive_prompts, &self.negative_prompts) {
                (Some(positive), Some(negative)) => Ok(ContrastPrompts::Unpaired {
                    positive: positive.clone(),
                    negative: negative.clone(),
                }),
                _ => Err(LensError::invalid(
                    "positive_prompts and negative_prompts must be given together",
                )),
            },
            (false, true) => match (
                &self.user_prompts,
                &self.assistant_positive_responses,
                &self.assistant_negative_responses,
            ) {
                (Some(user), Some(pos), Some(neg)) => Ok(ContrastPrompts::PairedChat {
                    user: user.clone(),
                    positive_responses: pos.clone(),
                    negative_responses: neg.clone(),
                }),
                _ => Err(LensError::invalid(
                    "user_prompts, assistant_positive_responses and \
                     assistant_negative_responses must be given together",
                )),
            },
            (true, true) => Err(LensError::invalid(
                "give either positive/negative prompts or chat triples, not both",
            )),
            (false, false) => Err(LensError::invalid(
                "missing prompts: give positive_prompts/negative_prompts or user_prompts \
                 with assistant responses",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringVectorResponse {
    /// Layer index (stringified on the wire) -> vector
    pub steering_vectors: SteeringVectors,
}

fn default_scaling_factor() -> f32 {
    1.0
}

fn default_max_tokens() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWithSteeringRequest {
    pub model_name: String,
    pub prompt: String,
    pub steering_vectors: BTreeMap<usize, Vec<f32>>,
    pub layer: usize,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWithSteeringResponse {
    pub steered_response: String,
    pub unsteered_response: String,
}

impl From<SteeredGeneration> for RunWithSteeringResponse {
    fn from(generation: SteeredGeneration) -> Self {
        Self {
            steered_response: generation.steered,
            unsteered_response: generation.unsteered,
        }
    }
}

/// Body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_with_steering_defaults() {
        let req: RunWithSteeringRequest = serde_json::from_value(json!({
            "model_name": "gpt2-small",
            "prompt": "hi",
            "steering_vectors": { "3": [0.5, -0.5] },
            "layer": 3
        }))
        .unwrap();
        assert_eq!(req.scaling_factor, 1.0);
        assert_eq!(req.max_tokens, 100);
        assert_eq!(req.steering_vectors[&3], vec![0.5, -0.5]);
    }

    #[test]
    fn test_steering_vectors_use_string_keys() {
        let mut vectors = SteeringVectors::new();
        vectors.insert(2, vec![1.0]);
        let body = serde_json::to_value(SteeringVectorResponse {
            steering_vectors: vectors,
        })
        .unwrap();
        assert_eq!(body, json!({ "steering_vectors": { "2": [1.0] } }));
    }

    #[test]
    fn test_request_variant_selection() {
        let strings = |s: &[&str]| Some(s.iter().map(|x| (*x).to_string()).collect());

        let unpaired = SteeringVectorRequest {
            model_name: "m".into(),
            positive_prompts: strings(&["a"]),
            negative_prompts: strings(&["b"]),
            ..Default::default()
        };
        assert!(matches!(
            unpaired.contrast_prompts().unwrap(),
            ContrastPrompts::Unpaired { .. }
        ));

        let paired = SteeringVectorRequest {
            model_name: "m".into(),
            user_prompts: strings(&["q"]),
            assistant_positive_responses: strings(&["a"]),
            assistant_negative_responses: strings(&["b"]),
            ..Default::default()
        };
        assert!(matches!(
            paired.contrast_prompts().unwrap(),
            ContrastPrompts::PairedChat { .. }
        ));

        let both = SteeringVectorRequest {
            user_prompts: strings(&["q"]),
            ..unpaired.clone()
        };
        let neither = SteeringVectorRequest {
            model_name: "m".into(),
            ..Default::default()
        };
        let half = SteeringVectorRequest {
            negative_prompts: None,
            ..unpaired
        };
        for req in [both, neither, half] {
            assert!(matches!(
                req.contrast_prompts(),
                Err(LensError::InvalidRequest(_))
            ));
        }
    }
}
