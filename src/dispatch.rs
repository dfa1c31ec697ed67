//! Local or remote execution of the three services
//!
//! [`Executor`] is the single interface the HTTP layer talks to. The local
//! implementation runs models in this process through the registry; the
//! remote one forwards the same JSON bodies to per-model GPU workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog;
use crate::config::{Config, ExecutionMode, RemoteConfig};
use crate::error::{LensError, LensResult};
use crate::logit_lens;
use crate::model::LensModel;
use crate::registry::{ModelRegistry, UsageLog};
use crate::schema::{
    ErrorBody, LogitLensRequest, LogitLensResponse, RunWithSteeringRequest,
    RunWithSteeringResponse, SteeringVectorRequest, SteeringVectorResponse,
};
use crate::steering;

pub const ROUTE_LOGIT_LENS: &str = "logitlens";
pub const ROUTE_STEERING_CALCULATE: &str = "steering/calculate";
pub const ROUTE_RUN_WITH_STEERING: &str = "steering/run_with_steering";

#[async_trait]
pub trait Executor: Send + Sync {
    async fn logit_lens(&self, req: LogitLensRequest) -> LensResult<LogitLensResponse>;

    async fn calculate_steering(
        &self,
        req: SteeringVectorRequest,
    ) -> LensResult<SteeringVectorResponse>;

    async fn run_with_steering(
        &self,
        req: RunWithSteeringRequest,
    ) -> LensResult<RunWithSteeringResponse>;

    /// Model name -> time of its last successful request
    fn loaded_models(&self) -> BTreeMap<String, DateTime<Utc>>;
}

/// Build the executor selected by `config`
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn Executor>> {
    Ok(match &config.mode {
        ExecutionMode::Local => {
            info!("Executing models locally");
            Arc::new(LocalExecutor::new(
                Arc::new(ModelRegistry::from_hub(config.load.clone())),
                config.steering_batch_size,
                config.max_generation_tokens,
            ))
        }
        ExecutionMode::Remote(remote) => {
            info!(
                "Forwarding requests to remote workers ({}/{})",
                remote.workspace, remote.app
            );
            Arc::new(RemoteExecutor::new(remote.clone())?)
        }
    })
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Runs models in process, one computation per model at a time
pub struct LocalExecutor {
    registry: Arc<ModelRegistry>,
    steering_batch_size: usize,
    max_generation_tokens: usize,
}

impl LocalExecutor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        steering_batch_size: usize,
        max_generation_tokens: usize,
    ) -> Self {
        Self {
            registry,
            steering_batch_size,
            max_generation_tokens,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Run `f` on the blocking pool with the named model locked
    async fn with_model<T, F>(&self, name: &str, f: F) -> LensResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LensModel) -> LensResult<T> + Send + 'static,
    {
        let handle = self.registry.get_or_load(name).await?;
        let result = tokio::task::spawn_blocking(move || {
            let model = handle.lock()?;
            f(&model)
        })
        .await
        .map_err(|e| LensError::Internal(anyhow::anyhow!("model task failed: {e}")))??;
        self.registry.record_use(name);
        Ok(result)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn logit_lens(&self, req: LogitLensRequest) -> LensResult<LogitLensResponse> {
        let input = req.input;
        self.with_model(&req.model_name, move |model| {
            logit_lens::analyze(model, &input).map(LogitLensResponse::from)
        })
        .await
    }

    async fn calculate_steering(
        &self,
        req: SteeringVectorRequest,
    ) -> LensResult<SteeringVectorResponse> {
        let prompts = req.contrast_prompts()?;
        let layers = req.layers;
        let batch_size = self.steering_batch_size;
        self.with_model(&req.model_name, move |model| {
            let steering_vectors = steering::calculate_steering_vectors(
                model,
                &prompts,
                layers.as_deref(),
                batch_size,
            )?;
            Ok(SteeringVectorResponse { steering_vectors })
        })
        .await
    }

    async fn run_with_steering(
        &self,
        req: RunWithSteeringRequest,
    ) -> LensResult<RunWithSteeringResponse> {
        let limit = self.max_generation_tokens;
        let model_name = req.model_name.clone();
        self.with_model(&model_name, move |model| {
            steering::run_with_steering(
                model,
                &req.prompt,
                &req.steering_vectors,
                req.layer,
                req.scaling_factor,
                req.max_tokens,
                limit,
            )
            .map(RunWithSteeringResponse::from)
        })
        .await
    }

    fn loaded_models(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.registry.usage().snapshot()
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Forwards requests to per-model workers over HTTP. No retries.
pub struct RemoteExecutor {
    client: reqwest::Client,
    config: RemoteConfig,
    usage: UsageLog,
}

impl RemoteExecutor {
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            usage: UsageLog::new(),
        })
    }

    fn transport_error(&self, err: &reqwest::Error) -> LensError {
        if err.is_timeout() {
            LensError::Timeout(self.config.timeout)
        } else {
            LensError::Upstream(format!("worker request failed: {err}"))
        }
    }

    async fn post<Req, Resp>(&self, model_name: &str, route: &str, body: &Req) -> LensResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if catalog::lookup(model_name).is_none() {
            return Err(LensError::NotFound(model_name.to_string()));
        }
        let url = self.config.endpoint(model_name, route)?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    LensError::InvalidRequest(message)
                }
                StatusCode::NOT_FOUND => LensError::NotFound(message),
                StatusCode::SERVICE_UNAVAILABLE => LensError::ResourceExhausted(message),
                StatusCode::GATEWAY_TIMEOUT => LensError::Timeout(self.config.timeout),
                _ => LensError::Upstream(format!("worker returned {status}: {message}")),
            });
        }

        let body = response.json::<Resp>().await.map_err(|e| {
            if e.is_timeout() {
                LensError::Timeout(self.config.timeout)
            } else {
                LensError::Upstream(format!("unreadable worker response: {e}"))
            }
        })?;
        self.usage.record_use(model_name);
        Ok(body)
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn logit_lens(&self, req: LogitLensRequest) -> LensResult<LogitLensResponse> {
        self.post(&req.model_name, ROUTE_LOGIT_LENS, &req).await
    }

    async fn calculate_steering(
        &self,
        req: SteeringVectorRequest,
    ) -> LensResult<SteeringVectorResponse> {
        req.contrast_prompts()?;
        self.post(&req.model_name, ROUTE_STEERING_CALCULATE, &req)
            .await
    }

    async fn run_with_steering(
        &self,
        req: RunWithSteeringRequest,
    ) -> LensResult<RunWithSteeringResponse> {
        self.post(&req.model_name, ROUTE_RUN_WITH_STEERING, &req)
            .await
    }

    fn loaded_models(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.usage.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TinyLoader;

    fn local() -> LocalExecutor {
        let registry = Arc::new(ModelRegistry::new(Arc::new(TinyLoader::new())));
        LocalExecutor::new(registry, 4, 32)
    }

    #[tokio::test]
    async fn test_local_logit_lens_records_use() {
        let exec = local();
        let resp = exec
            .logit_lens(LogitLensRequest {
                model_name: "gpt2-small".into(),
                input: "the cat sat".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.input_tokens, vec!["the", "cat", "sat"]);
        assert_eq!(resp.logit_lens.len(), 3);
        assert!(exec.loaded_models().contains_key("gpt2-small"));
    }

    #[tokio::test]
    async fn test_failed_request_does_not_record_use() {
        let exec = local();
        let err = exec
            .logit_lens(LogitLensRequest {
                model_name: "gpt2-small".into(),
                input: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LensError::InvalidRequest(_)));
        assert!(exec.loaded_models().is_empty());
    }

    #[tokio::test]
    async fn test_local_steering_round_trip() {
        let exec = local();
        let strings = |s: &[&str]| Some(s.iter().map(|x| (*x).to_string()).collect());
        let vectors = exec
            .calculate_steering(SteeringVectorRequest {
                model_name: "qwen2.5-0.5b-instruct".into(),
                positive_prompts: strings(&["i love the cat", "happy dog"]),
                negative_prompts: strings(&["i hate the cat", "sad dog"]),
                layers: Some(vec![1]),
                ..Default::default()
            })
            .await
            .unwrap()
            .steering_vectors;
        assert_eq!(vectors.keys().copied().collect::<Vec<_>>(), vec![1]);

        let resp = exec
            .run_with_steering(RunWithSteeringRequest {
                model_name: "qwen2.5-0.5b-instruct".into(),
                prompt: "i think".into(),
                steering_vectors: vectors,
                layer: 1,
                scaling_factor: 4.0,
                max_tokens: 5,
            })
            .await
            .unwrap();
        assert!(resp.unsteered_response.starts_with("i think"));

        let over_limit = exec
            .run_with_steering(RunWithSteeringRequest {
                model_name: "qwen2.5-0.5b-instruct".into(),
                prompt: "i think".into(),
                steering_vectors: BTreeMap::from([(1, vec![0.0; 16])]),
                layer: 1,
                scaling_factor: 1.0,
                max_tokens: 33,
            })
            .await
            .unwrap_err();
        assert!(matches!(over_limit, LensError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_remote_rejects_unknown_model_without_calling_out() {
        let exec = RemoteExecutor::new(RemoteConfig {
            workspace: "lab".into(),
            app: "lenscope".into(),
            base_url: None,
            timeout: std::time::Duration::from_secs(1),
        })
        .unwrap();
        let err = exec
            .logit_lens(LogitLensRequest {
                model_name: "gpt9-enormous".into(),
                input: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LensError::NotFound(_)));
    }
}
