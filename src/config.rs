//! Service configuration
//!
//! Built once in `main` from command-line flags and environment variables,
//! then shared read-only with the executors and the router.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::catalog;
use crate::model::LoadOptions;

/// Default number of prompts per activation-capture batch
pub const DEFAULT_STEERING_BATCH_SIZE: usize = 16;
/// Default upper bound on `max_tokens` for steered generation
pub const DEFAULT_MAX_GENERATION_TOKENS: usize = 512;
/// Default bound on a remote worker call
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Access token whose value never appears in logs or `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token, for handing to the hub client
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

impl FromStr for SecretToken {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Where a remote worker for a given model lives
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Workspace name of the serverless GPU deployment
    pub workspace: String,
    /// Application name of the deployment
    pub app: String,
    /// Fixed worker address, overriding the per-model URL scheme
    pub base_url: Option<Url>,
    pub timeout: Duration,
}

impl RemoteConfig {
    /// Worker URL for `route` on the worker serving `model_name`.
    ///
    /// Per-model workers live at
    /// `https://{workspace}--{app}-{model-slug}.modal.run/{route}`.
    pub fn endpoint(&self, model_name: &str, route: &str) -> anyhow::Result<Url> {
        let route = route.trim_start_matches('/');
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => Url::parse(&format!(
                "https://{}--{}-{}.modal.run/",
                self.workspace,
                self.app,
                catalog::slug(model_name)
            ))?,
        };
        let base = if base.path().ends_with('/') {
            base
        } else {
            Url::parse(&format!("{base}/"))?
        };
        Ok(base.join(route)?)
    }
}

/// Local in-process execution or delegation to remote workers
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    Local,
    Remote(RemoteConfig),
}

/// Full service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub mode: ExecutionMode,
    pub steering_batch_size: usize,
    pub max_generation_tokens: usize,
    /// Allowed CORS origins; empty means any origin
    pub cors_origins: Vec<String>,
    pub load: LoadOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            mode: ExecutionMode::Local,
            steering_batch_size: DEFAULT_STEERING_BATCH_SIZE,
            max_generation_tokens: DEFAULT_MAX_GENERATION_TOKENS,
            cors_origins: Vec::new(),
            load: LoadOptions::default(),
        }
    }
}

impl Config {
    pub fn is_remote(&self) -> bool {
        matches!(self.mode, ExecutionMode::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base_url: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            workspace: "lab".into(),
            app: "lenscope".into(),
            base_url: base_url.map(|u| Url::parse(u).unwrap()),
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    #[test]
    fn test_secret_token_is_redacted() {
        let token: SecretToken = "hf_abcdef".parse().unwrap();
        assert_eq!(format!("{token:?}"), "SecretToken(***)");
        assert_eq!(token.expose(), "hf_abcdef");

        let opts = LoadOptions {
            hf_token: Some(token),
            force_cpu: true,
        };
        assert!(!format!("{opts:?}").contains("hf_abcdef"));
    }

    #[test]
    fn test_remote_endpoint_per_model() {
        let url = remote(None)
            .endpoint("qwen2.5-0.5b-instruct", "/logitlens")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://lab--lenscope-qwen2-5-0-5b-instruct.modal.run/logitlens"
        );
    }

    #[test]
    fn test_remote_endpoint_with_base_url() {
        let url = remote(Some("http://127.0.0.1:9000/worker"))
            .endpoint("gpt2-small", "steering/calculate")
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/worker/steering/calculate");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.is_remote());
        assert_eq!(config.steering_batch_size, 16);
    }
}
