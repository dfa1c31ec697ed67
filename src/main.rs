//! lenscope CLI: serve the API, or run a one-shot logit lens

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use lenscope::config::{
    Config, ExecutionMode, RemoteConfig, SecretToken, DEFAULT_MAX_GENERATION_TOKENS,
    DEFAULT_STEERING_BATCH_SIZE,
};
use lenscope::model::LoadOptions;
use lenscope::{api, catalog, dispatch, logit_lens, LensModel};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

#[derive(Parser)]
#[command(name = "lenscope")]
#[command(about = "Logit lens and activation steering over HTTP")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve(ServeArgs),
    /// Print the logit lens of one input
    Lens(LensArgs),
}

/// Flags shared by every subcommand
#[derive(Args, Clone)]
struct CommonArgs {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Access token for gated models
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<SecretToken>,
}

impl CommonArgs {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            hf_token: self.hf_token.clone(),
            force_cpu: self.cpu,
        }
    }
}

#[derive(Args, Clone)]
struct ServeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Address to listen on
    #[arg(long, env = "LENSCOPE_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,

    /// Forward requests to remote GPU workers instead of running models here
    #[arg(long, env = "USE_REMOTE", value_parser = BoolishValueParser::new())]
    use_remote: bool,

    #[arg(long, env = "USE_MODAL", hide = true, value_parser = BoolishValueParser::new())]
    use_modal: bool,

    /// Workspace of the remote deployment
    #[arg(long, env = "REMOTE_WORKSPACE", default_value = "lenscope")]
    remote_workspace: String,

    /// Application name of the remote deployment
    #[arg(long, env = "REMOTE_APP", default_value = "lenscope")]
    remote_app: String,

    /// Send every remote call to this worker instead of per-model URLs
    #[arg(long, env = "REMOTE_BASE_URL")]
    remote_base_url: Option<Url>,

    /// Bound on each remote call
    #[arg(long, env = "REMOTE_TIMEOUT_SECS", default_value_t = 60)]
    remote_timeout_secs: u64,

    /// Prompts per activation-capture batch
    #[arg(long, env = "STEERING_BATCH_SIZE", default_value_t = DEFAULT_STEERING_BATCH_SIZE)]
    steering_batch_size: usize,

    /// Upper bound on `max_tokens` for steered generation
    #[arg(long, env = "MAX_GENERATION_TOKENS", default_value_t = DEFAULT_MAX_GENERATION_TOKENS)]
    max_generation_tokens: usize,

    /// Allowed CORS origin (repeatable; any origin when omitted)
    #[arg(long = "cors-origin", env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,
}

impl ServeArgs {
    fn into_config(self) -> Config {
        let mode = if self.use_remote || self.use_modal {
            ExecutionMode::Remote(RemoteConfig {
                workspace: self.remote_workspace,
                app: self.remote_app,
                base_url: self.remote_base_url,
                timeout: Duration::from_secs(self.remote_timeout_secs),
            })
        } else {
            ExecutionMode::Local
        };
        Config {
            bind: self.bind,
            mode,
            steering_batch_size: self.steering_batch_size.max(1),
            max_generation_tokens: self.max_generation_tokens,
            cors_origins: self.cors_origins,
            load: self.common.load_options(),
        }
    }
}

#[derive(Args)]
struct LensArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Model name (see `GET /available_models`)
    #[arg(short, long, default_value = "gpt2-small")]
    model: String,

    /// Text to analyze
    #[arg(short, long)]
    input: String,

    /// Also print the top-k candidates at every layer
    #[arg(long)]
    top_k: Option<usize>,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Serve(args) => {
            init_logging(args.common.verbose)?;
            let config = args.into_config();
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(serve(config))
        }
        Command::Lens(args) => {
            init_logging(args.common.verbose)?;
            lens(&args)
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(
        "Starting lenscope ({} mode)",
        if config.is_remote() { "remote" } else { "local" }
    );
    let executor = dispatch::from_config(&config)?;
    let app = api::router(executor, &config.cors_origins)?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

fn lens(args: &LensArgs) -> Result<()> {
    let entry = catalog::lookup(&args.model).with_context(|| {
        format!(
            "Unknown model {}; available: {}",
            args.model,
            catalog::available_models().join(", ")
        )
    })?;

    let model = LensModel::from_pretrained(entry, &args.common.load_options())?;
    info!(
        "Model: {} layers, {} heads, {} hidden, context {}",
        model.n_layers(),
        model.n_heads(),
        model.d_model(),
        model.max_context()
    );

    let analysis = logit_lens::analyze(&model, &args.input)?;
    analysis.print_summary();
    if let Some(k) = args.top_k {
        println!();
        analysis.print_detailed(k);
    }
    Ok(())
}
