// Hookbot entry point: turn webhooks into websockets.
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hookbot::config::ServeConfig;
use hookbot::http::{AppState, build_router};
use hookbot::{config, observability, tokens};
use hookbot_broker::Broker;
use hookbot_github::GithubRouter;

#[derive(Parser, Debug)]
#[command(name = "hookbot")]
#[command(about = "Turn webhooks into websockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a hookbot instance, listening on http
    Serve(ServeArgs),
    /// Given a list of URIs, generate tokens one per line
    #[command(alias = "t")]
    MakeTokens(MakeTokensArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, short = 'b', default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Enable a named router (repeatable)
    #[arg(long = "router")]
    routers: Vec<String>,

    /// Allowed websocket origin (repeatable; none means origin unchecked)
    #[arg(long = "origin")]
    origins: Vec<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct MakeTokensArgs {
    /// Print only tokens (not as basic-auth URLs)
    #[arg(long)]
    bare: bool,

    /// Base URL to generate for (not included in the hmac)
    #[arg(long, short = 'U', env = "HOOKBOT_URL_BASE", default_value = "http://localhost:8080")]
    url_base: String,

    /// URIs to mint tokens for
    #[arg(required = true)]
    uris: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::MakeTokens(args) => make_tokens(args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    observability::init_logging();
    let config = ServeConfig::from_env(args.bind, args.routers, args.origins, args.metrics_bind)?;

    if let Some(metrics_bind) = config.metrics_bind {
        let handle = observability::install_metrics_recorder();
        tokio::spawn(async move {
            if let Err(error) = observability::serve_metrics(handle, metrics_bind).await {
                tracing::warn!(%error, "metrics listener exited");
            }
        });
    }

    let broker = Arc::new(Broker::new());
    for name in &config.routers {
        match name.as_str() {
            "github" => {
                let secret = config
                    .github_secret
                    .clone()
                    .with_context(|| format!("{} not set", config::GITHUB_SECRET_ENV))?;
                broker
                    .add_router(Arc::new(GithubRouter::new(secret)))
                    .await
                    .context("attach github router")?;
            }
            other => bail!("unknown router: {other}"),
        }
    }

    let app = build_router(AppState {
        broker: broker.clone(),
        key: Arc::from(config.key.as_str()),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serve")?;

    broker.shutdown().await;
    tracing::info!("hookbot stopped");
    Ok(())
}

fn make_tokens(args: MakeTokensArgs) -> Result<()> {
    let key = std::env::var(config::KEY_ENV)
        .ok()
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{} not set", config::KEY_ENV))?;
    for line in tokens::make_tokens(&key, &args.url_base, &args.uris, args.bare)? {
        println!("{line}");
    }
    Ok(())
}
