use std::net::SocketAddr;

use anyhow::{Context, Result, bail};

pub const KEY_ENV: &str = "HOOKBOT_KEY";
pub const GITHUB_SECRET_ENV: &str = "HOOKBOT_GITHUB_SECRET";

// Service configuration: flags plus the secrets sourced from environment
// variables so they never appear in argv.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    // HTTP listener bind address.
    pub bind: SocketAddr,
    // HMAC secret for URL tokens.
    pub key: String,
    // Shared secret for validating GitHub payload signatures.
    pub github_secret: Option<String>,
    // Routers to enable, by name.
    pub routers: Vec<String>,
    // Allowed websocket origins; empty means origin is not checked.
    pub allowed_origins: Vec<String>,
    // Optional Prometheus exporter bind address.
    pub metrics_bind: Option<SocketAddr>,
}

impl ServeConfig {
    pub fn from_env(
        bind: SocketAddr,
        routers: Vec<String>,
        allowed_origins: Vec<String>,
        metrics_bind: Option<SocketAddr>,
    ) -> Result<Self> {
        let key = std::env::var(KEY_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .with_context(|| format!("{KEY_ENV} not set"))?;
        let github_secret = std::env::var(GITHUB_SECRET_ENV)
            .ok()
            .filter(|value| !value.is_empty());

        if routers.iter().any(|name| name == "github") && github_secret.is_none() {
            bail!("{GITHUB_SECRET_ENV} not set but the github router is enabled");
        }

        Ok(Self {
            bind,
            key,
            github_secret,
            routers,
            allowed_origins,
            metrics_bind,
        })
    }
}
