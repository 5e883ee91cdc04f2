//! Server configuration, loaded once at startup.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    /// Bind port for the control-plane WebSocket upgrade. `TCP_PORT`
    /// and `WS_PORT` are accepted as aliases for the same setting —
    /// both name a single bound socket.
    pub control_port: u16,
    pub api_key_secret: String,
    pub base_domain: String,
    pub max_tunnels: usize,
    pub allowed_hosts: Option<HashSet<String>>,
    pub health_check_paths: HashSet<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let http_port = env_parse("HTTP_PORT", 8080)?;
        let control_port = match std::env::var("WS_PORT").or_else(|_| std::env::var("TCP_PORT")) {
            Ok(v) => v.parse().context("WS_PORT/TCP_PORT must be a valid u16")?,
            Err(_) => 8081,
        };

        let api_key_secret =
            std::env::var("API_KEY_SECRET").context("API_KEY_SECRET must be set")?;
        if api_key_secret.len() < 32 {
            bail!("API_KEY_SECRET must be at least 32 bytes, got {}", api_key_secret.len());
        }

        let base_domain = std::env::var("BASE_DOMAIN").unwrap_or_else(|_| "localhost".to_string());
        let max_tunnels = env_parse("MAX_TUNNELS", 1000)?;

        let allowed_hosts = std::env::var("ALLOWED_HOSTS").ok().map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let health_check_paths = std::env::var("HEALTH_CHECK_PATHS")
            .unwrap_or_else(|_| "/health,/health/live,/health/ready".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            http_port,
            control_port,
            api_key_secret,
            base_domain,
            max_tunnels,
            allowed_hosts,
            health_check_paths,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}
