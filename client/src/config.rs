//! Client configuration: CLI flags with env fallbacks.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cok", version, about = "Expose a local HTTP service through a public tunnel")]
pub struct Cli {
    /// Local port to expose
    #[arg(short = 'p', long = "port")]
    pub port: u16,

    /// Requested subdomain (falls back to COK_SUBDOMAIN, then a server-generated one)
    #[arg(short = 's', long = "subdomain")]
    pub subdomain: Option<String>,

    /// API key (falls back to COK_API_KEY)
    #[arg(long = "api-key")]
    pub api_key: Option<String>,

    /// Relay server URL (falls back to COK_SERVER_URL)
    #[arg(long = "server")]
    pub server: Option<String>,

    /// Local origin host (default: 127.0.0.1)
    #[arg(long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

pub struct ClientConfig {
    pub local_port: u16,
    pub local_host: String,
    pub subdomain: Option<String>,
    pub api_key: String,
    pub server_url: String,
    pub verbose: bool,
    pub max_reconnect_attempts: Option<u32>,
}

impl ClientConfig {
    pub fn resolve(cli: Cli) -> Result<Self, String> {
        let api_key = cli
            .api_key
            .or_else(|| std::env::var("COK_API_KEY").ok())
            .ok_or_else(|| "missing API key: pass --api-key or set COK_API_KEY".to_string())?;

        let subdomain = cli.subdomain.or_else(|| std::env::var("COK_SUBDOMAIN").ok());

        let server_url = cli
            .server
            .or_else(|| std::env::var("COK_SERVER_URL").ok())
            .unwrap_or_else(|| "ws://localhost:8081/tunnel".to_string());

        let max_reconnect_attempts = std::env::var("COK_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok());

        Ok(Self {
            local_port: cli.port,
            local_host: cli.host,
            subdomain,
            api_key,
            server_url,
            verbose: cli.verbose,
            max_reconnect_attempts,
        })
    }
}
