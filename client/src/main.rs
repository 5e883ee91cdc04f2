use clap::Parser;
use tracing::error;

mod config;
mod session;

use config::{Cli, ClientConfig};
use session::{ClientSession, GiveUp, SessionConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match ClientConfig::resolve(cli) {
        Ok(c) => c,
        Err(msg) => {
            error!("{msg}");
            std::process::exit(1);
        }
    };

    println!("cok: exposing {}:{} -> {}", config.local_host, config.local_port, config.server_url);

    let session = ClientSession::new(SessionConfig {
        server_url: config.server_url,
        api_key: config.api_key,
        requested_subdomain: config.subdomain,
        local_host: config.local_host,
        local_port: config.local_port,
        max_attempts: config.max_reconnect_attempts,
    });

    tokio::select! {
        result = session.run() => {
            match result {
                Ok(()) => std::process::exit(0),
                Err(GiveUp::Fatal(msg)) => {
                    error!("fatal error: {msg}");
                    std::process::exit(1);
                }
                Err(GiveUp::Exhausted) => {
                    error!("reconnect attempts exhausted");
                    std::process::exit(2);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("shutting down");
            std::process::exit(0);
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}
