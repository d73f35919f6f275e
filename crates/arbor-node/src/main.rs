use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use arbor_server::{serve, Role, ServerNode};
use arbor_tree::MemCluster;
use arbor_types::Server;

#[derive(clap::Parser, Debug)]
#[command(name = "arbor-node", about = "Single arbor server answering the client protocol")]
struct Cli {
    #[arg(long, default_value_t = 1)]
    server_id: u64,
    #[arg(long, default_value = "127.0.0.1:5254")]
    listen_addr: String,
    /// Run as a follower that redirects clients to this leader address.
    /// Pass an empty string to refuse without a hint.
    #[arg(long)]
    leader: Option<String>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    request_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    server: ServerConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("ARBOR_NODE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let addr: SocketAddr = cli
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", cli.listen_addr))?;

    let role = match cli.leader {
        None => Role::Leader,
        Some(hint) if hint.is_empty() => Role::Follower { leader_hint: None },
        Some(hint) => Role::Follower { leader_hint: Some(hint) },
    };

    tracing::info!(server_id = cli.server_id, %addr, ?role, "node starting");

    let cluster = Arc::new(Mutex::new(MemCluster::with_server(Server::new(
        cli.server_id,
        cli.listen_addr.clone(),
    ))));
    let node = Arc::new(ServerNode::new(cli.server_id, cli.listen_addr.clone(), role, cluster));

    serve(
        addr,
        node,
        Duration::from_millis(config.server.request_timeout_ms),
    )
    .await
}
