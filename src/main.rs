use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = svcdir::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(svcdir::config::Command::Run);

    match cmd {
        svcdir::config::Command::Run => run_server(cli.config).await,
        svcdir::config::Command::Join(args) => join_cluster(cli.config, args.peer).await,
    }
}

async fn run_server(config: svcdir::config::Config) -> Result<()> {
    let registry = svcdir::registry::Registry::load_or_init(&config.data_dir)?;
    let registry = Arc::new(Mutex::new(registry));

    let raft = svcdir::raft::runtime::start_raft(
        &config.data_dir,
        config.cluster_name.clone(),
        config.node_id,
        registry.clone(),
        svcdir::raft::network_http::HttpNetworkFactory::new(),
    )
    .await?;

    let node_meta = svcdir::raft::NodeMeta {
        name: config.node_name.clone(),
        api_base_url: config.api_base_url.clone(),
        raft_endpoint: config.raft_endpoint().to_string(),
    };

    if config.bootstrap {
        raft.initialize_single_node_if_needed(config.node_id, node_meta)
            .await?;
    }

    let raft_facade: Arc<dyn svcdir::raft::app::RaftFacade> = Arc::new(raft.clone());
    let app = svcdir::http::build_router(registry, raft_facade, Some(raft.raft()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        node_id = config.node_id,
        data_dir = %config.data_dir.display(),
        "starting svcdir"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// One-shot: ask `peer`'s leader to admit this (already running) node.
async fn join_cluster(config: svcdir::config::Config, peer: String) -> Result<()> {
    let req = svcdir::http::JoinRequest {
        node_id: config.node_id,
        name: config.node_name.clone(),
        api_base_url: config.api_base_url.clone(),
        raft_endpoint: config.raft_endpoint().to_string(),
    };

    let url = format!("{}/api/cluster/join", peer.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(url)
        .json(&req)
        .send()
        .await?
        .error_for_status()?
        .json::<serde_json::Value>()
        .await?;

    let node_id = resp
        .get("node_id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("missing node_id in join response"))?;
    info!(node_id, peer = %peer, "joined cluster");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
