use std::{collections::BTreeSet, sync::Arc};

use anyhow::Context as _;
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::{Duration, Instant},
};

use svcdir::{
    command::{Command, CommandOutcome, CommandResponse},
    domain::{Service, ServiceSpec},
    raft::{
        NodeId, NodeMeta,
        app::RaftFacade as _,
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        network_http::HttpNetworkFactory,
        runtime::start_raft,
        types::TypeConfig,
    },
    registry::Registry,
};

struct RpcServerHandle {
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl RpcServerHandle {
    async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .context("join raft rpc server task")?
            .context("raft rpc server exited with error")?;
        Ok(())
    }
}

async fn spawn_raft_rpc_server(raft: openraft::Raft<TypeConfig>) -> anyhow::Result<RpcServerHandle> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind raft rpc listener")?;
    let addr = listener.local_addr().context("raft rpc local_addr")?;
    let base_url = format!("http://{addr}");

    let router = build_raft_rpc_router(RaftRpcState { raft });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|e| anyhow::anyhow!("axum serve: {e}"))?;
        Ok(())
    });

    Ok(RpcServerHandle {
        base_url,
        shutdown_tx: Some(shutdown_tx),
        join,
    })
}

async fn wait_for_leader(
    mut rx: tokio::sync::watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    expected_leader: NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.state == openraft::ServerState::Leader && m.current_leader == Some(expected_leader)
            {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for leader={expected_leader}; state={:?} current_leader={:?}",
                m.state,
                m.current_leader
            );
        }

        rx.changed().await.context("metrics changed")?;
    }
}

async fn wait_for_voter(
    mut rx: tokio::sync::watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    voter_id: NodeId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let m = rx.borrow();
            if m.membership_config.voter_ids().any(|id| id == voter_id) {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            let m = rx.borrow();
            anyhow::bail!(
                "timeout waiting for voter_id={voter_id}; membership={}",
                m.membership_config
            );
        }

        rx.changed().await.context("metrics changed")?;
    }
}

async fn wait_for_service(
    registry: &Arc<Mutex<Registry>>,
    uuid: &str,
    timeout: Duration,
) -> anyhow::Result<Service> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(service) = { registry.lock().await.get_uuid(uuid) } {
            return Ok(service);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for replicated service uuid={uuid}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn raft_two_node_replication_smoke() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir().context("tempdir")?;
    let node1_dir = tmp.path().join("node-1");
    let node2_dir = tmp.path().join("node-2");

    let registry1 = Arc::new(Mutex::new(
        Registry::load_or_init(&node1_dir).context("init registry-1")?,
    ));
    let registry2 = Arc::new(Mutex::new(
        Registry::load_or_init(&node2_dir).context("init registry-2")?,
    ));

    let cluster_name = "raft-two-node-replication-smoke".to_string();

    let node1_id: NodeId = 1;
    let node2_id: NodeId = 2;

    let raft1 = start_raft(
        &node1_dir,
        cluster_name.clone(),
        node1_id,
        registry1.clone(),
        HttpNetworkFactory::new(),
    )
    .await
    .context("start raft-1")?;
    let raft2 = start_raft(
        &node2_dir,
        cluster_name,
        node2_id,
        registry2.clone(),
        HttpNetworkFactory::new(),
    )
    .await
    .context("start raft-2")?;

    let rpc1 = spawn_raft_rpc_server(raft1.raft()).await.context("rpc-1")?;
    let rpc2 = spawn_raft_rpc_server(raft2.raft()).await.context("rpc-2")?;

    let node1_meta = NodeMeta {
        name: "node-1".to_string(),
        api_base_url: "http://127.0.0.1:5380".to_string(),
        raft_endpoint: rpc1.base_url.clone(),
    };
    let node2_meta = NodeMeta {
        name: "node-2".to_string(),
        api_base_url: "http://127.0.0.1:5381".to_string(),
        raft_endpoint: rpc2.base_url.clone(),
    };

    raft1
        .initialize_single_node_if_needed(node1_id, node1_meta.clone())
        .await
        .context("initialize node-1")?;

    wait_for_leader(raft1.metrics(), node1_id, Duration::from_secs(8)).await?;

    raft1
        .add_learner(node2_id, node2_meta)
        .await
        .context("add node-2 learner")?;

    let cmd = Command::add_service(
        "u1".to_string(),
        ServiceSpec {
            name: "api".to_string(),
            host: "api1.example.com".to_string(),
            port: 9000,
            environment: "production".to_string(),
            region: "east".to_string(),
            version: "1.0.0".to_string(),
            ttl: 30,
        },
    )
    .context("build add-service command")?;

    let resp = raft1
        .client_write(cmd)
        .await
        .context("client_write on leader")?;
    let CommandResponse::Ok {
        result: CommandOutcome::Service { service },
    } = resp
    else {
        anyhow::bail!("unexpected client_write response: {resp:?}");
    };

    // The follower converges on the exact replicated entry, including the
    // expiration instant the leader computed at construction time.
    let replicated = wait_for_service(&registry2, "u1", Duration::from_secs(8)).await?;
    assert_eq!(replicated, service);
    assert_eq!(replicated.expires, service.expires);

    raft1
        .add_voters(BTreeSet::from([node2_id]))
        .await
        .context("promote node-2 to voter")?;
    wait_for_voter(raft1.metrics(), node2_id, Duration::from_secs(8)).await?;
    let m = raft1.metrics().borrow().clone();
    assert!(m.membership_config.voter_ids().any(|id| id == node2_id));
    assert!(
        !m.membership_config
            .membership()
            .learner_ids()
            .any(|id| id == node2_id)
    );

    rpc1.shutdown().await?;
    rpc2.shutdown().await?;

    Ok(())
}
