use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use crate::{
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        storage::{FileLogStore, RegistryStateMachine},
        types::{NodeId, TypeConfig},
    },
    registry::Registry,
};

pub async fn start_raft(
    data_dir: &std::path::Path,
    cluster_name: String,
    node_id: NodeId,
    registry: Arc<Mutex<Registry>>,
    network: HttpNetworkFactory,
) -> anyhow::Result<RealRaft> {
    let config = {
        #[cfg(test)]
        {
            openraft::Config {
                cluster_name,
                ..Default::default()
            }
        }

        #[cfg(not(test))]
        {
            // Production defaults: tuned for WAN-ish latencies between
            // directory nodes. OpenRaft uses `heartbeat_interval` as the hard
            // TTL for replication RPCs, so 50ms is far too aggressive outside
            // local networks.
            openraft::Config {
                cluster_name,
                heartbeat_interval: 2_000,
                election_timeout_min: 6_000,
                election_timeout_max: 12_000,
                install_snapshot_timeout: 30_000,
                ..Default::default()
            }
        }
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let config = Arc::new(config);

    let log_store = FileLogStore::open(data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine = RegistryStateMachine::open(data_dir, registry)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft =
        openraft::Raft::<TypeConfig>::new(node_id, config, network, log_store, state_machine)
            .await
            .context("start raft")?;

    // NOTE: initialization is handled by the caller because it depends on
    // cluster bootstrap mode.
    Ok(RealRaft::new(raft))
}
