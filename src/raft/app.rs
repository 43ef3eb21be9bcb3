use std::{collections::BTreeSet, future::Future, pin::Pin, sync::Arc};

use anyhow::Context;
use tokio::sync::watch;

use crate::{
    command::{Command, CommandResponse},
    raft::types::{NodeId, NodeMeta, TypeConfig},
    registry::Registry,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A write was submitted to a non-leader node. Carries the leader's
/// advertised API address (when known) so the caller can resubmit there.
#[derive(Debug, Clone)]
pub struct NotLeaderError {
    pub leader_api_base_url: Option<String>,
}

impl std::fmt::Display for NotLeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.leader_api_base_url {
            Some(url) => write!(f, "not the leader; resubmit to {url}"),
            None => write!(f, "not the leader; no leader known"),
        }
    }
}

impl std::error::Error for NotLeaderError {}

pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>;

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, anyhow::Result<CommandResponse>>;

    fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>>;

    fn add_voters(&self, node_ids: BTreeSet<NodeId>) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self { raft, metrics }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        let mut nodes = std::collections::BTreeMap::new();
        nodes.insert(node_id, node_meta);
        self.raft
            .initialize(nodes)
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, anyhow::Result<CommandResponse>> {
        Box::pin(async move {
            match self.raft.client_write(cmd).await {
                Ok(resp) => Ok(resp.data),
                Err(err) => {
                    let Some(openraft::error::ClientWriteError::ForwardToLeader(forward)) =
                        err.api_error()
                    else {
                        return Err(anyhow::anyhow!("raft client_write: {err}"));
                    };
                    let metrics_snapshot = self.metrics.borrow().clone();
                    Err(anyhow::Error::new(NotLeaderError {
                        leader_api_base_url: leader_api_base_url_from_forward(
                            forward,
                            &metrics_snapshot,
                        ),
                    }))
                }
            }
        })
    }

    fn add_learner(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .add_learner(node_id, node, false)
                .await
                .map_err(|e| anyhow::anyhow!("raft add_learner: {e}"))?;
            Ok(())
        })
    }

    fn add_voters(&self, node_ids: BTreeSet<NodeId>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .change_membership(openraft::ChangeMembers::AddVoterIds(node_ids), true)
                .await
                .map_err(|e| anyhow::anyhow!("raft change_membership(add_voters): {e}"))?;
            Ok(())
        })
    }
}

fn leader_api_base_url_from_forward(
    forward: &openraft::error::ForwardToLeader<NodeId, NodeMeta>,
    metrics: &openraft::RaftMetrics<NodeId, NodeMeta>,
) -> Option<String> {
    if let Some(node) = forward.leader_node.as_ref()
        && !node.api_base_url.is_empty()
    {
        return Some(node.api_base_url.clone());
    }
    let leader_id = forward.leader_id.or(metrics.current_leader)?;
    metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .and_then(|(_id, node)| {
            if node.api_base_url.is_empty() {
                None
            } else {
                Some(node.api_base_url.clone())
            }
        })
}

/// A test-only Raft facade that applies commands directly to the local
/// registry, skipping replication.
#[derive(Clone)]
pub struct LocalRaft {
    registry: Arc<tokio::sync::Mutex<Registry>>,
    metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
}

impl LocalRaft {
    pub fn new(
        registry: Arc<tokio::sync::Mutex<Registry>>,
        metrics: watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>>,
    ) -> Self {
        Self { registry, metrics }
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, anyhow::Result<CommandResponse>> {
        Box::pin(async move {
            let mut registry = self.registry.lock().await;
            let outcome = match cmd.apply(&mut registry) {
                Ok(outcome) => outcome,
                Err(domain) => return Ok(CommandResponse::from_domain(&domain)),
            };
            registry.save().map_err(anyhow::Error::new)?;
            Ok(CommandResponse::Ok { result: outcome })
        })
    }

    fn add_learner(&self, _node_id: NodeId, _node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn add_voters(&self, _node_ids: BTreeSet<NodeId>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}
