use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResponse};

/// Raft node identifier type for this project.
pub type NodeId = u64;

/// Raft node metadata stored in membership config and exposed to networking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// A human-friendly node name (optional).
    pub name: String,

    /// The client-facing API base URL, handed back to callers whose write
    /// landed on a follower.
    pub api_base_url: String,

    /// The Raft RPC endpoint peers post append/vote/snapshot requests to.
    pub raft_endpoint: String,
}

/// OpenRaft type configuration for this project.
///
/// Log entries carry registry [`Command`]s; the apply result is the
/// [`CommandResponse`] the proposer is waiting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = Command;
    type R = CommandResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
