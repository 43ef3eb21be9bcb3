use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "svcdir",
    about = "Replicated service-discovery directory",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the directory node (default).
    Run,

    /// Ask a cluster node to admit this node as a member.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// API base URL of a running cluster node, ideally the leader.
    #[arg(long, value_name = "URL")]
    pub peer: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "SVCDIR_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:5380"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "SVCDIR_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        global = true,
        env = "SVCDIR_CLUSTER_NAME",
        value_name = "NAME",
        default_value = "svcdir"
    )]
    pub cluster_name: String,

    #[arg(
        long,
        global = true,
        env = "SVCDIR_NODE_ID",
        value_name = "ID",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub node_id: u64,

    #[arg(
        long,
        global = true,
        env = "SVCDIR_NODE_NAME",
        value_name = "NAME",
        default_value = "node-1"
    )]
    pub node_name: String,

    #[arg(
        long,
        global = true,
        env = "SVCDIR_API_BASE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:5380"
    )]
    pub api_base_url: String,

    /// Raft RPC endpoint advertised to peers; defaults to the API base URL.
    #[arg(
        long,
        global = true,
        env = "SVCDIR_RAFT_ENDPOINT",
        value_name = "ORIGIN",
        default_value = ""
    )]
    pub raft_endpoint: String,

    /// Initialize a fresh single-node cluster on first start.
    #[arg(
        long,
        global = true,
        env = "SVCDIR_BOOTSTRAP",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub bootstrap: bool,
}

impl Config {
    pub fn raft_endpoint(&self) -> &str {
        if self.raft_endpoint.is_empty() {
            &self.api_base_url
        } else {
            &self.raft_endpoint
        }
    }
}
