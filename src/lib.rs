pub mod command;
pub mod config;
pub mod domain;
pub mod http;
pub mod raft;
pub mod registry;
