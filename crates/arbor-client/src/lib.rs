//! Client for an arbor cluster: a replicated tree of directories and files.
//!
//! [`Cluster`] connects to the cluster and hands out [`Tree`] handles. Every
//! mutating operation is stamped through an [`ExactlyOnceSession`] so that
//! retries across leader changes are applied at most once.

mod backoff;
mod client_impl;
mod cluster;
mod config;
mod deadline;
pub mod leader_rpc;
mod path;
mod session;
mod tree;

pub use backoff::Backoff;
pub use client_impl::ClientImpl;
pub use cluster::Cluster;
pub use config::ClientConfig;
pub use deadline::Deadline;
pub use leader_rpc::{CallOutcome, GrpcLeaderRpc, LeaderCall, LeaderRpc, MockLeaderRpc};
pub use path::canonicalize;
pub use session::ExactlyOnceSession;
pub use tree::Tree;

pub use arbor_types::{
    ClientError, Condition, Configuration, ConfigurationResult, ConfigurationStatus, Outcome,
    Server, ServerStats, Status,
};
