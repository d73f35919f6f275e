use std::sync::Arc;

use arbor_types::{ClientError, Configuration, ConfigurationResult, Server, ServerStats};

use crate::client_impl::ClientImpl;
use crate::config::ClientConfig;
use crate::deadline::Deadline;
use crate::leader_rpc::{GrpcLeaderRpc, LeaderRpc, MockLeaderRpc};
use crate::tree::Tree;

/// Entry point: a connection to one cluster. Trees obtained from it share
/// its leader connection and exactly-once session.
pub struct Cluster<R: LeaderRpc = GrpcLeaderRpc> {
    client: Arc<ClientImpl<R>>,
    admin_timeout_nanos: u64,
}

impl Cluster<GrpcLeaderRpc> {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        tracing::info!(hosts = ?config.hosts, "connecting to cluster");
        Ok(Self::with_leader_rpc(GrpcLeaderRpc::new(config)?, config))
    }
}

impl Cluster<MockLeaderRpc> {
    /// A cluster held entirely in memory.
    pub fn for_testing() -> Self {
        Self::with_leader_rpc(MockLeaderRpc::new(), &ClientConfig::default())
    }
}

impl<R: LeaderRpc> Cluster<R> {
    pub fn with_leader_rpc(leader: R, config: &ClientConfig) -> Self {
        Cluster {
            client: Arc::new(ClientImpl::new(leader, config.keep_alive_interval())),
            admin_timeout_nanos: config.admin_timeout_nanos(),
        }
    }

    pub fn leader_rpc(&self) -> &R {
        self.client.leader()
    }

    /// A tree handle with working directory `/`, no condition and no timeout.
    pub fn get_tree(&self) -> Tree<R> {
        Tree::new(Arc::clone(&self.client))
    }

    pub async fn get_configuration(&self) -> Result<Configuration, ClientError> {
        self.client
            .get_configuration(Deadline::after_nanos(self.admin_timeout_nanos))
            .await
    }

    /// Replaces the cluster membership if `old_id` is still current.
    pub async fn set_configuration(&self, old_id: u64, new_servers: Vec<Server>) -> ConfigurationResult {
        self.client
            .set_configuration(old_id, new_servers, Deadline::after_nanos(self.admin_timeout_nanos))
            .await
    }

    /// Statistics from the server at `host`. 0 means no timeout.
    pub async fn get_server_stats(&self, host: &str, timeout_nanos: u64) -> Result<ServerStats, ClientError> {
        self.client
            .get_server_stats(host, Deadline::after_nanos(timeout_nanos))
            .await
    }

    /// Stops the keep-alive coordinator. Trees stay usable but the session
    /// will no longer be kept alive.
    pub async fn shutdown(&self) {
        self.client.session().exit().await;
    }
}
