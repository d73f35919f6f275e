mod client_service;
mod convert;
mod node;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arbor_proto::v1::client_service_server::ClientServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic_reflection::server::Builder as ReflectionBuilder;

use client_service::ClientServiceImpl;

pub use node::{NodeError, Role, ServerNode};

fn router(
    node: Arc<ServerNode>,
    request_timeout: Duration,
) -> anyhow::Result<tonic::transport::server::Router> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(arbor_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    Ok(tonic::transport::Server::builder()
        .timeout(request_timeout)
        .add_service(ClientServiceServer::new(ClientServiceImpl::new(node)))
        .add_service(reflection))
}

pub async fn serve(addr: SocketAddr, node: Arc<ServerNode>, request_timeout: Duration) -> anyhow::Result<()> {
    tracing::info!(%addr, "client gRPC server starting");
    router(node, request_timeout)?
        .serve(addr)
        .await
        .map_err(Into::into)
}

/// Serves on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    node: Arc<ServerNode>,
    request_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "client gRPC server starting");
    router(node, request_timeout)?
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use arbor_client::{CallOutcome, ClientConfig, Cluster, Deadline, LeaderCall, LeaderRpc};
    use arbor_tree::MemCluster;
    use arbor_types::protocol::{encode, GetConfigurationRequest, OpCode};
    use tokio::sync::oneshot;

    use super::*;

    struct Running {
        addr: String,
        node: Arc<ServerNode>,
        _stop: oneshot::Sender<()>,
    }

    async fn start(server_id: u64, role: Role, cluster: &Arc<Mutex<MemCluster>>) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        start_on(listener, server_id, role, cluster)
    }

    fn start_on(
        listener: TcpListener,
        server_id: u64,
        role: Role,
        cluster: &Arc<Mutex<MemCluster>>,
    ) -> Running {
        let addr = listener.local_addr().unwrap().to_string();
        let node = Arc::new(ServerNode::new(server_id, addr.clone(), role, Arc::clone(cluster)));
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(serve_with_shutdown(
            listener,
            Arc::clone(&node),
            Duration::from_secs(5),
            async move {
                let _ = stopped.await;
            },
        ));
        Running {
            addr,
            node,
            _stop: stop,
        }
    }

    fn client(hosts: &[&str]) -> Cluster {
        let config = ClientConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            keep_alive_interval_ms: 0,
            ..ClientConfig::default()
        };
        Cluster::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_follower_redirects_to_leader() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        let leader = start(1, Role::Leader, &state).await;
        let follower = start(
            2,
            Role::Follower {
                leader_hint: Some(leader.addr.clone()),
            },
            &state,
        )
        .await;

        let cluster = client(&[&follower.addr]);
        let tree = cluster.get_tree();
        tree.set_timeout(5_000_000_000);
        tree.make_directory("/svc").await.unwrap();
        tree.write("/svc/name", "arbor").await.unwrap();
        assert_eq!(tree.read("/svc/name").await.unwrap(), "arbor");

        let rpc = cluster.leader_rpc();
        assert_eq!(rpc.leader_address(), Some(leader.addr.clone()));
        assert_eq!(rpc.failures_since_last_success(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_survives_leader_change() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        let a = start(1, Role::Leader, &state).await;
        let b = start(2, Role::Follower { leader_hint: None }, &state).await;

        let cluster = client(&[&a.addr, &b.addr]);
        let tree = cluster.get_tree();
        tree.set_timeout(5_000_000_000);
        tree.write("/before", "1").await.unwrap();

        a.node.set_role(Role::Follower { leader_hint: None });
        b.node.set_role(Role::Leader);

        tree.write("/after", "2").await.unwrap();
        assert_eq!(tree.list_directory("/").await.unwrap(), vec!["after", "before"]);
        assert_eq!(cluster.leader_rpc().leader_address(), Some(b.addr.clone()));
        assert_eq!(state.lock().unwrap().sessions().len(), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_stats_from_follower() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        let follower = start(9, Role::Follower { leader_hint: None }, &state).await;

        let cluster = client(&[&follower.addr]);
        let stats = cluster
            .get_server_stats(&follower.addr, 5_000_000_000)
            .await
            .unwrap();
        assert_eq!(stats.server_id, 9);
        assert_eq!(stats.address, follower.addr);
        assert!(!stats.is_leader);
    }

    #[tokio::test]
    async fn test_no_leader_times_out() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        let follower = start(3, Role::Follower { leader_hint: None }, &state).await;

        let cluster = client(&[&follower.addr]);
        let tree = cluster.get_tree();
        tree.set_timeout(300_000_000);
        let err = tree.read("/x").await.unwrap_err();
        assert_eq!(err, arbor_client::ClientError::timeout());
        assert!(cluster.leader_rpc().failures_since_last_success() >= 1);
    }

    #[tokio::test]
    async fn test_refused_host_is_skipped() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        // Reserve a port, then release it so connections are refused until
        // the leader starts there.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let late_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let cluster = client(&["127.0.0.1:1", &late_addr.to_string()]);
        let tree = cluster.get_tree();
        tree.set_timeout(10_000_000_000);
        let pending = tokio::spawn(async move { tree.write("/f", "v").await });

        // Both hosts have been tried and refused.
        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.leader_rpc().failures_since_last_success() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cluster.leader_rpc().leader_address(), None);

        let leader = start_on(TcpListener::bind(late_addr).await.unwrap(), 1, Role::Leader, &state);
        pending.await.unwrap().unwrap();
        assert_eq!(cluster.leader_rpc().leader_address(), Some(leader.addr.clone()));
        assert_eq!(cluster.leader_rpc().failures_since_last_success(), 0);
        assert_eq!(state.lock().unwrap().tree().read("/f").unwrap(), "v");
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_after_early_timeout_still_gets_result() {
        let state = Arc::new(Mutex::new(MemCluster::new()));
        let leader = start(1, Role::Leader, &state).await;
        let cluster = client(&[&leader.addr]);

        let call = cluster.leader_rpc().make_call();
        call.start(
            OpCode::GetConfiguration,
            encode(&GetConfigurationRequest {}).unwrap(),
            Deadline::Never,
        );
        assert_eq!(call.wait(Deadline::expired()).await, CallOutcome::Timeout);
        let second = call.wait(Deadline::after(Duration::from_secs(3))).await;
        assert!(matches!(second, CallOutcome::Ok(_)), "{second:?}");
        assert_eq!(call.wait(Deadline::expired()).await, second);
    }
}
