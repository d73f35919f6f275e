use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use arbor_tree::{DispatchError, MemCluster};
use arbor_types::protocol::{encode, GetServerStatsResponse, OpCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    /// Rejects everything except server stats, pointing clients at `leader_hint`.
    Follower { leader_hint: Option<String> },
}

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("unknown op code {0}")]
    UnknownOpCode(u32),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<DispatchError> for NodeError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidRequest(msg) => NodeError::InvalidRequest(msg),
            DispatchError::Codec(e) => NodeError::InvalidRequest(e.to_string()),
        }
    }
}

/// One server: its identity, its current role, and the replicated state it
/// serves while leading.
pub struct ServerNode {
    server_id: u64,
    address: String,
    role: RwLock<Role>,
    cluster: Arc<Mutex<MemCluster>>,
}

impl ServerNode {
    pub fn new(
        server_id: u64,
        address: impl Into<String>,
        role: Role,
        cluster: Arc<Mutex<MemCluster>>,
    ) -> Self {
        ServerNode {
            server_id,
            address: address.into(),
            role: RwLock::new(role),
            cluster,
        }
    }

    pub fn role(&self) -> Role {
        self.role.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_role(&self, role: Role) {
        tracing::info!(server_id = self.server_id, ?role, "role changed");
        *self.role.write().unwrap_or_else(PoisonError::into_inner) = role;
    }

    fn cluster(&self) -> MutexGuard<'_, MemCluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles one enveloped request and returns the encoded reply.
    pub fn handle(&self, op_code: u32, payload: &[u8]) -> Result<Vec<u8>, NodeError> {
        let op = OpCode::try_from(op_code).map_err(NodeError::UnknownOpCode)?;
        let role = self.role();
        if op == OpCode::GetServerStats {
            let mut stats = self.cluster().stats();
            stats.server_id = self.server_id;
            stats.address = self.address.clone();
            stats.is_leader = role == Role::Leader;
            return encode(&GetServerStatsResponse { stats })
                .map_err(|e| NodeError::InvalidRequest(e.to_string()));
        }
        match role {
            Role::Leader => Ok(self.cluster().dispatch(op, payload)?),
            Role::Follower { leader_hint } => Err(NodeError::NotLeader {
                leader: leader_hint,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use arbor_types::protocol::{decode, OpenSessionResponse};

    use super::*;

    fn node(role: Role) -> ServerNode {
        ServerNode::new(7, "127.0.0.1:7000", role, Arc::new(Mutex::new(MemCluster::new())))
    }

    #[test]
    fn test_leader_applies_requests() {
        let node = node(Role::Leader);
        let reply = node.handle(OpCode::OpenSession.as_u32(), &[]).unwrap();
        assert_eq!(decode::<OpenSessionResponse>(&reply).unwrap().client_id, 1);
    }

    #[test]
    fn test_follower_redirects() {
        let node = node(Role::Follower {
            leader_hint: Some("127.0.0.1:7001".into()),
        });
        match node.handle(OpCode::OpenSession.as_u32(), &[]) {
            Err(NodeError::NotLeader { leader }) => {
                assert_eq!(leader.as_deref(), Some("127.0.0.1:7001"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stats_answered_by_any_role() {
        let node = node(Role::Follower { leader_hint: None });
        let reply = node.handle(OpCode::GetServerStats.as_u32(), &[]).unwrap();
        let stats = decode::<GetServerStatsResponse>(&reply).unwrap().stats;
        assert_eq!(stats.server_id, 7);
        assert!(!stats.is_leader);
    }

    #[test]
    fn test_unknown_op_code() {
        let node = node(Role::Leader);
        assert!(matches!(node.handle(99, &[]), Err(NodeError::UnknownOpCode(99))));
    }
}
