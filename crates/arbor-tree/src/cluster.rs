use std::collections::{BTreeSet, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use arbor_types::protocol::{
    decode, encode, GetConfigurationResponse, GetServerStatsResponse, OpCode,
    OpenSessionResponse, ReadOnlyOp, ReadOnlyTreeRequest, ReadOnlyTreeResponse, ReadWriteOp,
    ReadWriteTreeRequest, ReadWriteTreeResponse, SetConfigurationRequest,
    SetConfigurationResponse,
};
use arbor_types::{ClientError, Configuration, Outcome, Server, ServerStats};

use crate::sessions::SessionTable;
use crate::tree::MemTree;
use crate::DispatchError;

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Replicated state of a single-node cluster, applied in memory.
///
/// Each mutating command advances `last_applied` the way a committed log
/// entry would; the configuration id is the index of the entry that
/// installed it.
pub struct MemCluster {
    server: Server,
    tree: MemTree,
    sessions: SessionTable,
    configuration: Configuration,
    unreachable: BTreeSet<u64>,
    last_applied: u64,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::with_server(Server::new(1, "127.0.0.1:5254"))
    }

    /// A cluster whose bootstrap configuration holds only `server`.
    pub fn with_server(server: Server) -> Self {
        MemCluster {
            configuration: Configuration {
                id: 1,
                servers: vec![server.clone()],
            },
            server,
            tree: MemTree::new(),
            sessions: SessionTable::new(),
            unreachable: BTreeSet::new(),
            last_applied: 1,
        }
    }

    pub fn tree(&self) -> &MemTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut MemTree {
        &mut self.tree
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Servers with these ids are reported bad by configuration changes.
    pub fn mark_unreachable(&mut self, server_id: u64) {
        self.unreachable.insert(server_id);
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            server_id: self.server.server_id,
            address: self.server.address.clone(),
            is_leader: true,
            last_applied: self.last_applied,
            open_sessions: self.sessions.len() as u64,
            configuration_id: self.configuration.id,
            captured_at_ns: now_ns(),
        }
    }

    /// Decodes and applies one client request, returning the encoded reply.
    pub fn dispatch(&mut self, op: OpCode, payload: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let reply = match op {
            OpCode::OpenSession => {
                self.last_applied += 1;
                let client_id = self.sessions.open();
                tracing::debug!(client_id, "session opened");
                encode(&OpenSessionResponse { client_id })?
            }
            OpCode::ReadOnlyTree => encode(&self.read_only(decode(payload)?))?,
            OpCode::ReadWriteTree => {
                let response = self.read_write(decode(payload)?)?;
                encode(&response)?
            }
            OpCode::GetServerStats => encode(&GetServerStatsResponse {
                stats: self.stats(),
            })?,
            OpCode::GetConfiguration => encode(&GetConfigurationResponse {
                configuration: self.configuration.clone(),
            })?,
            OpCode::SetConfiguration => {
                let response = self.set_configuration(decode(payload)?);
                encode(&response)?
            }
        };
        Ok(reply)
    }

    fn read_only(&self, request: ReadOnlyTreeRequest) -> ReadOnlyTreeResponse {
        let mut response = ReadOnlyTreeResponse {
            status: arbor_types::Status::Ok,
            error: String::new(),
            children: Vec::new(),
            contents: String::new(),
        };
        let result = self.tree.check_condition(&request.condition).and_then(|()| {
            match request.op {
                ReadOnlyOp::ListDirectory { path } => {
                    response.children = self.tree.list_directory(&path)?;
                }
                ReadOnlyOp::Read { path } => {
                    response.contents = self.tree.read(&path)?;
                }
            }
            Ok(())
        });
        let outcome = Outcome::from(&result);
        response.status = outcome.status;
        response.error = outcome.error;
        response
    }

    fn read_write(
        &mut self,
        request: ReadWriteTreeRequest,
    ) -> Result<ReadWriteTreeResponse, DispatchError> {
        let info = request.exactly_once;
        // client_id 0 carries no session and is applied without deduplication.
        if info.client_id != 0 {
            if let Some(cached) = self.sessions.lookup(&info)? {
                tracing::debug!(
                    client_id = info.client_id,
                    rpc_number = info.rpc_number,
                    "duplicate request answered from session cache"
                );
                return Ok(cached);
            }
        }
        self.last_applied += 1;
        let result = self.apply(&request);
        let outcome = Outcome::from(&result);
        let response = ReadWriteTreeResponse {
            status: outcome.status,
            error: outcome.error,
        };
        if info.client_id != 0 {
            self.sessions.record(&info, response.clone());
        }
        Ok(response)
    }

    fn apply(&mut self, request: &ReadWriteTreeRequest) -> Result<(), ClientError> {
        self.tree.check_condition(&request.condition)?;
        match &request.op {
            ReadWriteOp::MakeDirectory { path } => self.tree.make_directory(path),
            ReadWriteOp::RemoveDirectory { path } => self.tree.remove_directory(path),
            ReadWriteOp::Write { path, contents } => self.tree.write(path, contents),
            ReadWriteOp::RemoveFile { path } => self.tree.remove_file(path),
        }
    }

    fn set_configuration(&mut self, request: SetConfigurationRequest) -> SetConfigurationResponse {
        if request.old_id != self.configuration.id {
            return SetConfigurationResponse::ConfigurationChanged {
                error: format!(
                    "configuration id {} is not current (current is {})",
                    request.old_id, self.configuration.id
                ),
            };
        }
        let mut seen = HashSet::new();
        let bad_servers: Vec<Server> = request
            .new_servers
            .iter()
            .filter(|s| {
                s.address.is_empty()
                    || self.unreachable.contains(&s.server_id)
                    || !seen.insert(s.server_id)
            })
            .cloned()
            .collect();
        if !bad_servers.is_empty() {
            tracing::warn!(count = bad_servers.len(), "configuration change rejected");
            return SetConfigurationResponse::ConfigurationBad { bad_servers };
        }
        self.last_applied += 1;
        self.configuration = Configuration {
            id: self.last_applied,
            servers: request.new_servers,
        };
        tracing::info!(id = self.configuration.id, "configuration changed");
        SetConfigurationResponse::Ok
    }
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::protocol::OpenSessionRequest;
    use arbor_types::{Condition, ExactlyOnceRpcInfo, Status};

    fn open(cluster: &mut MemCluster) -> u64 {
        let reply = cluster
            .dispatch(OpCode::OpenSession, &encode(&OpenSessionRequest {}).unwrap())
            .unwrap();
        decode::<OpenSessionResponse>(&reply).unwrap().client_id
    }

    fn write(
        cluster: &mut MemCluster,
        info: ExactlyOnceRpcInfo,
        condition: Condition,
        path: &str,
        contents: &str,
    ) -> ReadWriteTreeResponse {
        let request = ReadWriteTreeRequest {
            exactly_once: info,
            condition,
            op: ReadWriteOp::Write {
                path: path.into(),
                contents: contents.into(),
            },
        };
        let reply = cluster
            .dispatch(OpCode::ReadWriteTree, &encode(&request).unwrap())
            .unwrap();
        decode(&reply).unwrap()
    }

    fn read(cluster: &mut MemCluster, path: &str) -> ReadOnlyTreeResponse {
        let request = ReadOnlyTreeRequest {
            condition: Condition::default(),
            op: ReadOnlyOp::Read { path: path.into() },
        };
        let reply = cluster
            .dispatch(OpCode::ReadOnlyTree, &encode(&request).unwrap())
            .unwrap();
        decode(&reply).unwrap()
    }

    #[test]
    fn test_retried_write_is_applied_once() {
        let mut cluster = MemCluster::new();
        let id = open(&mut cluster);
        let info = ExactlyOnceRpcInfo {
            client_id: id,
            first_outstanding_rpc: 1,
            rpc_number: 1,
        };
        assert_eq!(write(&mut cluster, info, Condition::default(), "/f", "a").status, Status::Ok);
        let applied = cluster.last_applied();

        // Another client changes the file; a retry of rpc 1 must not overwrite it.
        cluster.tree_mut().write("/f", "b").unwrap();
        assert_eq!(write(&mut cluster, info, Condition::default(), "/f", "a").status, Status::Ok);
        assert_eq!(cluster.last_applied(), applied);
        assert_eq!(read(&mut cluster, "/f").contents, "b");
    }

    #[test]
    fn test_failed_condition_leaves_tree_unchanged() {
        let mut cluster = MemCluster::new();
        let id = open(&mut cluster);
        let info = ExactlyOnceRpcInfo {
            client_id: id,
            first_outstanding_rpc: 1,
            rpc_number: 1,
        };
        let response = write(
            &mut cluster,
            info,
            Condition::new("/keepalive", "no such value"),
            "/keepalive",
            "x",
        );
        assert_eq!(response.status, Status::ConditionNotMet);
        assert_eq!(read(&mut cluster, "/keepalive").status, Status::LookupError);
    }

    #[test]
    fn test_sessionless_write_is_applied_every_time() {
        let mut cluster = MemCluster::new();
        let info = ExactlyOnceRpcInfo::default();
        write(&mut cluster, info, Condition::default(), "/f", "a");
        let applied = cluster.last_applied();
        write(&mut cluster, info, Condition::default(), "/f", "a");
        assert_eq!(cluster.last_applied(), applied + 1);
        assert!(cluster.sessions().is_empty());
    }

    #[test]
    fn test_expired_session_is_invalid_request() {
        let mut cluster = MemCluster::new();
        let request = ReadWriteTreeRequest {
            exactly_once: ExactlyOnceRpcInfo {
                client_id: 42,
                first_outstanding_rpc: 1,
                rpc_number: 1,
            },
            condition: Condition::default(),
            op: ReadWriteOp::MakeDirectory { path: "/d".into() },
        };
        let err = cluster
            .dispatch(OpCode::ReadWriteTree, &encode(&request).unwrap())
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn test_configuration_compare_and_swap() {
        let mut cluster = MemCluster::new();
        let servers = vec![Server::new(1, "127.0.0.1:5254"), Server::new(2, "127.0.0.1:5255")];

        let stale = cluster.set_configuration(SetConfigurationRequest {
            old_id: 0,
            new_servers: servers.clone(),
        });
        assert!(matches!(stale, SetConfigurationResponse::ConfigurationChanged { .. }));

        cluster.mark_unreachable(2);
        let bad = cluster.set_configuration(SetConfigurationRequest {
            old_id: 1,
            new_servers: servers.clone(),
        });
        assert_eq!(
            bad,
            SetConfigurationResponse::ConfigurationBad {
                bad_servers: vec![servers[1].clone()]
            }
        );

        let ok = cluster.set_configuration(SetConfigurationRequest {
            old_id: 1,
            new_servers: vec![servers[0].clone()],
        });
        assert_eq!(ok, SetConfigurationResponse::Ok);
        assert!(cluster.configuration().id > 1);
    }

    #[test]
    fn test_stats_track_sessions() {
        let mut cluster = MemCluster::new();
        open(&mut cluster);
        open(&mut cluster);
        let stats = cluster.stats();
        assert_eq!(stats.open_sessions, 2);
        assert_eq!(stats.last_applied, 3);
        assert!(stats.is_leader);
    }
}
