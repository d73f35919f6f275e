use std::sync::Arc;
use std::time::Duration;

use arbor_types::protocol::{
    decode, encode, GetConfigurationRequest, GetConfigurationResponse, GetServerStatsRequest,
    GetServerStatsResponse, OpCode, ReadOnlyOp, ReadOnlyTreeRequest, ReadOnlyTreeResponse,
    ReadWriteOp, ReadWriteTreeRequest, ReadWriteTreeResponse, SetConfigurationRequest,
    SetConfigurationResponse,
};
use arbor_types::{
    ClientError, Condition, Configuration, ConfigurationResult, Server, ServerStats,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::deadline::Deadline;
use crate::leader_rpc::{CallOutcome, LeaderRpc};
use crate::path::canonicalize;
use crate::session::ExactlyOnceSession;

fn codec_error(error: impl std::fmt::Display) -> ClientError {
    ClientError::InvalidArgument(error.to_string())
}

fn outcome_to_reply(outcome: CallOutcome) -> Result<Vec<u8>, ClientError> {
    match outcome {
        CallOutcome::Ok(reply) => Ok(reply),
        CallOutcome::Timeout => Err(ClientError::timeout()),
        CallOutcome::Canceled => Err(ClientError::Timeout("Call canceled".to_string())),
        CallOutcome::InvalidRequest(error) => Err(ClientError::InvalidArgument(error)),
    }
}

fn tree_result(status: arbor_types::Status, error: String) -> Result<(), ClientError> {
    match ClientError::from_status(status, error) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Tree and membership operations against the cluster. Paths are resolved
/// against the caller's working directory before anything is sent.
pub struct ClientImpl<R: LeaderRpc> {
    leader: Arc<R>,
    session: ExactlyOnceSession<R>,
}

impl<R: LeaderRpc> ClientImpl<R> {
    pub fn new(leader: R, keep_alive_interval: Duration) -> Self {
        let leader = Arc::new(leader);
        ClientImpl {
            session: ExactlyOnceSession::new(Arc::clone(&leader), keep_alive_interval),
            leader,
        }
    }

    pub fn leader(&self) -> &R {
        &self.leader
    }

    pub fn session(&self) -> &ExactlyOnceSession<R> {
        &self.session
    }

    async fn exchange<Req, Resp>(
        &self,
        op: OpCode,
        request: &Req,
        deadline: Deadline,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(request).map_err(codec_error)?;
        let reply = outcome_to_reply(self.leader.call(op, payload, deadline).await)?;
        decode(&reply).map_err(codec_error)
    }

    async fn read_only(
        &self,
        op: ReadOnlyOp,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<ReadOnlyTreeResponse, ClientError> {
        let request = ReadOnlyTreeRequest {
            condition: condition.clone(),
            op,
        };
        let response: ReadOnlyTreeResponse =
            self.exchange(OpCode::ReadOnlyTree, &request, deadline).await?;
        tree_result(response.status, response.error.clone())?;
        Ok(response)
    }

    async fn read_write(
        &self,
        op: ReadWriteOp,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<(), ClientError> {
        // A client_id of 0 means no session could be opened in time; the
        // request is still sent, without deduplication.
        let exactly_once = self.session.rpc_info(deadline).await;
        let request = ReadWriteTreeRequest {
            exactly_once,
            condition: condition.clone(),
            op,
        };
        let result = self
            .exchange::<_, ReadWriteTreeResponse>(OpCode::ReadWriteTree, &request, deadline)
            .await
            .and_then(|response| tree_result(response.status, response.error));
        self.session.done_with_rpc(&exactly_once);
        result
    }

    pub async fn make_directory(
        &self,
        path: &str,
        working_directory: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<(), ClientError> {
        let path = canonicalize(path, working_directory)?;
        self.read_write(ReadWriteOp::MakeDirectory { path }, condition, deadline)
            .await
    }

    pub async fn list_directory(
        &self,
        path: &str,
        working_directory: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<Vec<String>, ClientError> {
        let path = canonicalize(path, working_directory)?;
        let response = self
            .read_only(ReadOnlyOp::ListDirectory { path }, condition, deadline)
            .await?;
        Ok(response.children)
    }

    pub async fn remove_directory(
        &self,
        path: &str,
        working_directory: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<(), ClientError> {
        let path = canonicalize(path, working_directory)?;
        self.read_write(ReadWriteOp::RemoveDirectory { path }, condition, deadline)
            .await
    }

    pub async fn write(
        &self,
        path: &str,
        working_directory: &str,
        contents: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<(), ClientError> {
        let path = canonicalize(path, working_directory)?;
        let op = ReadWriteOp::Write {
            path,
            contents: contents.to_string(),
        };
        self.read_write(op, condition, deadline).await
    }

    pub async fn read(
        &self,
        path: &str,
        working_directory: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<String, ClientError> {
        let path = canonicalize(path, working_directory)?;
        let response = self
            .read_only(ReadOnlyOp::Read { path }, condition, deadline)
            .await?;
        Ok(response.contents)
    }

    pub async fn remove_file(
        &self,
        path: &str,
        working_directory: &str,
        condition: &Condition,
        deadline: Deadline,
    ) -> Result<(), ClientError> {
        let path = canonicalize(path, working_directory)?;
        self.read_write(ReadWriteOp::RemoveFile { path }, condition, deadline)
            .await
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub async fn get_configuration(&self, deadline: Deadline) -> Result<Configuration, ClientError> {
        let response: GetConfigurationResponse = self
            .exchange(OpCode::GetConfiguration, &GetConfigurationRequest {}, deadline)
            .await?;
        Ok(response.configuration)
    }

    /// Replaces the membership if `old_id` is still current. When the
    /// cluster cannot be reached in time every proposed server is reported bad.
    pub async fn set_configuration(
        &self,
        old_id: u64,
        new_servers: Vec<Server>,
        deadline: Deadline,
    ) -> ConfigurationResult {
        let request = SetConfigurationRequest {
            old_id,
            new_servers,
        };
        let response = self
            .exchange::<_, SetConfigurationResponse>(OpCode::SetConfiguration, &request, deadline)
            .await;
        match response {
            Ok(SetConfigurationResponse::Ok) => ConfigurationResult::ok(),
            Ok(SetConfigurationResponse::ConfigurationChanged { error }) => {
                tracing::debug!(old_id, %error, "configuration changed concurrently");
                ConfigurationResult::changed()
            }
            Ok(SetConfigurationResponse::ConfigurationBad { bad_servers }) => {
                ConfigurationResult::bad(bad_servers)
            }
            Err(error) => {
                tracing::warn!(old_id, %error, "configuration change did not complete");
                ConfigurationResult::bad(request.new_servers)
            }
        }
    }

    /// Statistics from the server at `host`, whether or not it leads.
    pub async fn get_server_stats(
        &self,
        host: &str,
        deadline: Deadline,
    ) -> Result<ServerStats, ClientError> {
        let payload = encode(&GetServerStatsRequest {}).map_err(codec_error)?;
        let outcome = self
            .leader
            .call_server(host, OpCode::GetServerStats, payload, deadline)
            .await;
        let reply = outcome_to_reply(outcome)?;
        let response: GetServerStatsResponse = decode(&reply).map_err(codec_error)?;
        Ok(response.stats)
    }
}
