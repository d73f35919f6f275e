//! Request and response payloads exchanged between clients and the cluster.
//!
//! Payloads are bincode-encoded and carried as opaque bytes inside the gRPC
//! `Call` envelope, tagged with an [`OpCode`].

use serde::{Deserialize, Serialize};

use crate::{Condition, Configuration, ExactlyOnceRpcInfo, Server, ServerStats, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum OpCode {
    OpenSession = 1,
    ReadOnlyTree = 2,
    ReadWriteTree = 3,
    GetServerStats = 4,
    GetConfiguration = 5,
    SetConfiguration = 6,
}

impl OpCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for OpCode {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            1 => Ok(OpCode::OpenSession),
            2 => Ok(OpCode::ReadOnlyTree),
            3 => Ok(OpCode::ReadWriteTree),
            4 => Ok(OpCode::GetServerStats),
            5 => Ok(OpCode::GetConfiguration),
            6 => Ok(OpCode::SetConfiguration),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenSessionRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub client_id: u64,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOnlyOp {
    ListDirectory { path: String },
    Read { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOnlyTreeRequest {
    pub condition: Condition,
    pub op: ReadOnlyOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyTreeResponse {
    pub status: Status,
    pub error: String,
    /// Set for `ListDirectory`.
    pub children: Vec<String>,
    /// Set for `Read`.
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadWriteOp {
    MakeDirectory { path: String },
    RemoveDirectory { path: String },
    Write { path: String, contents: String },
    RemoveFile { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadWriteTreeRequest {
    pub exactly_once: ExactlyOnceRpcInfo,
    pub condition: Condition,
    pub op: ReadWriteOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWriteTreeResponse {
    pub status: Status,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Cluster administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetServerStatsRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetServerStatsResponse {
    pub stats: ServerStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetConfigurationRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigurationResponse {
    pub configuration: Configuration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfigurationRequest {
    pub old_id: u64,
    pub new_servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetConfigurationResponse {
    Ok,
    ConfigurationChanged { error: String },
    ConfigurationBad { bad_servers: Vec<Server> },
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
#[error("payload codec error: {0}")]
pub struct CodecError(String);

pub fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| CodecError(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| CodecError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes_survive_raw_conversion() {
        for op in [
            OpCode::OpenSession,
            OpCode::ReadOnlyTree,
            OpCode::ReadWriteTree,
            OpCode::GetServerStats,
            OpCode::GetConfiguration,
            OpCode::SetConfiguration,
        ] {
            assert_eq!(OpCode::try_from(op.as_u32()), Ok(op));
        }
        assert_eq!(OpCode::try_from(0), Err(0));
        assert_eq!(OpCode::try_from(99), Err(99));
    }

    #[test]
    fn test_read_write_request_keeps_exactly_once_info() {
        let req = ReadWriteTreeRequest {
            exactly_once: ExactlyOnceRpcInfo {
                client_id: 3,
                first_outstanding_rpc: 1,
                rpc_number: 2,
            },
            condition: Condition::new("/lock", "held"),
            op: ReadWriteOp::Write {
                path: "/a/b".into(),
                contents: "hello".into(),
            },
        };
        let decoded: ReadWriteTreeRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(decoded.exactly_once, req.exactly_once);
        assert_eq!(decoded.condition, req.condition);
        assert_eq!(decoded.op, req.op);
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let err = decode::<SetConfigurationResponse>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.to_string().starts_with("payload codec error"));
    }
}
