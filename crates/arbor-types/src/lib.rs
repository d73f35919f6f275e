pub mod protocol;

use std::fmt;

/// Text carried by every client-side timeout.
pub const TIMEOUT_MESSAGE: &str = "Client-specified timeout elapsed";

/// Result category of a tree operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Status {
    Ok,
    InvalidArgument,
    LookupError,
    TypeError,
    ConditionNotMet,
    Timeout,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::LookupError => "LOOKUP_ERROR",
            Status::TypeError => "TYPE_ERROR",
            Status::ConditionNotMet => "CONDITION_NOT_MET",
            Status::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Failed tree operation. The message is the user-visible error text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Lookup(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    ConditionNotMet(String),
    #[error("{0}")]
    Timeout(String),
}

impl ClientError {
    pub fn timeout() -> Self {
        ClientError::Timeout(TIMEOUT_MESSAGE.to_string())
    }

    pub fn status(&self) -> Status {
        match self {
            ClientError::InvalidArgument(_) => Status::InvalidArgument,
            ClientError::Lookup(_) => Status::LookupError,
            ClientError::Type(_) => Status::TypeError,
            ClientError::ConditionNotMet(_) => Status::ConditionNotMet,
            ClientError::Timeout(_) => Status::Timeout,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ClientError::InvalidArgument(m)
            | ClientError::Lookup(m)
            | ClientError::Type(m)
            | ClientError::ConditionNotMet(m)
            | ClientError::Timeout(m) => m,
        }
    }

    /// Builds the error for a non-OK status; `None` for `Status::Ok`.
    pub fn from_status(status: Status, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match status {
            Status::Ok => None,
            Status::InvalidArgument => Some(ClientError::InvalidArgument(message)),
            Status::LookupError => Some(ClientError::Lookup(message)),
            Status::TypeError => Some(ClientError::Type(message)),
            Status::ConditionNotMet => Some(ClientError::ConditionNotMet(message)),
            Status::Timeout => Some(ClientError::Timeout(message)),
        }
    }
}

/// Status plus error text, the shape tree results take on the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    pub status: Status,
    pub error: String,
}

impl Outcome {
    pub fn ok() -> Self {
        Outcome {
            status: Status::Ok,
            error: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn into_result(self) -> Result<(), ClientError> {
        match ClientError::from_status(self.status, self.error) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl From<ClientError> for Outcome {
    fn from(err: ClientError) -> Self {
        Outcome {
            status: err.status(),
            error: err.message().to_string(),
        }
    }
}

impl<T> From<&Result<T, ClientError>> for Outcome {
    fn from(result: &Result<T, ClientError>) -> Self {
        match result {
            Ok(_) => Outcome::ok(),
            Err(err) => err.clone().into(),
        }
    }
}

/// Predicate attached to tree operations: the file at `path` must hold
/// `expected_value`. An empty path means no condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Condition {
    pub path: String,
    pub expected_value: String,
}

impl Condition {
    pub fn new(path: impl Into<String>, expected_value: impl Into<String>) -> Self {
        Condition {
            path: path.into(),
            expected_value: expected_value.into(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.path.is_empty()
    }
}

/// Exactly-once bookkeeping attached to every read-write request.
/// A `client_id` of 0 means no session could be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExactlyOnceRpcInfo {
    pub client_id: u64,
    pub first_outstanding_rpc: u64,
    pub rpc_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Server {
    pub server_id: u64,
    pub address: String,
}

impl Server {
    pub fn new(server_id: u64, address: impl Into<String>) -> Self {
        Server {
            server_id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    pub id: u64,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigurationStatus {
    Ok,
    Changed,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationResult {
    pub status: ConfigurationStatus,
    /// Servers that could not be reached; only set when `status` is `Bad`.
    pub bad_servers: Vec<Server>,
}

impl ConfigurationResult {
    pub fn ok() -> Self {
        ConfigurationResult {
            status: ConfigurationStatus::Ok,
            bad_servers: Vec::new(),
        }
    }

    pub fn changed() -> Self {
        ConfigurationResult {
            status: ConfigurationStatus::Changed,
            bad_servers: Vec::new(),
        }
    }

    pub fn bad(bad_servers: Vec<Server>) -> Self {
        ConfigurationResult {
            status: ConfigurationStatus::Bad,
            bad_servers,
        }
    }
}

/// Point-in-time statistics reported by a single server.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerStats {
    pub server_id: u64,
    pub address: String,
    pub is_leader: bool,
    pub last_applied: u64,
    pub open_sessions: u64,
    pub configuration_id: u64,
    pub captured_at_ns: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_round_trips_error_category() {
        let err = ClientError::Lookup("Path '/a' does not exist".into());
        let outcome = Outcome::from(err.clone());
        assert_eq!(outcome.status, Status::LookupError);
        assert_eq!(outcome.into_result(), Err(err));
        assert!(Outcome::ok().into_result().is_ok());
    }

    #[test]
    fn test_timeout_error_uses_fixed_text() {
        let err = ClientError::timeout();
        assert_eq!(err.status(), Status::Timeout);
        assert_eq!(err.to_string(), "Client-specified timeout elapsed");
    }

    #[test]
    fn test_from_status_ok_is_none() {
        assert!(ClientError::from_status(Status::Ok, "ignored").is_none());
        assert_eq!(
            ClientError::from_status(Status::TypeError, "x"),
            Some(ClientError::Type("x".into()))
        );
    }

    #[test]
    fn test_empty_condition_is_unset() {
        assert!(!Condition::default().is_set());
        assert!(Condition::new("/a", "").is_set());
    }
}
