use std::collections::{BTreeMap, HashMap};

use arbor_types::protocol::ReadWriteTreeResponse;
use arbor_types::ExactlyOnceRpcInfo;

use crate::DispatchError;

struct Session {
    first_outstanding: u64,
    responses: BTreeMap<u64, ReadWriteTreeResponse>, // rpc_number → cached response
}

/// Client sessions and their cached read-write responses.
///
/// A retried request (same client id and rpc number) is answered from the
/// cache instead of being applied twice. Entries below the client's
/// `first_outstanding_rpc` are discarded as the client acknowledges them.
#[derive(Default)]
pub struct SessionTable {
    next_client_id: u64,
    sessions: HashMap<u64, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session and returns its id. Ids start at 1.
    pub fn open(&mut self) -> u64 {
        self.next_client_id += 1;
        let client_id = self.next_client_id;
        self.sessions.insert(
            client_id,
            Session {
                first_outstanding: 0,
                responses: BTreeMap::new(),
            },
        );
        client_id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the cached response if `info` was already applied.
    pub fn lookup(
        &mut self,
        info: &ExactlyOnceRpcInfo,
    ) -> Result<Option<ReadWriteTreeResponse>, DispatchError> {
        let session = self.sessions.get_mut(&info.client_id).ok_or_else(|| {
            DispatchError::InvalidRequest(format!(
                "session {} expired or was never opened",
                info.client_id
            ))
        })?;
        if info.first_outstanding_rpc > session.first_outstanding {
            session.first_outstanding = info.first_outstanding_rpc;
            session.responses = session.responses.split_off(&info.first_outstanding_rpc);
        }
        if info.rpc_number < session.first_outstanding {
            return Err(DispatchError::InvalidRequest(format!(
                "rpc {} of session {} was already acknowledged",
                info.rpc_number, info.client_id
            )));
        }
        Ok(session.responses.get(&info.rpc_number).cloned())
    }

    pub fn record(&mut self, info: &ExactlyOnceRpcInfo, response: ReadWriteTreeResponse) {
        if let Some(session) = self.sessions.get_mut(&info.client_id) {
            session.responses.insert(info.rpc_number, response);
        }
    }

    /// Number of responses still cached for `client_id`.
    pub fn cached(&self, client_id: u64) -> usize {
        self.sessions.get(&client_id).map_or(0, |s| s.responses.len())
    }
}
