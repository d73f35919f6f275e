use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arbor_types::protocol::{
    decode, encode, OpCode, OpenSessionRequest, OpenSessionResponse, ReadWriteOp,
    ReadWriteTreeRequest, ReadWriteTreeResponse,
};
use arbor_types::{Condition, ExactlyOnceRpcInfo, Status};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::deadline::Deadline;
use crate::leader_rpc::{CallOutcome, LeaderCall, LeaderRpc};

const KEEP_ALIVE_PATH: &str = "/keepalive";
const KEEP_ALIVE_CONTENTS: &str = "you shouldn't see this!";
const KEEP_ALIVE_EXPECTED: &str =
    "this is just a no-op to keep the client's session active; the condition is expected to fail";

struct SessionState<C> {
    client_id: u64,
    next_rpc_number: u64,
    outstanding: BTreeSet<u64>,
    last_keep_alive_start: Option<Instant>,
    keep_alive_interval: Duration,
    exiting: bool,
    keep_alive_call: Option<Arc<C>>,
    coordinator: Option<JoinHandle<()>>,
}

impl<C> SessionState<C> {
    /// When the next keep-alive is due; `None` while keep-alives are disabled.
    fn next_keep_alive(&self) -> Option<Instant> {
        if self.keep_alive_interval.is_zero() {
            return None;
        }
        match self.last_keep_alive_start {
            Some(last) => last.checked_add(self.keep_alive_interval),
            None => Some(Instant::now()),
        }
    }
}

struct SessionShared<R: LeaderRpc> {
    leader: Arc<R>,
    state: Mutex<SessionState<R::Call>>,
    wake: Notify,
    opening: tokio::sync::Mutex<()>,
}

impl<R: LeaderRpc> SessionShared<R> {
    fn lock(&self) -> MutexGuard<'_, SessionState<R::Call>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session with the cluster unless one already exists.
    /// Returns false if none could be opened before `deadline`.
    async fn open_session(self: &Arc<Self>, deadline: Deadline) -> bool {
        let Some(_opening) = deadline.run(self.opening.lock()).await else {
            return false;
        };
        if self.lock().client_id != 0 {
            return true;
        }
        let request = match encode(&OpenSessionRequest {}) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "encoding session open request failed");
                return false;
            }
        };
        self.lock().last_keep_alive_start = Some(Instant::now());
        let client_id = match self.leader.call(OpCode::OpenSession, request, deadline).await {
            CallOutcome::Ok(reply) => match decode::<OpenSessionResponse>(&reply) {
                Ok(response) if response.client_id > 0 => response.client_id,
                Ok(_) => {
                    tracing::warn!("cluster assigned client id 0");
                    return false;
                }
                Err(error) => {
                    tracing::warn!(%error, "malformed session open reply");
                    return false;
                }
            },
            CallOutcome::Timeout | CallOutcome::Canceled => return false,
            CallOutcome::InvalidRequest(error) => {
                tracing::warn!(%error, "cluster refused to open a session");
                return false;
            }
        };

        let mut state = self.lock();
        state.client_id = client_id;
        tracing::info!(client_id, "opened session");
        if !state.exiting {
            state.coordinator = Some(tokio::spawn(Arc::clone(self).keep_alive_main()));
        }
        true
    }

    /// Assigns the next rpc number. The session must already be open.
    fn allocate(&self) -> ExactlyOnceRpcInfo {
        let mut state = self.lock();
        state.last_keep_alive_start = Some(Instant::now());
        let rpc_number = state.next_rpc_number;
        state.next_rpc_number += 1;
        state.outstanding.insert(rpc_number);
        let info = ExactlyOnceRpcInfo {
            client_id: state.client_id,
            first_outstanding_rpc: state.outstanding.first().copied().unwrap_or(rpc_number),
            rpc_number,
        };
        drop(state);
        self.wake.notify_one();
        info
    }

    fn release(&self, info: &ExactlyOnceRpcInfo) {
        self.lock().outstanding.remove(&info.rpc_number);
    }

    /// Sets `exiting`, cancels any in-flight keep-alive and hands back the
    /// coordinator task.
    fn begin_exit(&self) -> Option<JoinHandle<()>> {
        let mut state = self.lock();
        state.exiting = true;
        if let Some(call) = &state.keep_alive_call {
            call.cancel();
        }
        let coordinator = state.coordinator.take();
        drop(state);
        self.wake.notify_one();
        coordinator
    }

    async fn keep_alive_main(self: Arc<Self>) {
        tracing::debug!("keep-alive coordinator started");
        loop {
            let next = {
                let state = self.lock();
                if state.exiting {
                    break;
                }
                state.next_keep_alive()
            };
            match next {
                Some(at) if Instant::now() >= at => self.send_keep_alive().await,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
        tracing::debug!("keep-alive coordinator exiting");
    }

    /// Issues a write whose condition always fails. The server still treats
    /// it as session activity.
    async fn send_keep_alive(&self) {
        let info = self.allocate();
        let request = ReadWriteTreeRequest {
            exactly_once: info,
            condition: Condition::new(KEEP_ALIVE_PATH, KEEP_ALIVE_EXPECTED),
            op: ReadWriteOp::Write {
                path: KEEP_ALIVE_PATH.to_string(),
                contents: KEEP_ALIVE_CONTENTS.to_string(),
            },
        };
        let payload = match encode(&request) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "encoding keep-alive failed");
                self.release(&info);
                return;
            }
        };

        let call = Arc::new(self.leader.make_call());
        {
            let mut state = self.lock();
            if state.exiting {
                state.outstanding.remove(&info.rpc_number);
                return;
            }
            state.keep_alive_call = Some(Arc::clone(&call));
        }
        call.start(OpCode::ReadWriteTree, payload, Deadline::Never);
        let outcome = call.wait(Deadline::Never).await;
        {
            let mut state = self.lock();
            state.keep_alive_call = None;
            state.outstanding.remove(&info.rpc_number);
        }

        match outcome {
            CallOutcome::Ok(reply) => match decode::<ReadWriteTreeResponse>(&reply) {
                Ok(response) if response.status == Status::ConditionNotMet => {
                    tracing::debug!(rpc_number = info.rpc_number, "keep-alive sent");
                }
                Ok(response) => tracing::warn!(
                    status = %response.status,
                    error = %response.error,
                    "keep-alive write should have failed its condition"
                ),
                Err(error) => tracing::warn!(%error, "malformed keep-alive reply"),
            },
            CallOutcome::Canceled => tracing::debug!("keep-alive canceled"),
            CallOutcome::Timeout => tracing::warn!("unexpected timeout for keep-alive"),
            CallOutcome::InvalidRequest(error) => {
                tracing::warn!(%error, "cluster rejected keep-alive")
            }
        }
    }
}

/// Client side of the exactly-once protocol.
///
/// Every read-write request carries `{client_id, first_outstanding_rpc,
/// rpc_number}` so the cluster can answer a retry from its cache instead of
/// applying it twice. The session is opened on first use; from then on a
/// background coordinator sends keep-alives whenever no request has been
/// issued for a full keep-alive interval.
pub struct ExactlyOnceSession<R: LeaderRpc> {
    shared: Arc<SessionShared<R>>,
}

impl<R: LeaderRpc> ExactlyOnceSession<R> {
    pub fn new(leader: Arc<R>, keep_alive_interval: Duration) -> Self {
        ExactlyOnceSession {
            shared: Arc::new(SessionShared {
                leader,
                state: Mutex::new(SessionState {
                    client_id: 0,
                    next_rpc_number: 1,
                    outstanding: BTreeSet::new(),
                    last_keep_alive_start: None,
                    keep_alive_interval,
                    exiting: false,
                    keep_alive_call: None,
                    coordinator: None,
                }),
                wake: Notify::new(),
                opening: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Stamps a new read-write request, opening the session first if needed.
    /// Returns a `client_id` of 0 if the session could not be opened before
    /// `deadline`; nothing is recorded as outstanding in that case.
    pub async fn rpc_info(&self, deadline: Deadline) -> ExactlyOnceRpcInfo {
        let client_id = self.shared.lock().client_id;
        if client_id == 0 && !self.shared.open_session(deadline).await {
            return ExactlyOnceRpcInfo::default();
        }
        self.shared.allocate()
    }

    /// Marks the request finished so the cluster may drop its cached reply.
    pub fn done_with_rpc(&self, info: &ExactlyOnceRpcInfo) {
        self.shared.release(info);
    }

    /// Zero disables keep-alives. Wakes the coordinator to re-plan.
    pub fn set_keep_alive_interval(&self, interval: Duration) {
        self.shared.lock().keep_alive_interval = interval;
        self.shared.wake.notify_one();
    }

    pub fn client_id(&self) -> u64 {
        self.shared.lock().client_id
    }

    /// Outstanding rpc numbers, ascending.
    pub fn outstanding(&self) -> Vec<u64> {
        self.shared.lock().outstanding.iter().copied().collect()
    }

    /// Stops the keep-alive coordinator and waits for it to finish.
    pub async fn exit(&self) {
        let Some(coordinator) = self.shared.begin_exit() else {
            return;
        };
        if let Err(error) = coordinator.await {
            if !error.is_cancelled() {
                tracing::warn!(%error, "keep-alive coordinator failed");
            }
        }
    }
}

impl<R: LeaderRpc> Drop for ExactlyOnceSession<R> {
    fn drop(&mut self) {
        if let Some(coordinator) = self.shared.begin_exit() {
            coordinator.abort();
        }
    }
}
