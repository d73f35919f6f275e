use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arbor_proto::v1::client_service_client::ClientServiceClient;
use arbor_proto::v1::CallRequest;
use arbor_proto::LEADER_ADDR_METADATA;
use arbor_types::protocol::OpCode;
use arbor_types::ClientError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use super::{CallOutcome, LeaderCall, LeaderRpc};
use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::deadline::Deadline;

type Client = ClientServiceClient<Channel>;

/// Connection to the server believed to be leader. `epoch` identifies the
/// connection so reports about a replaced one can be ignored.
#[derive(Clone)]
struct LeaderSession {
    epoch: u64,
    address: String,
    client: Client,
}

struct LeaderState {
    hosts: Vec<String>,
    next_host: usize,
    leader_hint: Option<String>,
    leader: Option<LeaderSession>,
    epoch: u64,
    failures_since_last_success: u64,
}

impl LeaderState {
    fn is_current(&self, session: &LeaderSession) -> bool {
        self.leader.as_ref().map(|s| s.epoch) == Some(session.epoch)
    }

    /// The hinted leader if any, else the next configured host.
    fn next_address(&mut self) -> String {
        if let Some(hint) = self.leader_hint.take() {
            return hint;
        }
        let address = self.hosts[self.next_host % self.hosts.len()].clone();
        self.next_host = (self.next_host + 1) % self.hosts.len();
        address
    }

    fn count_failure(&mut self) -> u64 {
        self.failures_since_last_success += 1;
        self.failures_since_last_success
    }
}

enum Attempt {
    Done(CallOutcome),
    Retry,
}

fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn call_request(op: OpCode, payload: &[u8], deadline: Deadline) -> tonic::Request<CallRequest> {
    let mut request = tonic::Request::new(CallRequest {
        op_code: op.as_u32(),
        payload: payload.to_vec(),
    });
    if let Some(remaining) = deadline.remaining() {
        request.set_timeout(remaining);
    }
    request
}

/// Definitive rejections; retrying them elsewhere cannot succeed.
fn is_invalid_request(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        Code::InvalidArgument | Code::FailedPrecondition | Code::Unimplemented
    )
}

/// Failures are logged at info on powers of two and at debug otherwise.
fn log_failure(failures: u64, address: &str, what: &str) {
    if failures.is_power_of_two() {
        tracing::info!(%address, failures, "{what}");
    } else {
        tracing::debug!(%address, failures, "{what}");
    }
}

struct LeaderShared {
    state: Mutex<LeaderState>,
    connecting: tokio::sync::Mutex<()>,
    backoff: Backoff,
    connect_timeout: Duration,
}

impl LeaderShared {
    fn lock(&self) -> MutexGuard<'_, LeaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect(&self, address: &str, deadline: Deadline) -> Option<Result<Client, String>> {
        let endpoint = match Endpoint::from_shared(endpoint_uri(address)) {
            Ok(endpoint) => endpoint.connect_timeout(self.connect_timeout),
            Err(e) => return Some(Err(e.to_string())),
        };
        deadline
            .run(endpoint.connect())
            .await
            .map(|r| r.map(ClientServiceClient::new).map_err(|e| e.to_string()))
    }

    /// Returns the cached leader session, connecting to a new host if none.
    async fn session(&self, deadline: Deadline) -> Result<LeaderSession, Attempt> {
        if let Some(session) = self.lock().leader.clone() {
            return Ok(session);
        }
        let Some(_connecting) = deadline.run(self.connecting.lock()).await else {
            return Err(Attempt::Done(CallOutcome::Timeout));
        };
        if let Some(session) = self.lock().leader.clone() {
            return Ok(session);
        }

        self.backoff.delay_and_begin(deadline).await;
        if deadline.has_elapsed() {
            return Err(Attempt::Done(CallOutcome::Timeout));
        }

        let address = self.lock().next_address();
        tracing::debug!(%address, "connecting to cluster");
        match self.connect(&address, deadline).await {
            None => Err(Attempt::Done(CallOutcome::Timeout)),
            Some(Err(error)) => {
                let failures = self.lock().count_failure();
                log_failure(
                    failures,
                    &address,
                    &format!("connecting to server failed ({error}), will try another host"),
                );
                Err(Attempt::Retry)
            }
            Some(Ok(client)) => {
                let mut state = self.lock();
                state.epoch += 1;
                let session = LeaderSession {
                    epoch: state.epoch,
                    address,
                    client,
                };
                state.leader = Some(session.clone());
                Ok(session)
            }
        }
    }

    fn report_failure(&self, session: &LeaderSession, reason: &str) {
        let mut state = self.lock();
        if !state.is_current(session) {
            return;
        }
        state.leader = None;
        let failures = state.count_failure();
        drop(state);
        log_failure(
            failures,
            &session.address,
            &format!("RPC to server failed ({reason}), will try another host"),
        );
    }

    fn report_not_leader(&self, session: &LeaderSession) {
        let mut state = self.lock();
        if !state.is_current(session) {
            return;
        }
        state.leader = None;
        let failures = state.count_failure();
        drop(state);
        log_failure(failures, &session.address, "server is not leader, will try another host");
    }

    fn report_redirect(&self, session: &LeaderSession, hint: String) {
        let mut state = self.lock();
        if !state.is_current(session) {
            return;
        }
        state.leader = None;
        let failures = state.count_failure();
        let what = format!("server is not leader, will try suggested {hint} next");
        state.leader_hint = Some(hint);
        drop(state);
        log_failure(failures, &session.address, &what);
    }

    fn report_success(&self, session: &LeaderSession) {
        let mut state = self.lock();
        if !state.is_current(session) || state.failures_since_last_success == 0 {
            return;
        }
        tracing::info!(
            address = %session.address,
            failures = state.failures_since_last_success,
            "connected to leader after failures"
        );
        state.failures_since_last_success = 0;
    }

    async fn attempt(&self, op: OpCode, payload: &[u8], deadline: Deadline) -> Attempt {
        let session = match self.session(deadline).await {
            Ok(session) => session,
            Err(attempt) => return attempt,
        };
        let mut client = session.client.clone();
        let status = match deadline.run(client.call(call_request(op, payload, deadline))).await {
            None => return Attempt::Done(CallOutcome::Timeout),
            Some(Ok(response)) => {
                self.report_success(&session);
                return Attempt::Done(CallOutcome::Ok(response.into_inner().payload));
            }
            Some(Err(status)) => status,
        };

        if is_invalid_request(&status) {
            return Attempt::Done(CallOutcome::InvalidRequest(status.message().to_string()));
        }
        let hint = status
            .metadata()
            .get(LEADER_ADDR_METADATA)
            .map(|v| v.to_str().unwrap_or_default().to_string());
        match hint {
            Some(hint) if !hint.is_empty() => self.report_redirect(&session, hint),
            Some(_) => self.report_not_leader(&session),
            None => self.report_failure(&session, status.message()),
        }
        if deadline.has_elapsed() {
            Attempt::Done(CallOutcome::Timeout)
        } else {
            Attempt::Retry
        }
    }

    async fn run(&self, op: OpCode, payload: Vec<u8>, deadline: Deadline) -> CallOutcome {
        loop {
            if deadline.has_elapsed() {
                return CallOutcome::Timeout;
            }
            if let Attempt::Done(outcome) = self.attempt(op, &payload, deadline).await {
                return outcome;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GrpcLeaderRpc
// ---------------------------------------------------------------------------

/// `LeaderRpc` over the gRPC `ClientService`.
///
/// Keeps one connection to the presumed leader. On failure it follows the
/// leader hint a server returns, or cycles through the configured hosts;
/// new connections are rate-limited by a [`Backoff`].
#[derive(Clone)]
pub struct GrpcLeaderRpc {
    shared: Arc<LeaderShared>,
}

impl GrpcLeaderRpc {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        if config.hosts.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no cluster hosts configured".to_string(),
            ));
        }
        // Start at a random host so clients spread their first connections.
        let next_host = rand::random::<u64>() as usize % config.hosts.len();
        Ok(GrpcLeaderRpc {
            shared: Arc::new(LeaderShared {
                state: Mutex::new(LeaderState {
                    hosts: config.hosts.clone(),
                    next_host,
                    leader_hint: None,
                    leader: None,
                    epoch: 0,
                    failures_since_last_success: 0,
                }),
                connecting: tokio::sync::Mutex::new(()),
                backoff: Backoff::new(
                    config.backoff_max_connections,
                    Duration::from_millis(config.backoff_window_ms),
                ),
                connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            }),
        })
    }

    /// Address of the cached leader connection, if any.
    pub fn leader_address(&self) -> Option<String> {
        self.shared.lock().leader.as_ref().map(|s| s.address.clone())
    }

    pub fn failures_since_last_success(&self) -> u64 {
        self.shared.lock().failures_since_last_success
    }
}

impl LeaderRpc for GrpcLeaderRpc {
    type Call = GrpcCall;

    fn make_call(&self) -> GrpcCall {
        GrpcCall {
            leader: Arc::clone(&self.shared),
            cancel: CancellationToken::new(),
            result: Mutex::new(None),
        }
    }

    async fn call_server(
        &self,
        host: &str,
        op: OpCode,
        request: Vec<u8>,
        deadline: Deadline,
    ) -> CallOutcome {
        let shared = &self.shared;
        loop {
            if deadline.has_elapsed() {
                return CallOutcome::Timeout;
            }
            shared.backoff.delay_and_begin(deadline).await;
            let mut client = match shared.connect(host, deadline).await {
                None => return CallOutcome::Timeout,
                Some(Ok(client)) => client,
                Some(Err(error)) => {
                    tracing::debug!(%host, %error, "connecting to server failed");
                    continue;
                }
            };
            match deadline.run(client.call(call_request(op, &request, deadline))).await {
                None => return CallOutcome::Timeout,
                Some(Ok(response)) => return CallOutcome::Ok(response.into_inner().payload),
                Some(Err(status)) if is_invalid_request(&status) => {
                    return CallOutcome::InvalidRequest(status.message().to_string())
                }
                Some(Err(status)) => {
                    tracing::debug!(%host, code = ?status.code(), "RPC to server failed");
                }
            }
        }
    }
}

/// One call through [`GrpcLeaderRpc`]. `start` runs the retry loop on a
/// spawned task; `cancel` or dropping the call stops it. The outcome is kept
/// once it arrives, so a `wait` that gave up early can be repeated.
pub struct GrpcCall {
    leader: Arc<LeaderShared>,
    cancel: CancellationToken,
    result: Mutex<Option<watch::Receiver<Option<CallOutcome>>>>,
}

impl LeaderCall for GrpcCall {
    fn start(&self, op: OpCode, request: Vec<u8>, deadline: Deadline) {
        let (tx, rx) = watch::channel(None);
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        let leader = Arc::clone(&self.leader);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => CallOutcome::Canceled,
                outcome = leader.run(op, request, deadline) => outcome,
            };
            tx.send_replace(Some(outcome));
        });
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn wait(&self, deadline: Deadline) -> CallOutcome {
        let receiver = self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(mut receiver) = receiver else {
            return CallOutcome::InvalidRequest("call was not started".to_string());
        };
        let finished = async move {
            match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone().unwrap_or(CallOutcome::Canceled),
                // The task went away without reporting.
                Err(_) => CallOutcome::Canceled,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => CallOutcome::Canceled,
            result = deadline.run(finished) => result.unwrap_or(CallOutcome::Timeout),
        }
    }
}

impl Drop for GrpcCall {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
