use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arbor_tree::{DispatchError, MemCluster};
use arbor_types::protocol::OpCode;
use tokio_util::sync::CancellationToken;

use super::{CallOutcome, LeaderCall, LeaderRpc};
use crate::deadline::Deadline;

struct MockShared {
    cluster: Arc<Mutex<MemCluster>>,
    requests: Mutex<Vec<OpCode>>,
    hang: AtomicBool,
}

impl MockShared {
    fn cluster(&self) -> MutexGuard<'_, MemCluster> {
        self.cluster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, op: OpCode, request: &[u8]) -> CallOutcome {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
        match self.cluster().dispatch(op, request) {
            Ok(reply) => CallOutcome::Ok(reply),
            Err(DispatchError::InvalidRequest(msg)) => CallOutcome::InvalidRequest(msg),
            Err(err @ DispatchError::Codec(_)) => CallOutcome::InvalidRequest(err.to_string()),
        }
    }
}

/// In-process `LeaderRpc` that applies requests directly to a shared
/// [`MemCluster`]. Clones share the cluster and the request log.
#[derive(Clone)]
pub struct MockLeaderRpc {
    shared: Arc<MockShared>,
}

impl MockLeaderRpc {
    pub fn new() -> Self {
        Self::with_cluster(Arc::new(Mutex::new(MemCluster::new())))
    }

    pub fn with_cluster(cluster: Arc<Mutex<MemCluster>>) -> Self {
        MockLeaderRpc {
            shared: Arc::new(MockShared {
                cluster,
                requests: Mutex::new(Vec::new()),
                hang: AtomicBool::new(false),
            }),
        }
    }

    pub fn cluster(&self) -> Arc<Mutex<MemCluster>> {
        Arc::clone(&self.shared.cluster)
    }

    /// Op codes of every request that reached the cluster, oldest first.
    pub fn requests(&self) -> Vec<OpCode> {
        self.shared
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// While set, calls never reach the cluster and end only by deadline or
    /// cancellation.
    pub fn set_hang(&self, hang: bool) {
        self.shared.hang.store(hang, Ordering::SeqCst);
    }
}

impl Default for MockLeaderRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderRpc for MockLeaderRpc {
    type Call = MockCall;

    fn make_call(&self) -> MockCall {
        MockCall {
            shared: Arc::clone(&self.shared),
            request: Mutex::new(None),
            outcome: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn call_server(
        &self,
        _host: &str,
        op: OpCode,
        request: Vec<u8>,
        deadline: Deadline,
    ) -> CallOutcome {
        if deadline.has_elapsed() {
            return CallOutcome::Timeout;
        }
        if self.shared.hang.load(Ordering::SeqCst) {
            deadline.sleep().await;
            return CallOutcome::Timeout;
        }
        self.shared.execute(op, &request)
    }
}

/// The request stays pending until a `wait` executes it; the outcome is
/// then kept for any later `wait`.
pub struct MockCall {
    shared: Arc<MockShared>,
    request: Mutex<Option<(OpCode, Vec<u8>, Deadline)>>,
    outcome: Mutex<Option<CallOutcome>>,
    cancel: CancellationToken,
}

impl MockCall {
    fn finished(&self) -> Option<CallOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LeaderCall for MockCall {
    fn start(&self, op: OpCode, request: Vec<u8>, deadline: Deadline) {
        *self.request.lock().unwrap_or_else(PoisonError::into_inner) = Some((op, request, deadline));
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn wait(&self, deadline: Deadline) -> CallOutcome {
        if let Some(outcome) = self.finished() {
            return outcome;
        }
        let start_deadline = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, _, start_deadline)| *start_deadline);
        let Some(start_deadline) = start_deadline else {
            return CallOutcome::InvalidRequest("call was not started".to_string());
        };
        if self.cancel.is_cancelled() {
            return CallOutcome::Canceled;
        }
        if start_deadline.has_elapsed() || deadline.has_elapsed() {
            return CallOutcome::Timeout;
        }
        if self.shared.hang.load(Ordering::SeqCst) {
            return tokio::select! {
                _ = self.cancel.cancelled() => CallOutcome::Canceled,
                _ = deadline.sleep() => CallOutcome::Timeout,
                _ = start_deadline.sleep() => CallOutcome::Timeout,
            };
        }

        let mut request = self.request.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((op, payload, _)) = request.take() else {
            // Executed by a concurrent wait while holding this lock.
            return self.finished().unwrap_or(CallOutcome::Canceled);
        };
        let outcome = self.shared.execute(op, &payload);
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arbor_types::protocol::{decode, encode, GetConfigurationRequest, GetConfigurationResponse};

    use super::*;

    #[tokio::test]
    async fn test_call_reaches_cluster() {
        let rpc = MockLeaderRpc::new();
        let outcome = rpc
            .call(
                OpCode::GetConfiguration,
                encode(&GetConfigurationRequest {}).unwrap(),
                Deadline::Never,
            )
            .await;
        let CallOutcome::Ok(bytes) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        let response: GetConfigurationResponse = decode(&bytes).unwrap();
        assert_eq!(response.configuration.id, 1);
        assert_eq!(rpc.requests(), vec![OpCode::GetConfiguration]);
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_without_sending() {
        let rpc = MockLeaderRpc::new();
        let outcome = rpc
            .call(OpCode::OpenSession, Vec::new(), Deadline::expired())
            .await;
        assert_eq!(outcome, CallOutcome::Timeout);
        assert!(rpc.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_or_cancels() {
        let rpc = MockLeaderRpc::new();
        rpc.set_hang(true);
        let outcome = rpc
            .call(
                OpCode::GetConfiguration,
                Vec::new(),
                Deadline::after(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(outcome, CallOutcome::Timeout);

        let call = Arc::new(rpc.make_call());
        call.start(OpCode::GetConfiguration, Vec::new(), Deadline::Never);
        let waiter = {
            let call = Arc::clone(&call);
            tokio::spawn(async move { call.wait(Deadline::Never).await })
        };
        tokio::task::yield_now().await;
        call.cancel();
        assert_eq!(waiter.await.unwrap(), CallOutcome::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_can_be_repeated_after_timeout() {
        let rpc = MockLeaderRpc::new();
        rpc.set_hang(true);
        let call = rpc.make_call();
        call.start(
            OpCode::GetConfiguration,
            encode(&GetConfigurationRequest {}).unwrap(),
            Deadline::Never,
        );
        let first = call.wait(Deadline::after(Duration::from_millis(10))).await;
        assert_eq!(first, CallOutcome::Timeout);

        rpc.set_hang(false);
        let CallOutcome::Ok(bytes) = call.wait(Deadline::Never).await else {
            panic!("call did not complete");
        };
        let response: GetConfigurationResponse = decode(&bytes).unwrap();
        assert_eq!(response.configuration.id, 1);

        // Later waits see the same outcome without sending again.
        assert_eq!(call.wait(Deadline::expired()).await, CallOutcome::Ok(bytes));
        assert_eq!(rpc.requests(), vec![OpCode::GetConfiguration]);
    }
}
