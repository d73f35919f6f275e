mod grpc;
mod mock;

pub use grpc::{GrpcCall, GrpcLeaderRpc};
pub use mock::{MockCall, MockLeaderRpc};

use std::future::Future;

use arbor_types::protocol::OpCode;

use crate::deadline::Deadline;

/// Terminal result of a call to the cluster leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Encoded response payload.
    Ok(Vec<u8>),
    /// The deadline passed; the request may or may not have taken effect.
    Timeout,
    /// `cancel` was called before a result arrived.
    Canceled,
    /// The cluster refused the request, e.g. because its session expired.
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// LeaderRpc / LeaderCall traits
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75)
// rather than async-trait; every future is `+ Send` so callers can spawn.
// ---------------------------------------------------------------------------

/// A single cancellable call. `start` is invoked once, then `wait`.
pub trait LeaderCall: Send + Sync + 'static {
    fn start(&self, op: OpCode, request: Vec<u8>, deadline: Deadline);

    /// Idempotent. Unblocks a pending `wait` with `CallOutcome::Canceled`.
    fn cancel(&self);

    fn wait(&self, deadline: Deadline) -> impl Future<Output = CallOutcome> + Send;
}

/// Delivers requests to whichever server currently leads the cluster,
/// retrying across servers until success or the deadline.
pub trait LeaderRpc: Send + Sync + 'static {
    type Call: LeaderCall;

    fn make_call(&self) -> Self::Call;

    fn call(
        &self,
        op: OpCode,
        request: Vec<u8>,
        deadline: Deadline,
    ) -> impl Future<Output = CallOutcome> + Send {
        let call = self.make_call();
        async move {
            call.start(op, request, deadline);
            call.wait(deadline).await
        }
    }

    /// Sends `request` to the server at `host` regardless of leadership,
    /// retrying until it answers or the deadline passes.
    fn call_server(
        &self,
        host: &str,
        op: OpCode,
        request: Vec<u8>,
        deadline: Deadline,
    ) -> impl Future<Output = CallOutcome> + Send;
}
