use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Absolute point after which a call gives up. `Never` waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    At(Instant),
    Never,
}

impl Deadline {
    /// `Never` when `timeout` would overflow the clock.
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Never, Deadline::At)
    }

    /// Deadline for a relative timeout in nanoseconds; 0 means no timeout.
    pub fn after_nanos(nanos: u64) -> Self {
        if nanos == 0 {
            Deadline::Never
        } else {
            Self::after(Duration::from_nanos(nanos))
        }
    }

    /// A deadline that has already passed.
    pub fn expired() -> Self {
        Deadline::At(Instant::now())
    }

    pub fn has_elapsed(&self) -> bool {
        match self {
            Deadline::At(at) => Instant::now() >= *at,
            Deadline::Never => false,
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(*at),
            Deadline::Never => None,
        }
    }

    /// Time left before the deadline, `None` for `Never`.
    pub fn remaining(&self) -> Option<Duration> {
        self.instant()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub async fn sleep(&self) {
        match self {
            Deadline::At(at) => tokio::time::sleep_until(*at).await,
            Deadline::Never => std::future::pending().await,
        }
    }

    /// Drives `fut` to completion unless the deadline passes first.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self {
            Deadline::At(at) => tokio::time::timeout_at(*at, fut).await.ok(),
            Deadline::Never => Some(fut.await),
        }
    }
}
