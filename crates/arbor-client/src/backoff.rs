use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::deadline::Deadline;

/// Rate limiter for connection attempts: at most `max_operations` may begin
/// within any `window`.
pub struct Backoff {
    max_operations: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl Backoff {
    /// `max_operations == 0` disables limiting.
    pub fn new(max_operations: usize, window: Duration) -> Self {
        Backoff {
            max_operations,
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until another operation may begin and records it. Returns
    /// early without recording if `deadline` passes first.
    pub async fn delay_and_begin(&self, deadline: Deadline) {
        if self.max_operations == 0 {
            return;
        }
        loop {
            let next_slot = {
                let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                while starts.front().is_some_and(|t| *t + self.window <= now) {
                    starts.pop_front();
                }
                if starts.len() < self.max_operations {
                    starts.push_back(now);
                    return;
                }
                starts.front().map_or(now, |oldest| *oldest + self.window)
            };
            match deadline.instant() {
                Some(at) if at <= next_slot => {
                    tokio::time::sleep_until(at).await;
                    return;
                }
                _ => tokio::time::sleep_until(next_slot).await,
            }
        }
    }
}
