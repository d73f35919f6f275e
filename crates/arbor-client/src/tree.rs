use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use arbor_types::{ClientError, Condition};

use crate::client_impl::ClientImpl;
use crate::deadline::Deadline;
use crate::leader_rpc::LeaderRpc;
use crate::path::canonicalize;

/// Immutable per-handle settings. Replaced wholesale on every change.
struct TreeDetails<R: LeaderRpc> {
    client: Arc<ClientImpl<R>>,
    working_directory: String,
    condition: Condition,
    timeout_nanos: u64,
}

impl<R: LeaderRpc> Clone for TreeDetails<R> {
    fn clone(&self) -> Self {
        TreeDetails {
            client: Arc::clone(&self.client),
            working_directory: self.working_directory.clone(),
            condition: self.condition.clone(),
            timeout_nanos: self.timeout_nanos,
        }
    }
}

impl<R: LeaderRpc> TreeDetails<R> {
    fn deadline(&self) -> Deadline {
        Deadline::after_nanos(self.timeout_nanos)
    }
}

/// Handle onto the cluster's directory tree with its own working directory,
/// condition and timeout.
///
/// Operations read the current settings lock-free; setters swap in a new
/// snapshot, so an operation already running keeps the settings it started
/// with. Clones start from the same snapshot and diverge independently.
pub struct Tree<R: LeaderRpc> {
    writer: Arc<Mutex<()>>,
    details: ArcSwap<TreeDetails<R>>,
}

impl<R: LeaderRpc> Clone for Tree<R> {
    fn clone(&self) -> Self {
        Tree {
            writer: Arc::clone(&self.writer),
            details: ArcSwap::new(self.details.load_full()),
        }
    }
}

impl<R: LeaderRpc> Tree<R> {
    pub(crate) fn new(client: Arc<ClientImpl<R>>) -> Self {
        Tree {
            writer: Arc::new(Mutex::new(())),
            details: ArcSwap::from_pointee(TreeDetails {
                client,
                working_directory: "/".to_string(),
                condition: Condition::default(),
                timeout_nanos: 0,
            }),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Arc<TreeDetails<R>> {
        self.details.load_full()
    }

    /// Applies `change` to a copy of the current settings and installs it.
    fn update<T>(&self, change: impl FnOnce(&mut TreeDetails<R>) -> T) -> (Arc<TreeDetails<R>>, T) {
        let _writer = self.lock_writer();
        let mut next = TreeDetails::clone(&self.details.load());
        let out = change(&mut next);
        let next = Arc::new(next);
        self.details.store(Arc::clone(&next));
        (next, out)
    }

    /// Makes this handle's settings equal to `other`'s.
    pub fn assign_from(&self, other: &Tree<R>) {
        let snapshot = other.details.load_full();
        let _writer = self.lock_writer();
        self.details.store(snapshot);
    }

    /// Changes the working directory and creates it on the cluster.
    ///
    /// An unresolvable path still replaces the working directory, with a
    /// marker value that makes later relative paths fail.
    pub async fn set_working_directory(&self, new_working_directory: &str) -> Result<(), ClientError> {
        let (installed, resolved) = self.update(|details| {
            let result = canonicalize(new_working_directory, &details.working_directory);
            details.working_directory = match &result {
                Ok(real_path) => real_path.clone(),
                Err(_) => format!(
                    "invalid from prior call to setWorkingDirectory('{}') relative to '{}'",
                    new_working_directory, details.working_directory
                ),
            };
            result
        });
        let real_path = resolved?;
        installed
            .client
            .make_directory(&real_path, "/", &installed.condition, installed.deadline())
            .await
    }

    pub fn working_directory(&self) -> String {
        self.details.load().working_directory.clone()
    }

    /// Sets the condition attached to later operations. An empty `path`
    /// clears it. A path that cannot be resolved installs a condition that
    /// can never hold.
    pub fn set_condition(&self, path: &str, value: &str) -> Result<(), ClientError> {
        let (_, outcome) = self.update(|details| {
            if path.is_empty() {
                details.condition = Condition::default();
                return Ok(());
            }
            match canonicalize(path, &details.working_directory) {
                Ok(real_path) => {
                    details.condition = Condition::new(real_path, value);
                    Ok(())
                }
                Err(err) => {
                    details.condition = Condition::new(
                        format!(
                            "invalid from prior call to setCondition('{}') relative to '{}'",
                            path, details.working_directory
                        ),
                        value,
                    );
                    Err(err)
                }
            }
        });
        outcome
    }

    pub fn condition(&self) -> Condition {
        self.details.load().condition.clone()
    }

    /// Per-operation timeout in nanoseconds; 0 means no timeout.
    pub fn set_timeout(&self, nanos: u64) {
        self.update(|details| details.timeout_nanos = nanos);
    }

    pub fn timeout(&self) -> u64 {
        self.details.load().timeout_nanos
    }

    pub async fn make_directory(&self, path: &str) -> Result<(), ClientError> {
        let d = self.snapshot();
        d.client
            .make_directory(path, &d.working_directory, &d.condition, d.deadline())
            .await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>, ClientError> {
        let d = self.snapshot();
        d.client
            .list_directory(path, &d.working_directory, &d.condition, d.deadline())
            .await
    }

    pub async fn remove_directory(&self, path: &str) -> Result<(), ClientError> {
        let d = self.snapshot();
        d.client
            .remove_directory(path, &d.working_directory, &d.condition, d.deadline())
            .await
    }

    pub async fn write(&self, path: &str, contents: &str) -> Result<(), ClientError> {
        let d = self.snapshot();
        d.client
            .write(path, &d.working_directory, contents, &d.condition, d.deadline())
            .await
    }

    pub async fn read(&self, path: &str) -> Result<String, ClientError> {
        let d = self.snapshot();
        d.client
            .read(path, &d.working_directory, &d.condition, d.deadline())
            .await
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), ClientError> {
        let d = self.snapshot();
        d.client
            .remove_file(path, &d.working_directory, &d.condition, d.deadline())
            .await
    }
}
