//! Shared controller state.
//!
//! `ControllerState` holds the worker registry and the function snapshot.
//! Only the reconciler and the controller lifecycle mutate it; probes and
//! other readers get copies, never references into the live maps.

use crds::Function;
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Position in the event history of the Function resource type.
///
/// Opaque to the controller, but ordered: values are compared by length
/// and then lexically, which is numeric order for the decimal versions the
/// API server hands out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Wraps a resource version string.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The raw version string, as sent back to the API server.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ResourceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ResourceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stop signal and completion tracking for one running function.
///
/// The token is cancelled when the function is deleted or the controller
/// shuts down; tasks spawned through [`WorkerHandle::spawn`] are awaited on
/// shutdown.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerHandle {
    /// New handle whose tasks are tracked by `tracker`.
    pub fn new(tracker: &TaskTracker) -> Self {
        Self {
            stop: CancellationToken::new(),
            tracker: tracker.clone(),
        }
    }

    /// Token the worker observes to know it must exit.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signal the worker to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Spawn a worker task that shutdown will wait for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }
}

/// Worker registry (name -> handle) and function snapshot (name -> object).
#[derive(Debug, Default)]
pub struct ControllerState {
    workers: RwLock<HashMap<String, WorkerHandle>>,
    functions: RwLock<HashMap<String, Function>>,
}

impl ControllerState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a function under `name`, replacing any previous record.
    pub fn insert_function(&self, name: &str, function: Function) {
        self.functions.write().insert(name.to_string(), function);
    }

    /// Remove and return the record for `name`.
    pub fn remove_function(&self, name: &str) -> Option<Function> {
        self.functions.write().remove(name)
    }

    /// Drop every record whose name fails `keep`; returns the dropped names.
    pub fn retain_functions(&self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.functions.write().retain(|name, _| {
            let kept = keep(name);
            if !kept {
                dropped.push(name.clone());
            }
            kept
        });
        dropped.sort();
        dropped
    }

    /// Copy of the record for `name`.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Function> {
        self.functions.read().get(name).cloned()
    }

    /// Copy of the whole snapshot, ordered by name.
    #[must_use]
    pub fn functions(&self) -> BTreeMap<String, Function> {
        self.functions
            .read()
            .iter()
            .map(|(name, function)| (name.clone(), function.clone()))
            .collect()
    }

    /// Register a worker for `name`. Returns `false` (and keeps the existing
    /// handle) if one is already registered.
    pub fn register_worker(&self, name: &str, handle: WorkerHandle) -> bool {
        let mut workers = self.workers.write();
        if workers.contains_key(name) {
            return false;
        }
        workers.insert(name.to_string(), handle);
        true
    }

    /// Whether a worker is registered for `name`.
    #[must_use]
    pub fn has_worker(&self, name: &str) -> bool {
        self.workers.read().contains_key(name)
    }

    /// Remove and return the handle for `name`.
    pub fn take_worker(&self, name: &str) -> Option<WorkerHandle> {
        self.workers.write().remove(name)
    }

    /// Names with a registered worker, sorted.
    #[must_use]
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Empty the registry, returning every handle that was in it.
    pub fn drain_workers(&self) -> Vec<(String, WorkerHandle)> {
        let mut drained: Vec<(String, WorkerHandle)> = self.workers.write().drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}
