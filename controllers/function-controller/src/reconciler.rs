//! Reconciliation of function events into worker lifecycles.
//!
//! The reconciler owns every mutation of [`ControllerState`] while the
//! controller is running. Registry changes happen before `dispatch`
//! returns, so the next event always sees what is currently running; the
//! workers themselves run on tracked tasks and never block dispatch.

use crate::decoder::WatchEvent;
use crate::state::{ControllerState, WorkerHandle};
use crate::worker::WorkerRuntime;
use crds::{Function, FunctionSpec};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Worker changes made by a resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    /// Workers stopped because their function was no longer listed
    pub stopped: usize,
    /// Workers started for listed functions that had none
    pub started: usize,
}

/// Dispatches watch events to the worker runtime.
pub struct Reconciler {
    state: Arc<ControllerState>,
    runtime: Arc<dyn WorkerRuntime>,
    namespace: String,
    tracker: TaskTracker,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("namespace", &self.namespace)
            .field("workers", &self.state.worker_count())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler whose workers are tracked by `tracker`.
    pub fn new(
        state: Arc<ControllerState>,
        runtime: Arc<dyn WorkerRuntime>,
        namespace: impl Into<String>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            state,
            runtime,
            namespace: namespace.into(),
            tracker,
        }
    }

    /// Apply one event. Worker failures are logged, never returned.
    pub async fn dispatch(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(function) => self.on_added(function).await,
            WatchEvent::Modified(function) => self.on_modified(function),
            WatchEvent::Deleted(function) => self.on_deleted(&function).await,
        }
    }

    async fn on_added(&self, function: Function) {
        let name = function.name_any();
        let spec = function.spec.clone();
        self.state.insert_function(&name, function);

        if self.state.has_worker(&name) {
            debug!("Function {} is already running; recorded new spec only", name);
            return;
        }
        self.ensure_worker(&name, &spec).await;
    }

    fn on_modified(&self, function: Function) {
        let name = function.name_any();
        debug!(
            "Function {} modified at {}",
            name,
            function.resource_version().unwrap_or_default()
        );
        self.state.insert_function(&name, function);
    }

    async fn on_deleted(&self, function: &Function) {
        let name = function.name_any();
        let record = self.state.remove_function(&name);
        let handle = self.state.take_worker(&name);

        if record.is_none() && handle.is_none() {
            warn!("Ignoring deletion of unknown function {} (stale or duplicate event)", name);
            return;
        }
        self.stop(&name, handle).await;
    }

    /// Bring workers in line with a fresh listing: stop workers (and drop
    /// records) for names that were not listed, then start workers for
    /// listed names that have none.
    pub async fn resync(&self, listed: &BTreeSet<String>) -> ResyncSummary {
        let mut stale: BTreeSet<String> = self
            .state
            .retain_functions(|name| listed.contains(name))
            .into_iter()
            .collect();
        stale.extend(
            self.state
                .worker_names()
                .into_iter()
                .filter(|name| !listed.contains(name)),
        );

        let mut summary = ResyncSummary::default();
        for name in &stale {
            let handle = self.state.take_worker(name);
            if handle.is_some() {
                summary.stopped += 1;
            }
            self.stop(name, handle).await;
        }

        for name in listed {
            if self.state.has_worker(name) {
                continue;
            }
            let Some(function) = self.state.function(name) else {
                continue;
            };
            if self.ensure_worker(name, &function.spec).await {
                summary.started += 1;
            }
        }

        if summary != ResyncSummary::default() {
            info!(
                "Resync: stopped {} and started {} worker(s)",
                summary.stopped, summary.started
            );
        }
        summary
    }

    /// Register a handle for `name` and start its worker. The registration
    /// is rolled back if the runtime fails to start it.
    async fn ensure_worker(&self, name: &str, spec: &FunctionSpec) -> bool {
        let handle = WorkerHandle::new(&self.tracker);
        if !self.state.register_worker(name, handle.clone()) {
            return false;
        }

        match self
            .runtime
            .start_worker(name, &self.namespace, spec, &handle)
            .await
        {
            Ok(()) => {
                info!("Started worker for function {}/{}", self.namespace, name);
                true
            }
            Err(e) => {
                warn!("Failed to start worker for function {}/{}: {}", self.namespace, name, e);
                handle.stop();
                self.state.take_worker(name);
                false
            }
        }
    }

    async fn stop(&self, name: &str, handle: Option<WorkerHandle>) {
        if let Some(handle) = &handle {
            handle.stop();
        }
        match self
            .runtime
            .stop_worker(name, &self.namespace, handle.as_ref())
            .await
        {
            Ok(()) => info!("Stopped function {}/{}", self.namespace, name),
            Err(e) => warn!("Failed to clean up function {}/{}: {}", self.namespace, name, e),
        }
    }
}
