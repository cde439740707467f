//! Test utilities for unit testing the controller
//!
//! Function builders, a worker runtime that records what it was asked to do,
//! and a polling helper for assertions on background tasks.

use crate::error::ControllerError;
use crate::state::WorkerHandle;
use crate::worker::WorkerRuntime;
use crds::{Function, FunctionSpec};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Helper to create a test Function at a resource version
pub fn function(name: &str, resource_version: &str) -> Function {
    let mut function = Function::new(
        name,
        FunctionSpec {
            handler: format!("{name}.handler"),
            runtime: "python2.7".to_string(),
            trigger_type: "HTTP".to_string(),
            ..Default::default()
        },
    );
    function.metadata.namespace = Some("default".to_string());
    function.metadata.resource_version = Some(resource_version.to_string());
    function
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 2s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Worker runtime that records calls and runs one tracked task per worker.
///
/// Starts optionally take `start_delay`. Each task waits for its stop
/// token, then optionally sleeps for `stop_delay` before counting itself as
/// completed.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    starts: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
    handles: Mutex<HashMap<String, WorkerHandle>>,
    failing_starts: Mutex<HashSet<String>>,
    failing_stops: Mutex<HashSet<String>>,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
    completed: Arc<AtomicUsize>,
}

impl RecordingRuntime {
    /// Runtime whose workers exit as soon as they are stopped
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime whose workers take `delay` to exit after being stopped
    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Runtime whose `start_worker` takes `delay` to return
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make `start_worker` fail for `name`
    pub fn fail_start(&self, name: &str) {
        self.failing_starts.lock().insert(name.to_string());
    }

    /// Make `stop_worker` fail for `name`
    pub fn fail_stop(&self, name: &str) {
        self.failing_stops.lock().insert(name.to_string());
    }

    /// Names passed to `start_worker`, in call order
    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().clone()
    }

    /// Names passed to `stop_worker`, in call order
    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().clone()
    }

    /// Last handle a worker was successfully started with
    pub fn handle(&self, name: &str) -> Option<WorkerHandle> {
        self.handles.lock().get(name).cloned()
    }

    /// Number of worker tasks that have exited
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl WorkerRuntime for RecordingRuntime {
    async fn start_worker(
        &self,
        name: &str,
        _namespace: &str,
        _spec: &FunctionSpec,
        handle: &WorkerHandle,
    ) -> Result<(), ControllerError> {
        self.starts.lock().push(name.to_string());
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_starts.lock().contains(name) {
            return Err(ControllerError::WorkerOp {
                name: name.to_string(),
                message: "scripted start failure".to_string(),
            });
        }

        self.handles.lock().insert(name.to_string(), handle.clone());
        let stop = handle.stop_token();
        let delay = self.stop_delay;
        let completed = Arc::clone(&self.completed);
        handle.spawn(async move {
            stop.cancelled().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            completed.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn stop_worker(
        &self,
        name: &str,
        _namespace: &str,
        _handle: Option<&WorkerHandle>,
    ) -> Result<(), ControllerError> {
        self.stops.lock().push(name.to_string());
        if self.failing_stops.lock().contains(name) {
            return Err(ControllerError::WorkerOp {
                name: name.to_string(),
                message: "scripted stop failure".to_string(),
            });
        }
        Ok(())
    }
}
