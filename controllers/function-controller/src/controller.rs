//! Main controller implementation.
//!
//! The `Controller` drives the function lifecycle through four phases:
//! - `Bootstrapping`: register the Function resource type, retrying forever
//! - `Running`: list, resync, watch and dispatch; relist when the cursor expires
//! - `ShuttingDown`: stop every worker and wait for all of them to exit
//! - `Stopped`: terminal; the fatal error, if any, is returned from `run`

use crate::backoff::BackoffPolicy;
use crate::error::ControllerError;
use crate::probes::ProbeState;
use crate::reconciler::Reconciler;
use crate::snapshot::SnapshotLoader;
use crate::state::{ControllerState, ResourceVersion};
use crate::watcher::WatchSession;
use crate::worker::WorkerRuntime;
use apiserver_client::ApiServerClientTrait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default capacity of the queue between the watch session and the dispatcher.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Registering the resource type
    Bootstrapping,
    /// Watching and dispatching events
    Running,
    /// Stopping workers
    ShuttingDown,
    /// All workers have exited
    Stopped,
}

/// Tunables for one controller instance.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Namespace whose functions are watched
    pub namespace: String,
    /// Capacity of the event queue
    pub queue_capacity: usize,
    /// Delay policy between registration attempts
    pub bootstrap_backoff: BackoffPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bootstrap_backoff: BackoffPolicy::default(),
        }
    }
}

/// Function controller.
pub struct Controller {
    client: Arc<dyn ApiServerClientTrait>,
    settings: ControllerSettings,
    state: Arc<ControllerState>,
    reconciler: Reconciler,
    snapshot: SnapshotLoader,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
    cursor: watch::Sender<ResourceVersion>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("api", &self.client.base_url())
            .field("settings", &self.settings)
            .field("phase", &*self.phase.borrow())
            .field("cursor", &*self.cursor.borrow())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with empty state.
    pub fn new(
        client: Arc<dyn ApiServerClientTrait>,
        runtime: Arc<dyn WorkerRuntime>,
        settings: ControllerSettings,
    ) -> Self {
        let state = Arc::new(ControllerState::new());
        let tracker = TaskTracker::new();
        let reconciler = Reconciler::new(
            Arc::clone(&state),
            runtime,
            settings.namespace.clone(),
            tracker.clone(),
        );
        let snapshot = SnapshotLoader::new(Arc::clone(&client), settings.namespace.clone());
        let (phase, _) = watch::channel(Phase::Bootstrapping);
        let (cursor, _) = watch::channel(ResourceVersion::default());

        Self {
            client,
            settings,
            state,
            reconciler,
            snapshot,
            tracker,
            shutdown: CancellationToken::new(),
            phase,
            cursor,
        }
    }

    /// Shared controller state.
    #[cfg(test)]
    pub fn state(&self) -> Arc<ControllerState> {
        Arc::clone(&self.state)
    }

    /// Cancelling this token asks the controller to shut down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Read-only view for the probe server.
    #[must_use]
    pub fn probe_state(&self) -> ProbeState {
        ProbeState::new(
            Arc::clone(&self.state),
            self.phase.subscribe(),
            self.cursor.subscribe(),
        )
    }

    /// Current phase.
    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Cursor of the last dispatched event (or of the last listing).
    #[cfg(test)]
    pub fn cursor(&self) -> ResourceVersion {
        self.cursor.borrow().clone()
    }

    /// Register the Function resource type.
    ///
    /// "Already exists" counts as success. Any other failure is retried
    /// according to the bootstrap backoff, forever. Returns `false` only if
    /// shutdown was requested first.
    pub async fn bootstrap(&self) -> bool {
        let crd = crds::function_crd();
        let crd_name = crd.metadata.name.as_deref().unwrap_or_default();
        let mut backoff = self.settings.bootstrap_backoff.clone();

        loop {
            match self.client.register_resource_type(&crd).await {
                Ok(()) => {
                    info!("Registered resource type {}", crd_name);
                    return true;
                }
                Err(e) if e.is_already_exists() => {
                    info!("Resource type {} already registered", crd_name);
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Failed to register Function resource type: {}; retrying in {:?}",
                        e, delay
                    );
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => {
                            info!("Shutdown requested during bootstrap");
                            return false;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run the controller until shutdown is requested or the watch fails.
    ///
    /// Workers are always stopped and awaited before this returns.
    pub async fn run(&self) -> Result<(), ControllerError> {
        info!("Starting Function Controller in namespace {}", self.settings.namespace);
        self.phase.send_replace(Phase::Bootstrapping);

        let result = if self.bootstrap().await {
            self.watch_loop().await
        } else {
            Ok(())
        };

        if let Err(e) = &result {
            error!("Function Controller stopping on error: {}", e);
        }
        self.shutdown().await;
        result
    }

    async fn watch_loop(&self) -> Result<(), ControllerError> {
        loop {
            let load = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(()),
                load = self.snapshot.load(&self.state) => load?,
            };
            self.reconciler.resync(&load.names).await;
            self.cursor.send_replace(load.resource_version.clone());
            self.phase.send_replace(Phase::Running);

            let session = WatchSession::new(
                Arc::clone(&self.client),
                self.settings.namespace.clone(),
                load.resource_version,
            );
            let (mut events, session) =
                session.open(self.settings.queue_capacity, self.shutdown.child_token());

            // Events still queued when shutdown is requested are dropped
            loop {
                let event = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let version = event.resource_version();
                self.reconciler.dispatch(event).await;
                self.cursor.send_replace(version);
            }
            drop(events);

            let end = session
                .await
                .map_err(|e| ControllerError::Watch(format!("watch session panicked: {e}")))?;
            match end.result {
                Ok(()) => {
                    debug!("Watch session ended at {}", end.cursor);
                    return Ok(());
                }
                Err(e) if e.is_cursor_expired() => {
                    warn!("{}; relisting functions", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn shutdown(&self) {
        self.phase.send_replace(Phase::ShuttingDown);
        self.shutdown.cancel();

        let workers = self.state.drain_workers();
        info!("Stopping {} worker(s)", workers.len());
        for (name, handle) in &workers {
            debug!("Signalling stop to worker {}", name);
            handle.stop();
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.phase.send_replace(Phase::Stopped);
        info!("Function Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingRuntime, eventually};
    use apiserver_client::mock::fixtures::{event_frame, list_body, status_frame};
    use apiserver_client::{ApiServerError, MockApiServerClient, MockResponse};
    use std::time::Duration;

    fn controller(
        mock: &Arc<MockApiServerClient>,
        runtime: &Arc<RecordingRuntime>,
    ) -> Arc<Controller> {
        let settings = ControllerSettings {
            bootstrap_backoff: BackoffPolicy::Fixed(Duration::from_millis(10)),
            ..ControllerSettings::default()
        };
        Arc::new(Controller::new(
            Arc::clone(mock) as Arc<dyn ApiServerClientTrait>,
            Arc::clone(runtime) as Arc<dyn WorkerRuntime>,
            settings,
        ))
    }

    fn spawn_run(
        controller: &Arc<Controller>,
    ) -> tokio::task::JoinHandle<Result<(), ControllerError>> {
        let controller = Arc::clone(controller);
        tokio::spawn(async move { controller.run().await })
    }

    #[tokio::test]
    async fn test_snapshot_then_watch_with_reconnect() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[("f1", "5")], "5")));
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f1", "6"),
            event_frame("DELETED", "f1", "7"),
        ]));
        mock.push_watch(MockResponse::frames([event_frame("ADDED", "f2", "9")]));
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        let run = spawn_run(&controller);
        eventually(|| mock.watch_calls().len() == 3 && controller.cursor().as_str() == "9").await;

        let state = controller.state();
        assert_eq!(state.worker_names(), vec!["f2"]);
        assert_eq!(mock.watch_calls(), vec!["5", "7", "9"]);
        assert_eq!(runtime.starts(), vec!["f1", "f2"]);
        assert_eq!(runtime.stops(), vec!["f1"]);
        assert_eq!(controller.phase(), Phase::Running);

        controller.shutdown_token().cancel();
        run.await.unwrap().unwrap();

        assert_eq!(controller.phase(), Phase::Stopped);
        assert_eq!(state.worker_count(), 0);
        assert_eq!(runtime.completed(), 2);
        assert_eq!(mock.list_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_expiry_relists_and_resyncs() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[("f1", "5")], "5")));
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f2", "6"),
            status_frame(410, "too old resource version: 6 (8)"),
        ]));
        // f1 was deleted while the cursor was stale
        mock.push_list(MockResponse::Body(list_body(&[("f2", "6")], "8")));
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        let run = spawn_run(&controller);
        eventually(|| mock.watch_calls().len() == 2).await;

        assert_eq!(mock.list_calls().len(), 2);
        // Never resumes from the expired cursor
        assert_eq!(mock.watch_calls(), vec!["5", "8"]);
        assert_eq!(controller.state().worker_names(), vec!["f2"]);
        assert_eq!(runtime.starts(), vec!["f1", "f2"]);
        assert_eq!(runtime.stops(), vec!["f1"]);
        assert_eq!(controller.cursor().as_str(), "8");

        controller.shutdown_token().cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_status_is_fatal() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[("f1", "5")], "5")));
        mock.push_watch(MockResponse::frames([status_frame(500, "internal error")]));
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, ControllerError::Protocol { code: 500, .. }));
        assert_eq!(mock.list_calls().len(), 1);
        assert_eq!(mock.watch_calls(), vec!["5"]);
        assert_eq!(controller.phase(), Phase::Stopped);
        // The worker started from the snapshot was stopped and awaited
        assert_eq!(runtime.completed(), 1);
        assert_eq!(controller.state().worker_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_watch_request_is_fatal() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[], "5")));
        mock.push_watch(MockResponse::Status(403, "forbidden".to_string()));
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, ControllerError::ApiServer(ApiServerError::Api { status: 403, .. })));
        assert_eq!(mock.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_listing_is_fatal() {
        let mock = Arc::new(MockApiServerClient::new());
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, ControllerError::ApiServer(ApiServerError::Api { status: 500, .. })));
        assert!(mock.watch_calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_worker() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[("a", "2"), ("b", "3")], "3")));
        let runtime = Arc::new(RecordingRuntime::with_stop_delay(Duration::from_millis(50)));
        let controller = controller(&mock, &runtime);

        let run = spawn_run(&controller);
        eventually(|| {
            controller.state().worker_count() == 2 && mock.watch_calls().len() == 1
        })
        .await;
        let tokens: Vec<_> = ["a", "b"]
            .iter()
            .map(|name| runtime.handle(name).unwrap().stop_token())
            .collect();
        assert_eq!(runtime.completed(), 0);

        controller.shutdown_token().cancel();
        run.await.unwrap().unwrap();

        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(runtime.completed(), 2);
        assert_eq!(controller.phase(), Phase::Stopped);
        // Shutdown stops workers; it does not delete functions
        assert!(runtime.stops().is_empty());
    }

    #[tokio::test]
    async fn test_queued_events_are_dropped_on_shutdown() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_list(MockResponse::Body(list_body(&[], "1")));
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "a", "2"),
            event_frame("ADDED", "b", "3"),
            event_frame("ADDED", "c", "4"),
        ]));
        let runtime = Arc::new(RecordingRuntime::with_start_delay(Duration::from_millis(100)));
        let controller = controller(&mock, &runtime);

        let run = spawn_run(&controller);
        eventually(|| !runtime.starts().is_empty()).await;
        controller.shutdown_token().cancel();
        run.await.unwrap().unwrap();

        assert_eq!(runtime.starts(), vec!["a"]);
        assert_eq!(runtime.completed(), 1);
        assert_eq!(controller.cursor().as_str(), "2");
        assert_eq!(controller.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_bootstrap_retries_until_registered() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_register(MockResponse::Status(503, "unavailable".to_string()));
        mock.push_register(MockResponse::Status(503, "unavailable".to_string()));
        mock.push_register(MockResponse::AlreadyExists);
        let runtime = Arc::new(RecordingRuntime::new());
        let controller = controller(&mock, &runtime);

        assert!(controller.bootstrap().await);
        assert_eq!(mock.register_calls(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_bootstrap() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_register(MockResponse::Status(503, "unavailable".to_string()));
        let runtime = Arc::new(RecordingRuntime::new());
        let settings = ControllerSettings {
            bootstrap_backoff: BackoffPolicy::Fixed(Duration::from_secs(60)),
            ..ControllerSettings::default()
        };
        let controller = Arc::new(Controller::new(
            Arc::clone(&mock) as Arc<dyn ApiServerClientTrait>,
            Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
            settings,
        ));

        let run = spawn_run(&controller);
        eventually(|| mock.register_calls() == 1).await;
        controller.shutdown_token().cancel();

        run.await.unwrap().unwrap();
        assert!(mock.list_calls().is_empty());
        assert_eq!(controller.phase(), Phase::Stopped);
    }
}
