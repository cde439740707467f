//! Worker lifecycle seam.
//!
//! What a running function actually does (building images, deploying pods,
//! subscribing to topics) lives behind [`WorkerRuntime`]. The dispatcher only
//! decides when to start and stop.

use crate::error::ControllerError;
use crate::state::WorkerHandle;
use crds::FunctionSpec;
use tracing::info;

/// Starts and stops the work associated with one function.
///
/// Both operations are fallible and the dispatcher treats failures as
/// non-fatal. Long running work must be spawned through
/// [`WorkerHandle::spawn`] and exit once [`WorkerHandle::stop_token`] is
/// cancelled, so shutdown can wait for it.
#[async_trait::async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start the worker for `name`.
    async fn start_worker(
        &self,
        name: &str,
        namespace: &str,
        spec: &FunctionSpec,
        handle: &WorkerHandle,
    ) -> Result<(), ControllerError>;

    /// Tear down state associated with `name`. `handle` is the stopped
    /// worker's handle, if one was registered.
    async fn stop_worker(
        &self,
        name: &str,
        namespace: &str,
        handle: Option<&WorkerHandle>,
    ) -> Result<(), ControllerError>;
}

/// Runtime that runs one idle tracked task per function and logs transitions.
///
/// A function without a runtime or handler cannot be started.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRuntime;

#[async_trait::async_trait]
impl WorkerRuntime for LoggingRuntime {
    async fn start_worker(
        &self,
        name: &str,
        namespace: &str,
        spec: &FunctionSpec,
        handle: &WorkerHandle,
    ) -> Result<(), ControllerError> {
        let missing = [("runtime", &spec.runtime), ("handler", &spec.handler)]
            .into_iter()
            .find(|(_, value)| value.trim().is_empty());
        if let Some((field, _)) = missing {
            return Err(ControllerError::WorkerOp {
                name: name.to_string(),
                message: format!("function spec has no {field}"),
            });
        }

        info!(
            "Starting function {}/{} (runtime: {}, handler: {}, trigger: {})",
            namespace, name, spec.runtime, spec.handler, spec.trigger_type
        );

        let stop = handle.stop_token();
        let worker = format!("{namespace}/{name}");
        handle.spawn(async move {
            stop.cancelled().await;
            info!("Function {} stopped", worker);
        });
        Ok(())
    }

    async fn stop_worker(
        &self,
        name: &str,
        namespace: &str,
        _handle: Option<&WorkerHandle>,
    ) -> Result<(), ControllerError> {
        info!("Deleted function {}/{}", namespace, name);
        Ok(())
    }
}
