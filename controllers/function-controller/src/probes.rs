//! Health, readiness and inventory endpoints.
//!
//! - `GET /healthz`: 200 unless the controller has stopped
//! - `GET /readyz`: 200 only while events are being dispatched
//! - `GET /functions`: JSON copy of the worker registry and the snapshot

use crate::controller::Phase;
use crate::error::ControllerError;
use crate::state::{ControllerState, ResourceVersion};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Read-only view of the controller for the probe routes.
#[derive(Debug, Clone)]
pub struct ProbeState {
    state: Arc<ControllerState>,
    phase: watch::Receiver<Phase>,
    cursor: watch::Receiver<ResourceVersion>,
}

/// Body of `GET /functions`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionsReport {
    /// Current lifecycle phase
    pub phase: Phase,
    /// Cursor of the last dispatched event
    pub resource_version: ResourceVersion,
    /// Names with a registered worker
    pub workers: Vec<String>,
    /// Snapshot records: name -> resource version
    pub functions: BTreeMap<String, String>,
}

impl ProbeState {
    /// View over `state` and the controller's published phase and cursor.
    pub fn new(
        state: Arc<ControllerState>,
        phase: watch::Receiver<Phase>,
        cursor: watch::Receiver<ResourceVersion>,
    ) -> Self {
        Self { state, phase, cursor }
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn report(&self) -> FunctionsReport {
        FunctionsReport {
            phase: self.phase(),
            resource_version: self.cursor.borrow().clone(),
            workers: self.state.worker_names(),
            functions: self
                .state
                .functions()
                .into_iter()
                .map(|(name, function)| (name, function.resource_version().unwrap_or_default()))
                .collect(),
        }
    }
}

async fn healthz(State(probe): State<ProbeState>) -> StatusCode {
    if probe.phase() == Phase::Stopped {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn readyz(State(probe): State<ProbeState>) -> StatusCode {
    if probe.phase() == Phase::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn functions(State(probe): State<ProbeState>) -> Json<FunctionsReport> {
    Json(probe.report())
}

/// Probe routes.
pub fn router(probe: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/functions", get(functions))
        .with_state(probe)
}

/// Serve the probe routes on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    probe: ProbeState,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);

    axum::serve(listener, router(probe))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
