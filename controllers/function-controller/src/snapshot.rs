//! Initial listing of existing functions.

use crate::error::ControllerError;
use crate::state::{ControllerState, ResourceVersion};
use apiserver_client::ApiServerClientTrait;
use crds::FunctionList;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one snapshot load.
#[derive(Debug, Clone)]
pub struct SnapshotLoad {
    /// List-level cursor to start watching from
    pub resource_version: ResourceVersion,
    /// Names present in the listing
    pub names: BTreeSet<String>,
}

/// Lists functions and writes them into the snapshot map.
#[derive(Clone)]
pub struct SnapshotLoader {
    client: Arc<dyn ApiServerClientTrait>,
    namespace: String,
}

impl std::fmt::Debug for SnapshotLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotLoader")
            .field("api", &self.client.base_url())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl SnapshotLoader {
    /// Loader for functions in `namespace`.
    pub fn new(client: Arc<dyn ApiServerClientTrait>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// List every function, overwrite same-name records in `state`, and
    /// return the list cursor.
    pub async fn load(&self, state: &ControllerState) -> Result<SnapshotLoad, ControllerError> {
        let body = self.client.list_functions(&self.namespace).await?;
        let raw = String::from_utf8_lossy(&body);

        let list: FunctionList = serde_json::from_slice(&body).map_err(|e| {
            ControllerError::decode(format!("failed to decode function list: {e}"), &raw)
        })?;

        let resource_version = match list.metadata.resource_version.as_deref() {
            Some(version) if !version.is_empty() => ResourceVersion::new(version),
            _ => {
                return Err(ControllerError::decode(
                    "function list has no metadata.resourceVersion",
                    &raw,
                ));
            }
        };

        let mut names = BTreeSet::new();
        for function in list.items {
            let name = function.name_any();
            if name.is_empty() {
                warn!("Skipping listed function without a name in namespace {}", self.namespace);
                continue;
            }
            debug!("Snapshot: {} at {}", name, function.resource_version().unwrap_or_default());
            state.insert_function(&name, function);
            names.insert(name);
        }

        info!(
            "Loaded {} function(s) from namespace {} at resource version {}",
            names.len(),
            self.namespace,
            resource_version
        );
        Ok(SnapshotLoad { resource_version, names })
    }
}
