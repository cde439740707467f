//! ApiServerClient trait for mocking
//!
//! The controller only depends on this trait, so tests can script list bodies
//! and watch streams without a cluster.

use crate::error::ApiServerError;
use crds::CustomResourceDefinition;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Raw body of a watch response: newline-delimited JSON event envelopes.
pub type WatchStream = Pin<Box<dyn AsyncRead + Send>>;

/// Trait for the API server operations the controller needs
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ApiServerClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Create the resource type. Returns [`ApiServerError::AlreadyExists`]
    /// when it is already registered.
    async fn register_resource_type(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<(), ApiServerError>;

    /// List all functions in `namespace`, returning the undecoded list body.
    async fn list_functions(&self, namespace: &str) -> Result<Vec<u8>, ApiServerError>;

    /// Open a watch on functions in `namespace` starting after `resource_version`.
    ///
    /// Fails if the request cannot be sent or the server answers with a
    /// non-success status.
    async fn watch_functions(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream, ApiServerError>;
}
