//! Kubernetes API Server Client
//!
//! Transport for the `Function` custom resource: registering the resource
//! type, listing functions in a namespace and opening a watch stream from a
//! resource version. Bodies are returned raw; decoding them is the
//! controller's job.
//!
//! # Example
//!
//! ```no_run
//! use apiserver_client::{ApiServerClient, ApiServerClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiServerClient::new(
//!     "https://kubernetes.default.svc".to_string(),
//!     Some("service-account-token".to_string()),
//!     None,
//! )?;
//!
//! client.register_resource_type(&crds::function_crd()).await?;
//! let body = client.list_functions("default").await?;
//! let stream = client.watch_functions("default", "42").await?;
//! # let _ = (body, stream);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod apiserver_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use apiserver_trait::{ApiServerClientTrait, WatchStream};
pub use client::ApiServerClient;
pub use error::ApiServerError;
#[cfg(feature = "test-util")]
pub use mock::{MockApiServerClient, MockResponse};
