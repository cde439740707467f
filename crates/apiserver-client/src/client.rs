//! Kubernetes API server client
//!
//! Implements the three calls the function controller makes against the
//! API server:
//! - `POST /apis/apiextensions.k8s.io/v1/customresourcedefinitions`
//! - `GET /apis/kubeless.io/v1/namespaces/{ns}/functions`
//! - `GET /apis/kubeless.io/v1/namespaces/{ns}/functions?watch=true&resourceVersion={rv}`

use crate::apiserver_trait::{ApiServerClientTrait, WatchStream};
use crate::error::ApiServerError;
use crds::{CustomResourceDefinition, Function};
use futures::TryStreamExt;
use kube::Resource;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Longest response body kept in an error message.
const ERROR_BODY_LIMIT: usize = 500;

/// API server client
pub struct ApiServerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ApiServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl ApiServerClient {
    /// Create a new API server client
    ///
    /// # Arguments
    /// * `base_url` - API server URL (e.g., "https://kubernetes.default.svc")
    /// * `token` - Bearer token, if the server requires one
    /// * `ca_pem` - PEM bundle to trust in addition to the webpki roots
    ///
    /// No overall request timeout is set: watch responses stay open until the
    /// server closes them.
    pub fn new(
        base_url: String,
        token: Option<String>,
        ca_pem: Option<Vec<u8>>,
    ) -> Result<Self, ApiServerError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiServerError::InvalidConfig(format!(
                "API server URL must start with http:// or https://: {base_url}"
            )));
        }

        let mut builder = Client::builder().connect_timeout(Duration::from_secs(30));
        if let Some(pem) = ca_pem {
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ApiServerError::InvalidConfig(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build a full URL from an API path
    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the bearer token, if any
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Turn a non-success response into an error, keeping a bounded body.
    async fn reject(response: Response, what: &str) -> ApiServerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error_for_status(status, what, &body)
    }
}

/// Path of the namespaced function collection.
#[must_use]
pub fn functions_path(namespace: &str) -> String {
    Function::url_path(&(), Some(namespace))
}

/// Path of the cluster-scoped CRD collection.
#[must_use]
pub fn crd_path() -> String {
    CustomResourceDefinition::url_path(&(), None)
}

/// Maps a non-success HTTP status to an [`ApiServerError`].
pub(crate) fn error_for_status(status: StatusCode, what: &str, body: &str) -> ApiServerError {
    if status == StatusCode::CONFLICT {
        return ApiServerError::AlreadyExists(what.to_string());
    }
    ApiServerError::Api {
        status: status.as_u16(),
        body: format!(
            "{what}: {}",
            body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
        ),
    }
}

#[async_trait::async_trait]
impl ApiServerClientTrait for ApiServerClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn register_resource_type(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<(), ApiServerError> {
        let url = self.build_url(&crd_path());
        let name = crd.metadata.name.clone().unwrap_or_default();
        debug!("POST {} ({})", url, name);

        let response = self
            .authorized(self.client.post(&url))
            .header("Accept", "application/json")
            .json(crd)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, &format!("register {name}")).await);
        }
        Ok(())
    }

    async fn list_functions(&self, namespace: &str) -> Result<Vec<u8>, ApiServerError> {
        let url = self.build_url(&functions_path(namespace));
        debug!("GET {}", url);

        let response = self
            .authorized(self.client.get(&url))
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, &format!("list functions in {namespace}")).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn watch_functions(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream, ApiServerError> {
        let url = self.build_url(&functions_path(namespace));
        debug!("GET {} (watch from {})", url, resource_version);

        let response = self
            .authorized(self.client.get(&url))
            .query(&[("watch", "true"), ("resourceVersion", resource_version)])
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, &format!("watch functions in {namespace}")).await);
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}
