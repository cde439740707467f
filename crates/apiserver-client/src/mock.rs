//! Mock ApiServerClient for unit testing
//!
//! Responses are scripted per operation and consumed in order. When the
//! watch script runs out, `watch_functions` hands back a stream that stays
//! open and never yields, which is what an idle API server looks like.
//!
//! `fixtures` builds the JSON frames and list bodies tests feed through it.

use crate::apiserver_trait::{ApiServerClientTrait, WatchStream};
use crate::error::ApiServerError;
use crds::CustomResourceDefinition;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor;
use tokio::io::DuplexStream;

/// A scripted answer for one mock call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Success with this body (list body, or the full watch stream content)
    Body(Vec<u8>),
    /// Non-success HTTP status
    Status(u16, String),
    /// HTTP 409 on create
    AlreadyExists,
}

impl MockResponse {
    /// A watch body made of newline-terminated frames.
    pub fn frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut body = String::new();
        for frame in frames {
            body.push_str(frame.as_ref());
            body.push('\n');
        }
        Self::Body(body.into_bytes())
    }

    fn into_result(self, what: &str) -> Result<Vec<u8>, ApiServerError> {
        match self {
            Self::Body(body) => Ok(body),
            Self::Status(status, body) => Err(ApiServerError::Api { status, body }),
            Self::AlreadyExists => Err(ApiServerError::AlreadyExists(what.to_string())),
        }
    }
}

/// Mock ApiServerClient for testing
#[derive(Debug, Default)]
pub struct MockApiServerClient {
    register_responses: Mutex<VecDeque<MockResponse>>,
    list_responses: Mutex<VecDeque<MockResponse>>,
    watch_responses: Mutex<VecDeque<MockResponse>>,
    register_calls: Mutex<usize>,
    list_calls: Mutex<Vec<String>>,
    watch_calls: Mutex<Vec<String>>,
    // Write halves of idle watch streams; held so the read halves never see EOF
    idle_streams: Mutex<Vec<DuplexStream>>,
}

impl MockApiServerClient {
    /// Create a new mock client with nothing scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for `register_resource_type` (default when empty: success)
    pub fn push_register(&self, response: MockResponse) {
        self.register_responses.lock().push_back(response);
    }

    /// Queue an answer for `list_functions` (default when empty: HTTP 500)
    pub fn push_list(&self, response: MockResponse) {
        self.list_responses.lock().push_back(response);
    }

    /// Queue an answer for `watch_functions` (default when empty: idle stream)
    pub fn push_watch(&self, response: MockResponse) {
        self.watch_responses.lock().push_back(response);
    }

    /// Number of registration attempts so far
    pub fn register_calls(&self) -> usize {
        *self.register_calls.lock()
    }

    /// Namespaces passed to `list_functions`, in call order
    pub fn list_calls(&self) -> Vec<String> {
        self.list_calls.lock().clone()
    }

    /// Resource versions passed to `watch_functions`, in call order
    pub fn watch_calls(&self) -> Vec<String> {
        self.watch_calls.lock().clone()
    }

    fn idle_stream(&self) -> WatchStream {
        let (reader, writer) = tokio::io::duplex(64);
        self.idle_streams.lock().push(writer);
        Box::pin(reader)
    }
}

#[async_trait::async_trait]
impl ApiServerClientTrait for MockApiServerClient {
    fn base_url(&self) -> &str {
        "http://mock-apiserver"
    }

    async fn register_resource_type(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<(), ApiServerError> {
        *self.register_calls.lock() += 1;
        let name = crd.metadata.name.clone().unwrap_or_default();
        match self.register_responses.lock().pop_front() {
            Some(response) => response.into_result(&name).map(|_| ()),
            None => Ok(()),
        }
    }

    async fn list_functions(&self, namespace: &str) -> Result<Vec<u8>, ApiServerError> {
        self.list_calls.lock().push(namespace.to_string());
        let response = self
            .list_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockResponse::Status(500, "no scripted list response".to_string()));
        response.into_result("list functions")
    }

    async fn watch_functions(
        &self,
        _namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream, ApiServerError> {
        self.watch_calls.lock().push(resource_version.to_string());
        let next = self.watch_responses.lock().pop_front();
        match next {
            Some(response) => {
                let body = response.into_result("watch functions")?;
                Ok(Box::pin(Cursor::new(body)))
            }
            None => Ok(self.idle_stream()),
        }
    }
}

/// JSON builders for watch frames and list bodies.
pub mod fixtures {
    use serde_json::{Value, json};

    /// A `Function` object as the API server serializes it.
    pub fn function_object(name: &str, resource_version: &str) -> Value {
        json!({
            "apiVersion": "kubeless.io/v1",
            "kind": "Function",
            "metadata": {
                "name": name,
                "namespace": "default",
                "resourceVersion": resource_version,
            },
            "spec": {
                "handler": format!("{name}.handler"),
                "function": "def handler(context):\n    return context\n",
                "runtime": "python2.7",
                "type": "HTTP",
            }
        })
    }

    /// One watch frame: `{"type": <event_type>, "object": <function>}`.
    pub fn event_frame(event_type: &str, name: &str, resource_version: &str) -> String {
        json!({ "type": event_type, "object": function_object(name, resource_version) }).to_string()
    }

    /// One `ERROR` watch frame carrying a status object.
    pub fn status_frame(code: u16, message: &str) -> String {
        json!({
            "type": "ERROR",
            "object": {
                "apiVersion": "v1",
                "kind": "Status",
                "status": "Failure",
                "code": code,
                "message": message,
            }
        })
        .to_string()
    }

    /// A list body with `(name, resource_version)` items and a list cursor.
    pub fn list_body(items: &[(&str, &str)], resource_version: &str) -> Vec<u8> {
        let items: Vec<Value> = items
            .iter()
            .map(|(name, version)| function_object(name, version))
            .collect();
        json!({
            "apiVersion": "kubeless.io/v1",
            "kind": "FunctionList",
            "metadata": { "resourceVersion": resource_version },
            "items": items,
        })
        .to_string()
        .into_bytes()
    }
}
