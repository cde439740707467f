//! Function watch session.
//!
//! One session is a single logical subscription to the function event
//! stream. It reconnects at its cursor whenever the API server closes the
//! stream cleanly and hands every decoded event to the dispatcher through a
//! bounded queue. Everything else (transport failures, bad frames, non-410
//! statuses, an expired cursor) ends the session; recovery is the
//! controller's job.

use crate::decoder::{Decoded, EventDecoder, WatchEvent};
use crate::error::ControllerError;
use crate::state::ResourceVersion;
use apiserver_client::ApiServerClientTrait;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Terminal outcome of a watch session.
#[derive(Debug)]
pub struct SessionEnd {
    /// Cursor of the last event handed downstream
    pub cursor: ResourceVersion,
    /// `Ok` for shutdown or a dropped receiver; the fatal signal otherwise
    pub result: Result<(), ControllerError>,
}

/// Watches functions in one namespace from a cursor.
pub struct WatchSession {
    client: Arc<dyn ApiServerClientTrait>,
    namespace: String,
    cursor: ResourceVersion,
}

impl std::fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("api", &self.client.base_url())
            .field("namespace", &self.namespace)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl WatchSession {
    /// Session that will start watching at `cursor`.
    pub fn new(
        client: Arc<dyn ApiServerClientTrait>,
        namespace: impl Into<String>,
        cursor: ResourceVersion,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cursor,
        }
    }

    /// Start the session on its own task.
    ///
    /// Events arrive on the receiver in server order. The join handle
    /// resolves once the session has stopped, reporting its last cursor and
    /// the reason it stopped.
    pub fn open(
        self,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<WatchEvent>, JoinHandle<SessionEnd>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    async fn run(
        mut self,
        tx: mpsc::Sender<WatchEvent>,
        shutdown: CancellationToken,
    ) -> SessionEnd {
        info!("Watching functions in {} from resource version {}", self.namespace, self.cursor);

        let result = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!("Watch session stopping on shutdown");
                Ok(())
            }
            result = self.stream(&tx) => result,
        };

        SessionEnd {
            cursor: self.cursor,
            result,
        }
    }

    async fn stream(&mut self, tx: &mpsc::Sender<WatchEvent>) -> Result<(), ControllerError> {
        loop {
            let body = self
                .client
                .watch_functions(&self.namespace, self.cursor.as_str())
                .await?;
            let mut decoder = EventDecoder::new(BufReader::new(body));

            loop {
                match decoder.decode_next().await? {
                    Decoded::Event(event) => {
                        let version = event.resource_version();
                        debug!("{} {} at {}", event.kind(), event.name(), version);
                        if version < self.cursor {
                            debug!(
                                "Event version {} is behind cursor {}; passing it on",
                                version, self.cursor
                            );
                        }
                        if tx.send(event).await.is_err() {
                            debug!("Event receiver dropped; ending watch session");
                            return Ok(());
                        }
                        self.cursor = version;
                    }
                    Decoded::StreamEnded => {
                        debug!("Watch stream closed by server; reconnecting at {}", self.cursor);
                        break;
                    }
                    Decoded::CursorExpired(status) => {
                        debug!(
                            "Cursor {} expired (reason: {})",
                            self.cursor,
                            status.reason.as_deref().unwrap_or("unknown")
                        );
                        return Err(ControllerError::CursorExpired {
                            cursor: self.cursor.clone(),
                            message: status.message,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::eventually;
    use apiserver_client::mock::fixtures::{event_frame, status_frame};
    use apiserver_client::{ApiServerError, MockApiServerClient, MockResponse};

    fn session(mock: &Arc<MockApiServerClient>, cursor: &str) -> WatchSession {
        WatchSession::new(
            Arc::clone(mock) as Arc<dyn ApiServerClientTrait>,
            "default",
            ResourceVersion::new(cursor),
        )
    }

    #[tokio::test]
    async fn test_reconnects_at_last_event_cursor() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f1", "6"),
            event_frame("DELETED", "f1", "7"),
        ]));
        mock.push_watch(MockResponse::frames([event_frame("ADDED", "f2", "9")]));
        let shutdown = CancellationToken::new();

        let (mut rx, handle) = session(&mock, "5").open(8, shutdown.clone());

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            seen.push(format!("{} {}@{}", event.kind(), event.name(), event.resource_version()));
        }
        assert_eq!(seen, vec!["ADDED f1@6", "DELETED f1@7", "ADDED f2@9"]);

        // Third connection is the idle stream opened at the last cursor
        eventually(|| mock.watch_calls().len() == 3).await;
        assert_eq!(mock.watch_calls(), vec!["5", "7", "9"]);

        shutdown.cancel();
        let end = handle.await.unwrap();
        assert!(end.result.is_ok());
        assert_eq!(end.cursor, ResourceVersion::new("9"));
    }

    #[tokio::test]
    async fn test_gone_status_ends_session_with_cursor_expired() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f1", "6"),
            status_frame(410, "too old resource version: 6 (20)"),
        ]));

        let (mut rx, handle) = session(&mock, "5").open(8, CancellationToken::new());

        assert_eq!(rx.recv().await.unwrap().name(), "f1");
        let end = handle.await.unwrap();
        match end.result {
            Err(ControllerError::CursorExpired { cursor, message }) => {
                assert_eq!(cursor, ResourceVersion::new("6"));
                assert!(message.contains("too old"));
            }
            other => panic!("unexpected session outcome: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(mock.watch_calls(), vec!["5"]);
    }

    #[tokio::test]
    async fn test_other_status_is_fatal_without_reconnect() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([status_frame(500, "etcd unavailable")]));
        mock.push_watch(MockResponse::frames([event_frame("ADDED", "f1", "6")]));

        let (mut rx, handle) = session(&mock, "5").open(8, CancellationToken::new());

        let end = handle.await.unwrap();
        assert!(matches!(end.result, Err(ControllerError::Protocol { code: 500, .. })));
        assert_eq!(end.cursor, ResourceVersion::new("5"));
        assert!(rx.recv().await.is_none());
        assert_eq!(mock.watch_calls(), vec!["5"]);
    }

    #[tokio::test]
    async fn test_failed_watch_request_is_fatal() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::Status(403, "forbidden".to_string()));

        let (_rx, handle) = session(&mock, "5").open(8, CancellationToken::new());

        let end = handle.await.unwrap();
        assert!(matches!(
            end.result,
            Err(ControllerError::ApiServer(ApiServerError::Api { status: 403, .. }))
        ));
        assert_eq!(mock.watch_calls(), vec!["5"]);
    }

    #[tokio::test]
    async fn test_bad_frame_is_fatal() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f1", "6"),
            "{\"type\":\"ADDED\",\"object\":".to_string(),
        ]));

        let (mut rx, handle) = session(&mock, "5").open(8, CancellationToken::new());

        assert!(rx.recv().await.is_some());
        let end = handle.await.unwrap();
        assert!(matches!(end.result, Err(ControllerError::Decode { .. })));
        assert_eq!(end.cursor, ResourceVersion::new("6"));
    }

    #[tokio::test]
    async fn test_out_of_order_versions_are_passed_on() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([
            event_frame("ADDED", "f1", "10"),
            event_frame("MODIFIED", "f1", "9"),
        ]));
        let shutdown = CancellationToken::new();

        let (mut rx, handle) = session(&mock, "5").open(8, shutdown.clone());

        assert_eq!(rx.recv().await.unwrap().resource_version(), ResourceVersion::new("10"));
        let behind = rx.recv().await.unwrap().resource_version();
        assert!(behind < ResourceVersion::new("10"));

        // The cursor follows server order, not the highest version seen
        eventually(|| mock.watch_calls().len() == 2).await;
        assert_eq!(mock.watch_calls(), vec!["5", "9"]);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap().cursor, ResourceVersion::new("9"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_ends_session_cleanly() {
        let mock = Arc::new(MockApiServerClient::new());
        mock.push_watch(MockResponse::frames([event_frame("ADDED", "f1", "6")]));

        let (rx, handle) = session(&mock, "5").open(1, CancellationToken::new());
        drop(rx);

        let end = handle.await.unwrap();
        assert!(end.result.is_ok());
        // Nothing was delivered, so the cursor never moved
        assert_eq!(end.cursor, ResourceVersion::new("5"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_session() {
        let mock = Arc::new(MockApiServerClient::new());
        let shutdown = CancellationToken::new();

        let (_rx, handle) = session(&mock, "5").open(8, shutdown.clone());
        eventually(|| mock.watch_calls().len() == 1).await;

        shutdown.cancel();
        let end = handle.await.unwrap();
        assert!(end.result.is_ok());
        assert_eq!(end.cursor.as_str(), "5");
    }
}
