//! Chronological Puller (C4): fetches ordered realm events from the remote
//! GraphQL endpoint for one track.
//!
//! `poll_once` is a pure one-shot fetch — no retry, no backoff, no cursor
//! mutation. The polling loop that owns those concerns (and decides what a
//! transport-vs-protocol failure means for the track) lives in the
//! Coordinator, which has the cursor and lease context this crate
//! deliberately does not.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use evlog_schemas::{Cursor, Event};
use serde_json::{json, Value};

#[derive(Debug)]
pub enum PullError {
    /// Network/connection-level failure. Safe to retry.
    Transport(String),
    /// The endpoint responded but rejected the query, or returned a shape
    /// this client cannot parse. Not safe to blindly retry.
    Protocol(String),
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullError::Transport(msg) => write!(f, "pull transport error: {msg}"),
            PullError::Protocol(msg) => write!(f, "pull protocol error: {msg}"),
        }
    }
}

impl std::error::Error for PullError {}

/// The boundary this crate talks to. A real [`GraphQlClient`] implements it
/// over `reqwest`; tests and `evlog-testkit` supply in-process fakes.
#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, PullError>;
}

/// `reqwest`-backed [`GraphQlTransport`] against a single GraphQL endpoint.
pub struct GraphQlClient {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphQlClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl GraphQlTransport for GraphQlClient {
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, PullError> {
        let body = json!({ "query": query, "variables": variables });

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PullError::Transport(e.to_string()))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| PullError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(PullError::Transport(format!("endpoint returned {status}")));
        }

        if let Some(errors) = payload.get("errors") {
            return Err(PullError::Protocol(errors.to_string()));
        }

        payload
            .get("data")
            .cloned()
            .ok_or_else(|| PullError::Protocol("response missing `data`".to_string()))
    }
}

const EVENTS_QUERY: &str = r#"
query TrackEvents($pkgPath: String!, $eventTypePrefix: String, $fromHeight: Int!, $fromTxIndex: Int!, $toHeight: Int!) {
  events(filter: {
    pkg_path: $pkgPath,
    event_type_prefix: $eventTypePrefix,
    from_height: $fromHeight,
    from_tx_index: $fromTxIndex,
    to_height: $toHeight
  }) {
    epoch
    height
    txIndex: tx_index
    pkgPath: pkg_path
    eventType: event_type
    timestamp
    attrs { key value }
  }
}
"#;

const LATEST_HEIGHT_QUERY: &str = r#"
query LatestBlockHeight {
  latestBlockHeight: latest_block_height
}
"#;

/// Fetches ordered events for one track from a [`GraphQlTransport`].
pub struct ChronologicalPuller<T: GraphQlTransport> {
    transport: Arc<T>,
    realm_path: String,
    event_type_prefix: Option<String>,
}

impl<T: GraphQlTransport> ChronologicalPuller<T> {
    pub fn new(transport: Arc<T>, realm_path: impl Into<String>, event_type_prefix: Option<String>) -> Self {
        Self {
            transport,
            realm_path: realm_path.into(),
            event_type_prefix,
        }
    }

    /// Fetches every event strictly after `cursor`, bounded by `cursor.height
    /// + window`, in ascending `(height, tx_index)` order.
    ///
    /// The predicate is expressed as two explicit query variables
    /// (`from_height`/`from_tx_index`) rather than string-interpolated SQL-
    /// like text, so the two-branch "same height, greater tx_index" OR
    /// "greater height" comparison is the remote side's job, not ours.
    pub async fn poll_once(&self, cursor: Cursor, window: i64) -> Result<Vec<Event>, PullError> {
        let variables = json!({
            "pkgPath": self.realm_path,
            "eventTypePrefix": self.event_type_prefix,
            "fromHeight": cursor.height,
            "fromTxIndex": cursor.tx_index,
            "toHeight": cursor.height + window,
        });

        let data = self.transport.execute(EVENTS_QUERY, variables).await?;
        let raw_events = data
            .get("events")
            .ok_or_else(|| PullError::Protocol("response missing `events`".to_string()))?;

        let mut events: Vec<Event> = serde_json::from_value(raw_events.clone())
            .map_err(|e| PullError::Protocol(format!("malformed event payload: {e}")))?;

        events.sort();
        Ok(events)
    }

    /// Probes the remote's current chain height, used by the Coordinator to
    /// decide whether an empty page means "caught up" or "endpoint stalled".
    pub async fn latest_block_height(&self) -> Result<i64, PullError> {
        let data = self.transport.execute(LATEST_HEIGHT_QUERY, json!({})).await?;
        data.get("latestBlockHeight")
            .and_then(Value::as_i64)
            .ok_or_else(|| PullError::Protocol("response missing `latestBlockHeight`".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlog_schemas::Attr;
    use std::sync::Mutex;

    struct FakeTransport {
        responses: Mutex<Vec<Result<Value, String>>>,
    }

    impl FakeTransport {
        fn with_responses(responses: Vec<Result<Value, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl GraphQlTransport for FakeTransport {
        async fn execute(&self, _query: &str, _variables: Value) -> Result<Value, PullError> {
            let mut responses = self.responses.lock().unwrap();
            match responses.remove(0) {
                Ok(v) => Ok(v),
                Err(msg) => Err(PullError::Transport(msg)),
            }
        }
    }

    fn event_json(height: i64, tx_index: i64) -> Value {
        serde_json::to_value(Event {
            epoch: 1,
            height,
            tx_index,
            pkg_path: "gno.land/r/demo/boards".to_string(),
            event_type: "CreateBoard".to_string(),
            timestamp: 1_700_000_000,
            attrs: vec![Attr {
                key: "title".to_string(),
                value: "hi".to_string(),
            }],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn poll_once_returns_events_in_ascending_order() {
        let transport = Arc::new(FakeTransport::with_responses(vec![Ok(json!({
            "events": [event_json(5, 1), event_json(4, 0), event_json(5, 0)]
        }))]));
        let puller = ChronologicalPuller::new(transport, "gno.land/r/demo/boards", None);

        let events = puller.poll_once(Cursor::zero(), 1000).await.unwrap();
        let heights_and_tx: Vec<(i64, i64)> = events.iter().map(Event::order_key).collect();
        assert_eq!(heights_and_tx, vec![(4, 0), (5, 0), (5, 1)]);
    }

    #[tokio::test]
    async fn poll_once_surfaces_protocol_error_on_graphql_errors() {
        let transport = Arc::new(FakeTransport::with_responses(vec![Err(
            "connection refused".to_string()
        )]));
        let puller = ChronologicalPuller::new(transport, "gno.land/r/demo/boards", None);

        let err = puller.poll_once(Cursor::zero(), 1000).await.unwrap_err();
        assert!(matches!(err, PullError::Transport(_)));
    }

    #[tokio::test]
    async fn poll_once_rejects_malformed_payload_as_protocol_error() {
        let transport = Arc::new(FakeTransport::with_responses(vec![Ok(json!({
            "events": [{"not": "an event"}]
        }))]));
        let puller = ChronologicalPuller::new(transport, "gno.land/r/demo/boards", None);

        let err = puller.poll_once(Cursor::zero(), 1000).await.unwrap_err();
        assert!(matches!(err, PullError::Protocol(_)));
    }

    #[tokio::test]
    async fn latest_block_height_parses_scalar_response() {
        let transport = Arc::new(FakeTransport::with_responses(vec![Ok(json!({
            "latestBlockHeight": 12345
        }))]));
        let puller = ChronologicalPuller::new(transport, "gno.land/r/demo/boards", None);

        assert_eq!(puller.latest_block_height().await.unwrap(), 12345);
    }
}
