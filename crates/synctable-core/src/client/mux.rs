//! Client adapter over a [`Multiplexer`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::websocket::{spawn_websocket, WebsocketConfig, WebsocketHandle};
use super::{Client, QueryRequest, WriteOutcome, WriteRequest};
use crate::channel::{Channel, ChannelEvent, Connectivity, Multiplexer};
use crate::error::{SyncError, SyncResult};
use crate::protocol::Payload;
use crate::query::QueryOption;
use crate::record::VersionedChange;

/// A [`Client`] backed by a channel multiplexer
pub struct MuxClient {
    id: String,
    mux: Multiplexer,
    skew_ms: AtomicI64,
    signed_in: AtomicBool,
    requests: Mutex<HashMap<String, CancellationToken>>,
    last_touch: Mutex<Option<DateTime<Utc>>>,
}

impl MuxClient {
    /// Wrap `mux`; attaching physical links is up to the caller
    pub fn new(mux: Multiplexer) -> Self {
        Self {
            id: format!("client-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            mux,
            skew_ms: AtomicI64::new(0),
            signed_in: AtomicBool::new(true),
            requests: Mutex::new(HashMap::new()),
            last_touch: Mutex::new(None),
        }
    }

    /// Connect to a websocket server, reconnecting with backoff until shut down
    pub fn websocket(config: WebsocketConfig) -> (Arc<Self>, WebsocketHandle) {
        let client = Arc::new(Self::new(Multiplexer::new()));
        let handle = spawn_websocket(config, client.mux.clone());
        (client, handle)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.store(signed_in, Ordering::Relaxed);
    }

    /// When [`Client::touch`] was last called
    pub fn last_touch(&self) -> Option<DateTime<Utc>> {
        *self.last_touch.lock()
    }

    fn begin_request(&self, id: &str) -> RequestGuard<'_> {
        let token = CancellationToken::new();
        self.requests.lock().insert(id.to_string(), token.clone());
        RequestGuard {
            client: self,
            id: id.to_string(),
            token,
        }
    }

    /// Wait for the snapshot answering a query on `channel`
    async fn next_snapshot(&self, channel: &mut Channel) -> SyncResult<Vec<VersionedChange>> {
        loop {
            match channel.recv().await {
                Some(ChannelEvent::Data(Payload::Snapshot { rows, server_time })) => {
                    self.observe_server_time(server_time);
                    return Ok(rows);
                }
                Some(ChannelEvent::Data(other)) => {
                    debug!("Ignoring {} while waiting for snapshot", other.cmd());
                }
                Some(ChannelEvent::Close) | None => return Err(SyncError::Disconnected),
            }
        }
    }

    async fn collect_verdicts(
        &self,
        channel: &mut Channel,
        ids: &[String],
    ) -> SyncResult<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        let mut remaining: Vec<&String> = ids.iter().collect();

        while !remaining.is_empty() {
            match channel.recv().await {
                Some(ChannelEvent::Data(Payload::Ack { ids: acked, changes })) => {
                    for id in acked {
                        if let Some(pos) = remaining.iter().position(|r| **r == id) {
                            remaining.remove(pos);
                            let change = changes
                                .iter()
                                .find(|c| c.id.as_deref() == Some(id.as_str()))
                                .cloned();
                            outcome.acked.push((id, change));
                        }
                    }
                }
                Some(ChannelEvent::Data(Payload::Error { id, message })) => {
                    if let Some(pos) = remaining.iter().position(|r| **r == id) {
                        remaining.remove(pos);
                        outcome.rejected.push((id, message));
                    }
                }
                Some(ChannelEvent::Data(Payload::Snapshot { server_time, .. })) => {
                    self.observe_server_time(server_time);
                }
                Some(ChannelEvent::Data(_)) => {}
                Some(ChannelEvent::Close) | None => return Err(SyncError::Disconnected),
            }
        }
        Ok(outcome)
    }
}

/// Registration of an in-flight request, removed on every exit path
struct RequestGuard<'a> {
    client: &'a MuxClient,
    id: String,
    token: CancellationToken,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.client.requests.lock().remove(&self.id);
    }
}

#[async_trait]
impl Client for MuxClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn channel(&self, name: &str) -> SyncResult<Channel> {
        self.mux.channel(name)
    }

    async fn query(&self, request: QueryRequest) -> SyncResult<Vec<VersionedChange>> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        let guard = self.begin_request(&request.id);
        let mut channel = self.mux.channel(&format!("query:{}", request.id))?;

        let mut options = request.options.clone();
        if !options.contains(&QueryOption::NoChangefeed) {
            options.push(QueryOption::NoChangefeed);
        }
        if !channel.write(Payload::Query {
            query: request.query.clone(),
            options,
        }) {
            return Err(SyncError::Disconnected);
        }

        let result = tokio::select! {
            _ = guard.token.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(request.timeout) => Err(SyncError::Timeout(request.timeout)),
            rows = self.next_snapshot(&mut channel) => rows,
        };
        channel.close();
        result
    }

    async fn write(&self, request: WriteRequest) -> SyncResult<WriteOutcome> {
        if request.changes.is_empty() {
            return Ok(WriteOutcome::default());
        }
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        let ids: Vec<String> = request
            .changes
            .iter()
            .map(|c| {
                c.id.clone().ok_or_else(|| {
                    SyncError::InvalidRecord("write is missing its id".to_string())
                })
            })
            .collect::<SyncResult<_>>()?;

        let guard = self.begin_request(&request.id);
        let mut channel = self.mux.channel(&format!("write:{}", request.id))?;

        // An empty query tells the server which table the writes target
        let mut options: Vec<QueryOption> = request
            .options
            .iter()
            .filter(|o| !matches!(o, QueryOption::Limit(_)))
            .cloned()
            .collect();
        options.push(QueryOption::NoChangefeed);
        options.push(QueryOption::Limit(0));

        let sent = channel.write(Payload::Query {
            query: request.query.clone(),
            options,
        }) && channel.write(Payload::Set {
            changes: request.changes.clone(),
        });
        if !sent {
            return Err(SyncError::Disconnected);
        }

        let result = tokio::select! {
            _ = guard.token.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(request.timeout) => Err(SyncError::Timeout(request.timeout)),
            outcome = self.collect_verdicts(&mut channel, &ids) => outcome,
        };
        channel.close();
        result
    }

    fn query_cancel(&self, id: &str) -> bool {
        match self.requests.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        self.mux.is_connected()
    }

    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::Relaxed)
    }

    fn server_time(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.skew_ms.load(Ordering::Relaxed))
    }

    fn observe_server_time(&self, server_time: DateTime<Utc>) {
        let skew = (server_time - Utc::now()).num_milliseconds();
        self.skew_ms.store(skew, Ordering::Relaxed);
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.mux.connectivity()
    }

    fn touch(&self) {
        *self.last_touch.lock() = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::transport::Transport;
    use std::time::Duration;

    #[test]
    fn test_client_id() {
        let client = MuxClient::new(Multiplexer::new());
        assert!(client.client_id().starts_with("client-"));
        assert!(client.is_signed_in());
        assert!(!client.is_connected());
    }

    #[test]
    fn test_server_time_follows_observed_skew() {
        let client = MuxClient::new(Multiplexer::new());
        client.observe_server_time(Utc::now() + ChronoDuration::hours(1));

        let skew = client.server_time() - Utc::now();
        assert!(skew > ChronoDuration::minutes(59));
        assert!(skew < ChronoDuration::minutes(61));
    }

    #[tokio::test]
    async fn test_query_offline_fails_fast() {
        let client = MuxClient::new(Multiplexer::new());
        let query = Query::parse(r#"{"t": [{"id": null}]}"#).unwrap();
        let result = client.query(QueryRequest::new(query, vec![])).await;
        assert_eq!(result, Err(SyncError::Disconnected));
    }

    #[tokio::test]
    async fn test_query_cancel() {
        let client = Arc::new(MuxClient::new(Multiplexer::new()));
        // A peer that never answers
        let (ours, _silent_peer) = Transport::pair(8);
        client.multiplexer().attach(ours);

        let query = Query::parse(r#"{"t": [{"id": null}]}"#).unwrap();
        let request = QueryRequest::new(query, vec![]).with_timeout(Duration::from_secs(10));
        let id = request.id.clone();

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.query(request).await })
        };
        // Wait until the request is registered
        while !client.query_cancel(&id) {
            tokio::task::yield_now().await;
        }

        assert_eq!(task.await.unwrap(), Err(SyncError::Cancelled));
        assert!(!client.query_cancel(&id));
        assert_eq!(client.multiplexer().open_channels(), 0);
    }
}
