//! Client adapter
//!
//! The capabilities a table needs from its host process: channels on the
//! shared connection, one-shot queries and writes, connectivity, and the
//! server's clock. Tables receive an `Arc<dyn Client>` at construction.

mod mux;
mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::channel::{Channel, Connectivity};
use crate::error::SyncResult;
use crate::query::{Query, QueryOption};
use crate::record::VersionedChange;

pub use mux::MuxClient;
pub use websocket::{spawn_websocket, WebsocketConfig, WebsocketHandle};

/// Deadline for one-shot requests when the caller does not pick one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A one-shot query
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Handle for [`Client::query_cancel`]
    pub id: String,
    pub query: Query,
    pub options: Vec<QueryOption>,
    pub timeout: Duration,
}

impl QueryRequest {
    pub fn new(query: Query, options: Vec<QueryOption>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query,
            options,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A one-shot batch of writes against the table named by `query`
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: String,
    pub query: Query,
    pub options: Vec<QueryOption>,
    pub changes: Vec<VersionedChange>,
    pub timeout: Duration,
}

impl WriteRequest {
    pub fn new(query: Query, options: Vec<QueryOption>, changes: Vec<VersionedChange>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query,
            options,
            changes,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Server verdict on a [`WriteRequest`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    /// Acknowledged write ids with the authoritative row, when the server sent one
    pub acked: Vec<(String, Option<VersionedChange>)>,
    /// Rejected write ids with the server's reason
    pub rejected: Vec<(String, String)>,
}

/// What a table needs from the process hosting it
#[async_trait]
pub trait Client: Send + Sync {
    /// Stable id of this client, used to build write ids
    fn client_id(&self) -> &str;

    /// Open a named channel on the shared connection
    fn channel(&self, name: &str) -> SyncResult<Channel>;

    /// Fetch a result set once, without a changefeed
    async fn query(&self, request: QueryRequest) -> SyncResult<Vec<VersionedChange>>;

    /// Send writes once and wait for the server's verdict on each
    async fn write(&self, request: WriteRequest) -> SyncResult<WriteOutcome>;

    /// Abort an in-flight [`Client::query`] or [`Client::write`]; true if it was running
    fn query_cancel(&self, id: &str) -> bool;

    fn is_connected(&self) -> bool;

    fn is_signed_in(&self) -> bool;

    /// Current time on the server's clock
    fn server_time(&self) -> DateTime<Utc>;

    /// Record a timestamp taken on the server, to estimate clock skew
    fn observe_server_time(&self, server_time: DateTime<Utc>);

    /// Connectivity transitions of the physical connection
    fn connectivity(&self) -> watch::Receiver<Connectivity>;

    /// Signal activity on the connection (keeps the remote end warm)
    fn touch(&self) {}
}
