//! Live tables
//!
//! Every table variant implements [`Table`]:
//!
//! - [`SyncTable`]: versioned mirror of a query with a changefeed
//! - [`NoChangefeedTable`]: one server query, then local with write-through
//! - [`NoDatabaseTable`]: purely local
//!
//! All of them keep their rows in a [`TableStore`].

mod no_changefeed;
mod no_database;
mod store;
mod synctable;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::Connectivity;
use crate::client::Client;
use crate::error::{SyncError, SyncResult};
use crate::query::{has_option, Query, QueryKey, QueryOption, Schema};
use crate::record::{Record, RowKey};

pub use no_changefeed::NoChangefeedTable;
pub use no_database::NoDatabaseTable;
pub use store::{Rows, Snapshot, TableStore};
pub use synctable::SyncTable;

/// Connection state of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not connected, not trying
    Disconnected,
    /// Waiting for the link or (re)opening the channel
    Connecting,
    /// Query sent, waiting for the snapshot
    Connected,
    /// Snapshot applied; updates flow
    Synced,
    /// Closed for good
    Closed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::Connected => "connected",
            SyncState::Synced => "synced",
            SyncState::Closed => "closed",
        }
    }
}

/// Where a visible change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// `set` or `delete` on this table
    Local,
    /// Snapshot, changefeed update or acknowledgement from the server
    Remote,
    /// A rejected write was rolled back
    Rollback,
}

/// Notifications from a table
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// Visible rows changed
    Changed {
        keys: Vec<RowKey>,
        origin: ChangeOrigin,
    },
    /// The server accepted these writes
    Acknowledged { ids: Vec<String> },
    /// The server refused a write; its row was rolled back
    Rejected {
        id: String,
        key: Option<RowKey>,
        message: String,
    },
    /// A recoverable problem (malformed frame, failed write-through)
    Error(String),
}

/// Timing knobs shared by all tables
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Delay between the first unsent write and the batch going out
    pub flush_interval: Duration,
    /// How long `save` waits for acknowledgements
    pub save_timeout: Duration,
    /// First delay before retrying a failed subscription
    pub reconnect_initial: Duration,
    /// Upper bound for the retry delay
    pub reconnect_max: Duration,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            save_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

/// A live view of one query
#[async_trait]
pub trait Table: Send + Sync {
    fn query(&self) -> &Query;

    fn query_key(&self) -> &QueryKey;

    fn primary_keys(&self) -> &[String];

    fn watch_state(&self) -> watch::Receiver<SyncState>;

    fn state(&self) -> SyncState {
        *self.watch_state().borrow()
    }

    /// Receive change, acknowledgement and rejection events
    fn subscribe(&self) -> broadcast::Receiver<TableEvent>;

    /// All visible rows
    fn get(&self) -> Rows;

    /// The visible row whose primary key matches `key`
    fn get_one(&self, key: &Record) -> Option<Record>;

    /// Merge `partial` into its row locally and queue it for the server
    fn set(&self, partial: Record) -> SyncResult<RowKey>;

    /// Remove the row identified by `key` locally and queue the deletion
    fn delete(&self, key: &Record) -> SyncResult<RowKey>;

    /// Wait until every write made so far is acknowledged
    async fn save(&self) -> SyncResult<()> {
        self.save_cancellable(&CancellationToken::new()).await
    }

    async fn save_cancellable(&self, cancel: &CancellationToken) -> SyncResult<()>;

    /// Stop syncing; idempotent
    async fn close(&self);

    /// Resolve with the rows once `predicate` holds
    async fn wait(
        &self,
        predicate: &(dyn for<'r> Fn(&'r Rows) -> bool + Send + Sync),
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Rows> {
        let mut events = self.subscribe();
        let mut state = self.watch_state();
        let deadline = Instant::now() + timeout;

        loop {
            if *state.borrow_and_update() == SyncState::Closed {
                return Err(SyncError::Closed);
            }
            let rows = self.get();
            if predicate(&rows) {
                return Ok(rows);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(SyncError::Timeout(timeout)),
                event = events.recv() => {
                    if let Err(RecvError::Closed) = event {
                        return Err(SyncError::Closed);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::Closed);
                    }
                }
            }
        }
    }
}

/// Build the table variant matching `options`
///
/// `ephemeral` gives a [`NoDatabaseTable`], `no_changefeed` a
/// [`NoChangefeedTable`] (which queries the server before returning), and
/// anything else a [`SyncTable`].
pub async fn open(
    query: Query,
    options: Vec<QueryOption>,
    schema: &Schema,
    client: Arc<dyn Client>,
    table_options: TableOptions,
) -> SyncResult<Arc<dyn Table>> {
    if has_option(&options, &QueryOption::Ephemeral) {
        let table = NoDatabaseTable::new(query, options, schema, client.client_id(), &table_options);
        return Ok(Arc::new(table));
    }
    if has_option(&options, &QueryOption::NoChangefeed) {
        let table = NoChangefeedTable::open(query, options, schema, client, table_options).await?;
        return Ok(Arc::new(table));
    }
    let table = SyncTable::new(query, options, schema, client, table_options)?;
    Ok(Arc::new(table))
}

/// Wait until `ids` are all acknowledged
///
/// Subscribe to `events` and `state` before kicking the flush, so no verdict
/// slips through between the flush and the first check.
pub(crate) async fn settle(
    store: &Mutex<TableStore>,
    mut events: broadcast::Receiver<TableEvent>,
    mut state: watch::Receiver<SyncState>,
    mut connectivity: watch::Receiver<Connectivity>,
    ids: Vec<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    let deadline = Instant::now() + timeout;

    loop {
        {
            let store = store.lock();
            for id in &ids {
                if let Some(message) = store.rejection(id) {
                    return Err(SyncError::ServerRejected {
                        id: id.clone(),
                        message: message.to_string(),
                    });
                }
            }
            if !ids.iter().any(|id| store.is_outstanding(id)) {
                return Ok(());
            }
        }

        match *state.borrow_and_update() {
            SyncState::Closed => return Err(SyncError::Closed),
            SyncState::Disconnected | SyncState::Connecting => {
                return Err(SyncError::Disconnected)
            }
            SyncState::Connected | SyncState::Synced => {}
        }
        if *connectivity.borrow_and_update() != Connectivity::Online {
            return Err(SyncError::Disconnected);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(SyncError::Timeout(timeout)),
            event = events.recv() => {
                if let Err(RecvError::Closed) = event {
                    return Err(SyncError::Closed);
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Err(SyncError::Closed);
                }
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    return Err(SyncError::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SyncState::Synced.as_str(), "synced");
        assert_eq!(SyncState::Connecting.as_str(), "connecting");
        assert_ne!(SyncState::Connected, SyncState::Synced);
    }

    #[test]
    fn test_default_options() {
        let options = TableOptions::default();
        assert_eq!(options.flush_interval, Duration::from_millis(50));
        assert_eq!(options.save_timeout, Duration::from_secs(30));
        assert!(options.reconnect_initial <= options.reconnect_max);
    }
}
