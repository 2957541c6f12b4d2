//! Table backed by a one-shot query
//!
//! The rows are fetched once when the table opens and never refreshed.
//! Local writes are persisted through one-shot write requests and reconciled
//! against the server's verdict like a full [`SyncTable`](super::SyncTable).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{settle, ChangeOrigin, Rows, SyncState, Table, TableEvent, TableOptions, TableStore};
use crate::client::{Client, QueryRequest, WriteRequest};
use crate::error::{SyncError, SyncResult};
use crate::query::{Query, QueryKey, QueryOption, Schema};
use crate::record::{Record, RowKey};

struct Shared {
    query: Query,
    key: QueryKey,
    wire_options: Vec<QueryOption>,
    primary_keys: Vec<String>,
    client: Arc<dyn Client>,
    options: TableOptions,
    store: Mutex<TableStore>,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<TableEvent>,
    flush: Notify,
    flush_now: Notify,
}

impl Shared {
    fn emit(&self, event: TableEvent) {
        let _ = self.events.send(event);
    }
}

/// A table that never receives pushed updates
pub struct NoChangefeedTable {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NoChangefeedTable {
    /// Query the server once and start the write-through task
    pub async fn open(
        query: Query,
        options: Vec<QueryOption>,
        schema: &Schema,
        client: Arc<dyn Client>,
        table_options: TableOptions,
    ) -> SyncResult<Self> {
        let key = QueryKey::new(&query, &options);
        let primary_keys = schema.primary_keys(&query, &options);
        let wire_options = schema.wire_options(&query, &options);

        let request = QueryRequest::new(query.clone(), wire_options.clone())
            .with_timeout(table_options.save_timeout);
        let rows = client.query(request).await?;

        let mut store = TableStore::new(primary_keys.clone(), client.client_id());
        let count = rows.len();
        for e in store.apply_snapshot(rows).skipped {
            warn!("Dropped row loading {}: {}", query.table(), e);
        }
        debug!("Loaded {} rows for {} (no changefeed)", count, query.table());

        let (state, _) = watch::channel(SyncState::Synced);
        let (events, _) = broadcast::channel(table_options.event_capacity.max(1));
        let shared = Arc::new(Shared {
            query,
            key,
            wire_options,
            primary_keys,
            client,
            options: table_options,
            store: Mutex::new(store),
            state,
            events,
            flush: Notify::new(),
            flush_now: Notify::new(),
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(write_through(shared.clone(), shutdown.clone()));
        Ok(Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *self.shared.state.borrow() == SyncState::Closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    fn local_change(&self, key: &RowKey, changed: bool) {
        if changed {
            self.shared.emit(TableEvent::Changed {
                keys: vec![key.clone()],
                origin: ChangeOrigin::Local,
            });
        }
        self.shared.flush.notify_one();
    }
}

#[async_trait]
impl Table for NoChangefeedTable {
    fn query(&self) -> &Query {
        &self.shared.query
    }

    fn query_key(&self) -> &QueryKey {
        &self.shared.key
    }

    fn primary_keys(&self) -> &[String] {
        &self.shared.primary_keys
    }

    fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.shared.events.subscribe()
    }

    fn get(&self) -> Rows {
        self.shared.store.lock().visible().clone()
    }

    fn get_one(&self, key: &Record) -> Option<Record> {
        self.shared.store.lock().get_one(key)
    }

    fn set(&self, partial: Record) -> SyncResult<RowKey> {
        self.ensure_open()?;
        let (key, changed) = self.shared.store.lock().set(partial)?;
        self.local_change(&key, changed);
        Ok(key)
    }

    fn delete(&self, key: &Record) -> SyncResult<RowKey> {
        self.ensure_open()?;
        let (row, changed) = self.shared.store.lock().delete(key)?;
        self.local_change(&row, changed);
        Ok(row)
    }

    async fn save_cancellable(&self, cancel: &CancellationToken) -> SyncResult<()> {
        self.ensure_open()?;
        let ids = self.shared.store.lock().outstanding_ids();
        if ids.is_empty() {
            return Ok(());
        }
        let events = self.shared.events.subscribe();
        let state = self.shared.state.subscribe();
        let connectivity = self.shared.client.connectivity();
        self.shared.flush_now.notify_one();

        settle(
            &self.shared.store,
            events,
            state,
            connectivity,
            ids,
            self.shared.options.save_timeout,
            cancel,
        )
        .await
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.ok();
        }
        self.shared.state.send_replace(SyncState::Closed);
    }
}

impl Drop for NoChangefeedTable {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Persist queued writes in batches until shut down
async fn write_through(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut retry_delay = shared.options.reconnect_initial;

    loop {
        let immediate = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = shared.flush.notified() => false,
            _ = shared.flush_now.notified() => true,
        };
        if !immediate {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(shared.options.flush_interval) => {}
                _ = shared.flush_now.notified() => {}
            }
        }

        match write_batch(&shared, &shutdown).await {
            Ok(()) => retry_delay = shared.options.reconnect_initial,
            Err(SyncError::Cancelled) => return,
            Err(e) => {
                warn!("Write-through for {} failed: {}", shared.query.table(), e);
                shared.store.lock().requeue_inflight();
                shared.emit(TableEvent::Error(e.to_string()));
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                retry_delay = (retry_delay * 2).min(shared.options.reconnect_max);
                shared.flush.notify_one();
            }
        }
    }
}

async fn write_batch(shared: &Shared, shutdown: &CancellationToken) -> SyncResult<()> {
    let changes = {
        let mut store = shared.store.lock();
        let changes = store.pending_changes(shared.client.server_time());
        store.mark_flushed();
        changes
    };
    if changes.is_empty() {
        return Ok(());
    }

    let request = WriteRequest::new(
        shared.query.clone(),
        shared.wire_options.clone(),
        changes,
    )
    .with_timeout(shared.options.save_timeout);
    let request_id = request.id.clone();

    let outcome = tokio::select! {
        _ = shutdown.cancelled() => {
            shared.client.query_cancel(&request_id);
            return Err(SyncError::Cancelled);
        }
        outcome = shared.client.write(request) => outcome?,
    };

    let mut changed = Vec::new();
    let mut rolled_back = Vec::new();
    let mut rejected = Vec::new();
    {
        let mut store = shared.store.lock();
        for (id, authoritative) in &outcome.acked {
            if let Some((key, true)) = store.acknowledge(id, authoritative.as_ref()) {
                changed.push(key);
            }
        }
        for (id, message) in &outcome.rejected {
            let result = store.reject(id, message);
            if let Some((key, true)) = &result {
                rolled_back.push(key.clone());
            }
            rejected.push((id.clone(), result.map(|(key, _)| key), message.clone()));
        }
    }

    if !changed.is_empty() {
        shared.emit(TableEvent::Changed {
            keys: changed,
            origin: ChangeOrigin::Remote,
        });
    }
    if !rolled_back.is_empty() {
        shared.emit(TableEvent::Changed {
            keys: rolled_back,
            origin: ChangeOrigin::Rollback,
        });
    }
    if !outcome.acked.is_empty() {
        shared.emit(TableEvent::Acknowledged {
            ids: outcome.acked.iter().map(|(id, _)| id.clone()).collect(),
        });
    }
    for (id, key, message) in rejected {
        shared.emit(TableEvent::Rejected { id, key, message });
    }
    Ok(())
}
