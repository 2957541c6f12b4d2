//! Versioned mirror of one query with a changefeed
//!
//! A driver task owns the channel and processes, strictly in arrival order,
//! channel events, the flush timer and connectivity changes. `get` and `set`
//! only touch the [`TableStore`] under a short lock.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{settle, ChangeOrigin, Rows, SyncState, Table, TableEvent, TableOptions, TableStore};
use crate::channel::{Channel, ChannelEvent, Connectivity};
use crate::client::Client;
use crate::error::{SyncError, SyncResult};
use crate::protocol::Payload;
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
    /// A write was queued; flush after the interval
    flush: Notify,
    /// `save` wants the queue flushed right away
    flush_now: Notify,
}

impl Shared {
    fn emit(&self, event: TableEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_changed(&self, keys: Vec<RowKey>, origin: ChangeOrigin) {
        if !keys.is_empty() {
            self.emit(TableEvent::Changed { keys, origin });
        }
    }

    /// Log a malformed server message and pass it on to subscribers
    fn report(&self, message: String) {
        warn!("Table {}: {}", self.query.table(), message);
        self.emit(TableEvent::Error(message));
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Table {}: {} -> {}", self.query.table(), previous.as_str(), state.as_str());
        }
    }
}

/// Live, optimistic mirror of a query result set
pub struct SyncTable {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncTable {
    /// Start syncing `query`
    ///
    /// Opens the channel `synctable:<query key>` right away and spawns the
    /// driver task, so this must run inside a tokio runtime.
    pub fn new(
        query: Query,
        options: Vec<QueryOption>,
        schema: &Schema,
        client: Arc<dyn Client>,
        table_options: TableOptions,
    ) -> SyncResult<Self> {
        let key = QueryKey::new(&query, &options);
        let primary_keys = schema.primary_keys(&query, &options);
        let wire_options = schema.wire_options(&query, &options);
        let channel = client.channel(&channel_name(&key))?;

        let (state, _) = watch::channel(SyncState::Disconnected);
        let (events, _) = broadcast::channel(table_options.event_capacity.max(1));
        let shared = Arc::new(Shared {
            store: Mutex::new(TableStore::new(primary_keys.clone(), client.client_id())),
            query,
            key,
            wire_options,
            primary_keys,
            client,
            options: table_options,
            state,
            events,
            flush: Notify::new(),
            flush_now: Notify::new(),
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(drive(shared.clone(), channel, shutdown.clone()));

        Ok(Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Name of the channel this table syncs over
    pub fn channel_name(&self) -> String {
        channel_name(&self.shared.key)
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        let store = self.shared.store.lock();
        store.has_pending() || store.has_inflight()
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *self.shared.state.borrow() == SyncState::Closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }
}

fn channel_name(key: &QueryKey) -> String {
    format!("synctable:{}", key)
}

#[async_trait]
impl Table for SyncTable {
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
        if changed {
            self.shared.emit_changed(vec![key.clone()], ChangeOrigin::Local);
        }
        self.shared.flush.notify_one();
        Ok(key)
    }

    fn delete(&self, key: &Record) -> SyncResult<RowKey> {
        self.ensure_open()?;
        let (row, changed) = self.shared.store.lock().delete(key)?;
        if changed {
            self.shared.emit_changed(vec![row.clone()], ChangeOrigin::Local);
        }
        self.shared.flush.notify_one();
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
        self.shared.set_state(SyncState::Closed);
    }
}

impl Drop for SyncTable {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Why a session on the channel ended
enum SessionEnd {
    /// Link or channel lost; try again
    Lost { synced: bool, link_lost: bool },
    /// Table closed or connection destroyed
    Stop,
}

/// Driver task: (re)connect, sync, flush, until shut down
async fn drive(shared: Arc<Shared>, mut channel: Channel, shutdown: CancellationToken) {
    let mut connectivity = shared.client.connectivity();
    let mut retry_delay = shared.options.reconnect_initial;

    loop {
        shared.set_state(SyncState::Connecting);

        // Wait for a physical link
        loop {
            match *connectivity.borrow_and_update() {
                Connectivity::Online => break,
                Connectivity::Destroyed => return finish(&shared, &mut channel),
                Connectivity::Offline => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => return finish(&shared, &mut channel),
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return finish(&shared, &mut channel);
                    }
                }
            }
        }

        let end = match channel.connect() {
            Ok(()) => session(&shared, &mut channel, &mut connectivity, &shutdown).await,
            Err(e) => {
                warn!("Could not open channel {}: {}", channel.name(), e);
                shared.emit(TableEvent::Error(e.to_string()));
                SessionEnd::Lost {
                    synced: false,
                    link_lost: link_changed(&connectivity),
                }
            }
        };

        // In-flight writes may or may not have landed; resend them after the
        // next snapshot (the server drops duplicate ids)
        shared.store.lock().requeue_inflight();

        match end {
            SessionEnd::Stop => return finish(&shared, &mut channel),
            SessionEnd::Lost { synced, link_lost } => {
                shared.set_state(SyncState::Connecting);
                if synced || link_lost {
                    retry_delay = shared.options.reconnect_initial;
                }
                // Only back off when the channel failed on a healthy link; a
                // lost link is retried by whoever owns it
                if !link_lost && *connectivity.borrow() == Connectivity::Online {
                    tokio::select! {
                        _ = shutdown.cancelled() => return finish(&shared, &mut channel),
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                    retry_delay = (retry_delay * 2).min(shared.options.reconnect_max);
                }
            }
        }
    }
}

/// Whether the link dropped since `connectivity` was last looked at
fn link_changed(connectivity: &watch::Receiver<Connectivity>) -> bool {
    connectivity.has_changed().unwrap_or(true) || *connectivity.borrow() != Connectivity::Online
}

fn finish(shared: &Shared, channel: &mut Channel) {
    channel.close();
    shared.set_state(SyncState::Closed);
    debug!("Table {} closed", shared.query.table());
}

/// One subscription on an open channel
async fn session(
    shared: &Shared,
    channel: &mut Channel,
    connectivity: &mut watch::Receiver<Connectivity>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let query = Payload::Query {
        query: shared.query.clone(),
        options: shared.wire_options.clone(),
    };
    if !channel.write(query) {
        debug!("Could not send query on {}", channel.name());
        channel.close();
        return SessionEnd::Lost {
            synced: false,
            link_lost: link_changed(connectivity),
        };
    }
    shared.set_state(SyncState::Connected);

    let mut synced = false;
    let mut flush_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return SessionEnd::Stop,

            event = channel.recv() => {
                match event {
                    Some(ChannelEvent::Data(payload)) => {
                        if handle_payload(shared, payload) {
                            if !synced {
                                info!("Table {} synced", shared.query.table());
                            }
                            synced = true;
                            // Replay whatever queued up while disconnected
                            flush_at = Some(Instant::now());
                        }
                    }
                    Some(ChannelEvent::Close) | None => {
                        debug!("Channel {} closed", channel.name());
                        return SessionEnd::Lost {
                            synced,
                            link_lost: link_changed(connectivity),
                        };
                    }
                }
            }

            changed = connectivity.changed() => {
                match changed {
                    Ok(()) => match *connectivity.borrow_and_update() {
                        Connectivity::Online => {}
                        Connectivity::Offline => {
                            channel.close();
                            return SessionEnd::Lost { synced, link_lost: true };
                        }
                        Connectivity::Destroyed => return SessionEnd::Stop,
                    },
                    Err(_) => return SessionEnd::Stop,
                }
            }

            _ = shared.flush.notified(), if flush_at.is_none() => {
                flush_at = Some(Instant::now() + shared.options.flush_interval);
            }

            _ = shared.flush_now.notified() => {
                flush_at = Some(Instant::now());
            }

            _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                flush_at = None;
                // Writes wait for the snapshot before going out
                if synced && !flush(shared, channel) {
                    flush_at = Some(Instant::now() + shared.options.flush_interval);
                }
            }
        }
    }
}

/// Apply one payload from the server; true if it was a snapshot
fn handle_payload(shared: &Shared, payload: Payload) -> bool {
    match payload {
        Payload::Snapshot { rows, server_time } => {
            shared.client.observe_server_time(server_time);
            let count = rows.len();
            let snapshot = shared.store.lock().apply_snapshot(rows);
            debug!("Snapshot of {} rows for {}", count, shared.query.table());
            for e in snapshot.skipped {
                shared.report(format!("Dropped snapshot row: {}", e));
            }
            // Anyone woken by Synced must not see this change afterwards
            shared.emit_changed(snapshot.changed, ChangeOrigin::Remote);
            shared.set_state(SyncState::Synced);
            true
        }
        Payload::Update { changes } => {
            let mut keys = Vec::new();
            let mut malformed = Vec::new();
            {
                let mut store = shared.store.lock();
                for change in &changes {
                    match store.apply_change(change) {
                        Ok(Some(key)) => keys.push(key),
                        Ok(None) => {}
                        Err(e) => malformed.push(e),
                    }
                }
            }
            shared.emit_changed(keys, ChangeOrigin::Remote);
            for e in malformed {
                shared.report(format!("Dropped update: {}", e));
            }
            false
        }
        Payload::Ack { ids, changes } => {
            let mut keys = Vec::new();
            {
                let mut store = shared.store.lock();
                for id in &ids {
                    let authoritative = changes.iter().find(|c| c.id.as_deref() == Some(id));
                    if let Some((key, true)) = store.acknowledge(id, authoritative) {
                        keys.push(key);
                    }
                }
            }
            shared.emit_changed(keys, ChangeOrigin::Remote);
            shared.emit(TableEvent::Acknowledged { ids });
            false
        }
        Payload::Error { id, message } => {
            warn!("Write {} rejected: {}", id, message);
            let rejected = shared.store.lock().reject(&id, &message);
            let key = rejected.as_ref().map(|(key, _)| key.clone());
            if let Some((key, true)) = rejected {
                shared.emit_changed(vec![key], ChangeOrigin::Rollback);
            }
            shared.emit(TableEvent::Rejected { id, key, message });
            false
        }
        Payload::Close => false,
        other => {
            shared.report(format!("Unexpected {} from server", other.cmd()));
            false
        }
    }
}

/// Send every pending write in one batch; false if the channel refused it
fn flush(shared: &Shared, channel: &Channel) -> bool {
    let mut store = shared.store.lock();
    let changes = store.pending_changes(shared.client.server_time());
    if changes.is_empty() {
        return true;
    }
    let count = changes.len();
    if channel.write(Payload::Set { changes }) {
        store.mark_flushed();
        debug!("Flushed {} writes for {}", count, shared.query.table());
        true
    } else {
        debug!("Write queue full, retrying flush for {}", shared.query.table());
        false
    }
}
