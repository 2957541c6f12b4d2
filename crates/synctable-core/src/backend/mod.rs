//! In-memory changefeed backend
//!
//! The server half of the channel protocol, backed by tables held in memory.
//! Serves any number of physical connections and keeps, per subscribed
//! channel, the query it asked for so changes can be pushed to exactly the
//! channels whose result set they touch.
//!
//! Every frame for a connection goes through that connection's ordered
//! outbound queue, filled while the backend lock is held. A subscriber can
//! therefore never see an update that predates its snapshot.

mod websocket;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::Multiplexer;
use crate::error::SyncResult;
use crate::protocol::{Frame, Payload};
use crate::query::{compare_values, declared_primary_keys, has_option, limit, order_by};
use crate::query::{Query, QueryOption, Schema};
use crate::record::{key_fields, merge_into, Record, RowKey, VersionedChange};
use crate::transport::Transport;

pub use websocket::serve_websocket;

/// Inspects (and may rewrite) a record before it is stored
///
/// Called with the table name and the incoming partial record. `Ok(None)`
/// accepts it unchanged, `Ok(Some(record))` stores `record` instead and
/// `Err(message)` rejects the write.
pub type Validator = Arc<dyn Fn(&str, &Record) -> Result<Option<Record>, String> + Send + Sync>;

/// How many applied write ids are remembered for deduplication
const APPLIED_MEMORY: usize = 4096;

/// How many incoming writes `received_writes` keeps
const RECEIVED_MEMORY: usize = 1024;

type ConnId = u64;

struct StoredTable {
    primary_keys: Vec<String>,
    rows: BTreeMap<RowKey, (Record, u64)>,
}

/// The query a channel asked for
struct ChannelQuery {
    query: Query,
    primary_keys: Vec<String>,
    changefeed: bool,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelQuery {
    fn push(&self, channel: &str, payload: Payload) {
        push(&self.outbound, channel, payload);
    }
}

fn push(queue: &mpsc::UnboundedSender<Vec<u8>>, channel: &str, payload: Payload) {
    match Frame::new(channel, payload).encode() {
        Ok(bytes) => {
            // A closed queue means the connection is going away
            let _ = queue.send(bytes);
        }
        Err(e) => warn!("Dropping unencodable frame for {}: {}", channel, e),
    }
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<String, StoredTable>,
    version: u64,
    channels: HashMap<(ConnId, String), ChannelQuery>,
    /// Authoritative change per recently applied write id
    applied: HashMap<String, VersionedChange>,
    applied_order: VecDeque<String>,
    received: VecDeque<VersionedChange>,
}

struct BackendInner {
    schema: Schema,
    state: Mutex<BackendState>,
    validator: RwLock<Option<Validator>>,
    next_conn: AtomicU64,
}

/// Changefeed server over in-memory tables
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Schema::new())
    }
}

impl MemoryBackend {
    /// `schema` names the primary key of each table; others use `id`
    pub fn new(schema: Schema) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                schema,
                state: Mutex::new(BackendState::default()),
                validator: RwLock::new(None),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_validator<F>(&self, validator: F)
    where
        F: Fn(&str, &Record) -> Result<Option<Record>, String> + Send + Sync + 'static,
    {
        *self.inner.validator.write() = Some(Arc::new(validator));
    }

    /// Serve one physical connection until its inbound side ends
    ///
    /// Must be called from within a tokio runtime.
    pub fn serve(&self, transport: Transport) -> JoinHandle<()> {
        let conn = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let Transport {
            outbound,
            mut inbound,
        } = transport;

        // Ordered per-connection queue, drained into the bounded transport
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = queue_rx.recv().await {
                if outbound.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            debug!("Connection {} opened", conn);
            while let Some(bytes) = inbound.recv().await {
                match Frame::decode(&bytes) {
                    Ok(frame) => inner.handle(conn, frame, &queue_tx),
                    Err(e) => warn!("Connection {}: dropping malformed frame: {}", conn, e),
                }
            }
            inner.drop_connection(conn);
            drop(queue_tx);
            writer.await.ok();
            debug!("Connection {} closed", conn);
        })
    }

    /// Attach a fresh in-memory connection to `mux` and serve it
    pub fn connect(&self, mux: &Multiplexer, buffer: usize) -> JoinHandle<()> {
        let (client_end, server_end) = Transport::pair(buffer);
        mux.attach(client_end);
        self.serve(server_end)
    }

    /// Insert or merge a row as a server-side change; returns its version
    pub fn upsert(&self, table: &str, record: Record) -> SyncResult<u64> {
        let mut state = self.inner.state.lock();
        let primary_keys = self.inner.table_keys(&state, table, None);
        let key = RowKey::from_record(&record, &primary_keys)?;
        let version = state.apply(table, &primary_keys, &key, &record, false);
        state.fan_out(table, &key, version, None);
        Ok(version)
    }

    /// Delete a row as a server-side change; returns the version, if it existed
    pub fn delete(&self, table: &str, key: &Record) -> SyncResult<Option<u64>> {
        let mut state = self.inner.state.lock();
        let primary_keys = self.inner.table_keys(&state, table, None);
        let row = RowKey::from_record(key, &primary_keys)?;
        let exists = state
            .tables
            .get(table)
            .is_some_and(|t| t.rows.contains_key(&row));
        if !exists {
            return Ok(None);
        }
        let version = state.apply(table, &primary_keys, &row, key, true);
        state.fan_out(table, &row, version, None);
        Ok(Some(version))
    }

    /// Current rows of `table`, in key order
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().map(|(row, _)| row.clone()).collect())
            .unwrap_or_default()
    }

    /// The most recent writes received from clients, duplicates included
    pub fn received_writes(&self) -> Vec<VersionedChange> {
        self.inner.state.lock().received.iter().cloned().collect()
    }

    /// Channels with a live changefeed
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .filter(|c| c.changefeed)
            .count()
    }

    /// Highest version assigned so far
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }
}

impl BackendInner {
    /// Primary key of `table`: as stored, else as declared by a query, else the schema's
    fn table_keys(&self, state: &BackendState, table: &str, declared: Option<Vec<String>>) -> Vec<String> {
        if let Some(stored) = state.tables.get(table) {
            return stored.primary_keys.clone();
        }
        declared.unwrap_or_else(|| {
            self.schema
                .primary_keys(&Query::new(table, Record::new()), &[])
        })
    }

    fn handle(&self, conn: ConnId, frame: Frame, queue: &mpsc::UnboundedSender<Vec<u8>>) {
        let Frame { channel, payload } = frame;
        match payload {
            Payload::Query { query, options } => self.on_query(conn, channel, query, options, queue),
            Payload::Set { changes } => self.on_set(conn, &channel, changes, queue),
            Payload::Close => {
                if self.state.lock().channels.remove(&(conn, channel.clone())).is_some() {
                    debug!("Connection {}: channel {} closed", conn, channel);
                }
            }
            other => warn!(
                "Connection {}: unexpected {} on {}",
                conn,
                other.cmd(),
                channel
            ),
        }
    }

    fn on_query(
        &self,
        conn: ConnId,
        channel: String,
        query: Query,
        options: Vec<QueryOption>,
        queue: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let mut state = self.state.lock();
        let primary_keys =
            self.table_keys(&state, query.table(), declared_primary_keys(&options));
        state
            .tables
            .entry(query.table().to_string())
            .or_insert_with(|| StoredTable {
                primary_keys: primary_keys.clone(),
                rows: BTreeMap::new(),
            });

        let rows = state.select(&query, &options, &primary_keys);
        let changefeed = !has_option(&options, &QueryOption::NoChangefeed);
        debug!(
            "Connection {}: {} rows for {} on {}{}",
            conn,
            rows.len(),
            query.table(),
            channel,
            if changefeed { "" } else { " (no changefeed)" }
        );

        let subscription = ChannelQuery {
            query,
            primary_keys,
            changefeed,
            outbound: queue.clone(),
        };
        subscription.push(
            &channel,
            Payload::Snapshot {
                rows,
                server_time: Utc::now(),
            },
        );
        state.channels.insert((conn, channel), subscription);
    }

    fn on_set(
        &self,
        conn: ConnId,
        channel: &str,
        changes: Vec<VersionedChange>,
        queue: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let validator = self.validator.read().clone();
        let mut state = self.state.lock();
        let origin = (conn, channel.to_string());

        let Some((table, query, primary_keys)) = state
            .channels
            .get(&origin)
            .map(|c| (c.query.table().to_string(), c.query.clone(), c.primary_keys.clone()))
        else {
            for change in changes {
                push(
                    queue,
                    channel,
                    Payload::Error {
                        id: change.id.unwrap_or_default(),
                        message: "no query on this channel".to_string(),
                    },
                );
            }
            return;
        };

        let mut acked = Vec::new();
        let mut authoritative = Vec::new();
        let mut errors = Vec::new();

        for change in changes {
            state.remember_received(&change);
            let Some(id) = change.id.clone() else {
                errors.push((String::new(), "write is missing its id".to_string()));
                continue;
            };

            // Replayed write: acknowledge again, apply nothing
            if let Some(previous) = state.applied.get(&id) {
                debug!("Connection {}: duplicate write {}", conn, id);
                acked.push(id);
                authoritative.push(previous.clone());
                continue;
            }

            match state.write(&table, &primary_keys, &query, change, validator.as_ref()) {
                Ok((key, applied)) => {
                    state.fan_out(&table, &key, applied.version, Some(&origin));
                    state.remember_applied(&id, &applied);
                    acked.push(id);
                    authoritative.push(applied);
                }
                Err(message) => errors.push((id, message)),
            }
        }

        let Some(reply) = state.channels.get(&origin) else {
            return;
        };
        if !acked.is_empty() {
            reply.push(
                channel,
                Payload::Ack {
                    ids: acked,
                    changes: authoritative,
                },
            );
        }
        for (id, message) in errors {
            info!("Connection {}: rejected write {}: {}", conn, id, message);
            reply.push(channel, Payload::Error { id, message });
        }
    }

    fn drop_connection(&self, conn: ConnId) {
        let mut state = self.state.lock();
        let before = state.channels.len();
        state.channels.retain(|(c, _), _| *c != conn);
        debug!(
            "Connection {}: released {} channels",
            conn,
            before - state.channels.len()
        );
    }
}

impl BackendState {
    fn remember_received(&mut self, change: &VersionedChange) {
        self.received.push_back(change.clone());
        while self.received.len() > RECEIVED_MEMORY {
            self.received.pop_front();
        }
    }

    /// Oldest ids fall out once the window is full; clients replay within seconds
    fn remember_applied(&mut self, id: &str, applied: &VersionedChange) {
        if self.applied.insert(id.to_string(), applied.clone()).is_none() {
            self.applied_order.push_back(id.to_string());
        }
        while self.applied_order.len() > APPLIED_MEMORY {
            if let Some(oldest) = self.applied_order.pop_front() {
                self.applied.remove(&oldest);
            }
        }
    }

    /// Result set of `query`: filtered, ordered, limited and projected
    fn select(
        &self,
        query: &Query,
        options: &[QueryOption],
        primary_keys: &[String],
    ) -> Vec<VersionedChange> {
        let Some(table) = self.tables.get(query.table()) else {
            return Vec::new();
        };
        let mut rows: Vec<&(Record, u64)> = table
            .rows
            .values()
            .filter(|(row, _)| query.matches(row))
            .collect();

        if let Some(field) = order_by(options) {
            let (field, descending) = match field.strip_prefix('-') {
                Some(field) => (field, true),
                None => (field, false),
            };
            rows.sort_by(|(a, _), (b, _)| {
                let ordering = compare_values(a.get(field), b.get(field));
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(n) = limit(options) {
            rows.truncate(usize::try_from(n).unwrap_or(usize::MAX));
        }

        rows.into_iter()
            .map(|(row, version)| VersionedChange::new(query.project(row, primary_keys), *version))
            .collect()
    }

    /// Validate and apply one client write; the authoritative change on success
    fn write(
        &mut self,
        table: &str,
        primary_keys: &[String],
        query: &Query,
        change: VersionedChange,
        validator: Option<&Validator>,
    ) -> Result<(RowKey, VersionedChange), String> {
        let id = change.id.clone().unwrap_or_default();
        let mut record = change.record;
        if !change.deleted {
            if let Some(validator) = validator {
                if let Some(rewritten) = validator(table, &record)? {
                    record = rewritten;
                }
            }
        }
        let key = RowKey::from_record(&record, primary_keys).map_err(|e| e.to_string())?;
        let version = self.apply(table, primary_keys, &key, &record, change.deleted);

        let applied = match self.tables.get(table).and_then(|t| t.rows.get(&key)) {
            Some((row, _)) => VersionedChange::new(query.project(row, primary_keys), version),
            None => VersionedChange::deletion(key_fields(&record, primary_keys), version),
        };
        Ok((key, applied.with_id(id)))
    }

    /// Store a change under a fresh version
    fn apply(
        &mut self,
        table: &str,
        primary_keys: &[String],
        key: &RowKey,
        record: &Record,
        deleted: bool,
    ) -> u64 {
        self.version += 1;
        let version = self.version;
        let stored = self
            .tables
            .entry(table.to_string())
            .or_insert_with(|| StoredTable {
                primary_keys: primary_keys.to_vec(),
                rows: BTreeMap::new(),
            });

        if deleted {
            stored.rows.remove(key);
        } else {
            match stored.rows.get_mut(key) {
                Some((row, row_version)) => {
                    merge_into(row, record);
                    *row_version = version;
                }
                None => {
                    stored.rows.insert(key.clone(), (record.clone(), version));
                }
            }
        }
        version
    }

    /// Push the current state of one row to every changefeed on its table
    ///
    /// A channel whose filter the row no longer matches receives a deletion.
    fn fan_out(&self, table: &str, key: &RowKey, version: u64, origin: Option<&(ConnId, String)>) {
        let row = self
            .tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .map(|(row, _)| row);

        for ((conn, channel), sub) in &self.channels {
            if !sub.changefeed || sub.query.table() != table {
                continue;
            }
            if origin.is_some_and(|(c, name)| c == conn && name == channel) {
                continue;
            }
            let change = match row {
                Some(row) if sub.query.matches(row) => {
                    VersionedChange::new(sub.query.project(row, &sub.primary_keys), version)
                }
                Some(row) => VersionedChange::deletion(key_fields(row, &sub.primary_keys), version),
                None => match key_record(key, &sub.primary_keys) {
                    Some(fields) => VersionedChange::deletion(fields, version),
                    None => continue,
                },
            };
            sub.push(channel, Payload::Update { changes: vec![change] });
        }
    }
}

/// Rebuild the primary-key fields of a deleted row from its key
fn key_record(key: &RowKey, primary_keys: &[String]) -> Option<Record> {
    let values: Vec<serde_json::Value> = serde_json::from_str(key.as_str()).ok()?;
    if values.len() != primary_keys.len() {
        return None;
    }
    Some(primary_keys.iter().cloned().zip(values).collect())
}
