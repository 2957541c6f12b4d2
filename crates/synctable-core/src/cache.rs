//! Process-wide table cache
//!
//! Deduplicates live tables by [`QueryKey`]. Every [`TableCache::synctable`]
//! call takes a reference; every [`CachedTable::close`] gives one back. When
//! the last reference is returned the entry is evicted and the table closed.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::SyncResult;
use crate::query::{Query, QueryKey, QueryOption, Schema};
use crate::table::{self, Table, TableOptions};

struct Entry {
    cell: Arc<OnceCell<Arc<dyn Table>>>,
    refs: usize,
    /// Distinguishes an entry from a later one under the same key
    generation: u64,
}

/// Refcounted cache of live tables
pub struct TableCache {
    schema: Schema,
    options: TableOptions,
    entries: Mutex<HashMap<QueryKey, Entry>>,
    next_generation: AtomicU64,
    created: AtomicUsize,
}

impl TableCache {
    pub fn new(schema: Schema, options: TableOptions) -> Arc<Self> {
        Arc::new(Self {
            schema,
            options,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            created: AtomicUsize::new(0),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the live table for `query`, creating it on first use
    ///
    /// Concurrent first requests for the same key share one creation. If
    /// creation fails the entry is dropped so the next request tries again.
    pub async fn synctable(
        self: &Arc<Self>,
        query: Query,
        options: Vec<QueryOption>,
        client: Arc<dyn Client>,
    ) -> SyncResult<CachedTable> {
        let key = QueryKey::new(&query, &options);
        let (cell, claim) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                refs: 0,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            });
            entry.refs += 1;
            let claim = Claim {
                cache: self.clone(),
                key: key.clone(),
                generation: entry.generation,
                held: true,
            };
            (entry.cell.clone(), claim)
        };

        // Dropping this future (or failing) gives the reference back via `claim`
        let table = cell
            .get_or_try_init(|| async {
                let table = table::open(
                    query,
                    options,
                    &self.schema,
                    client,
                    self.options.clone(),
                )
                .await?;
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!("Created table for {}", key);
                Ok::<_, crate::error::SyncError>(table)
            })
            .await
            .map_err(|e| {
                warn!("Creating table for {} failed: {}", key, e);
                e
            })?;

        Ok(claim.into_handle(table.clone()))
    }

    /// Number of cached tables
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tables created over the cache's lifetime
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Current reference count for a key
    pub fn refs(&self, key: &QueryKey) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.refs)
    }

    /// Give back one reference; the table to close if it was the last
    fn release(&self, key: &QueryKey, generation: u64) -> Option<Arc<dyn Table>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.generation != generation {
            return None;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        let entry = entries.remove(key)?;
        debug!("Evicting table for {}", key);
        entry.cell.get().cloned()
    }
}

/// A reference taken on an entry, not yet owned by a handle
struct Claim {
    cache: Arc<TableCache>,
    key: QueryKey,
    generation: u64,
    held: bool,
}

impl Claim {
    fn into_handle(mut self, table: Arc<dyn Table>) -> CachedTable {
        self.held = false;
        CachedTable {
            table,
            cache: self.cache.clone(),
            key: self.key.clone(),
            generation: self.generation,
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.held {
            if let Some(table) = self.cache.release(&self.key, self.generation) {
                close_in_background(table, &self.key);
            }
        }
    }
}

/// A counted handle to a cached table
///
/// Derefs to the table. Call [`CachedTable::close`] when done; dropping the
/// handle releases it too.
pub struct CachedTable {
    table: Arc<dyn Table>,
    cache: Arc<TableCache>,
    key: QueryKey,
    generation: u64,
    released: AtomicBool,
}

impl CachedTable {
    /// Give back this handle's reference; idempotent
    ///
    /// The table itself closes once every handle is released.
    pub async fn close(&self) {
        if let Some(table) = self.release() {
            table.close().await;
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Whether two handles share one table
    pub fn same_table(&self, other: &CachedTable) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.table) as *const (),
            Arc::as_ptr(&other.table) as *const (),
        )
    }

    fn release(&self) -> Option<Arc<dyn Table>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.cache.release(&self.key, self.generation)
    }
}

impl Deref for CachedTable {
    type Target = dyn Table;

    fn deref(&self) -> &Self::Target {
        self.table.as_ref()
    }
}

impl Drop for CachedTable {
    fn drop(&mut self) {
        if let Some(table) = self.release() {
            close_in_background(table, &self.key);
        }
    }
}

fn close_in_background(table: Arc<dyn Table>, key: &QueryKey) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { table.close().await });
        }
        Err(_) => debug!("No runtime to close table for {}", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Multiplexer;
    use crate::client::MuxClient;
    use crate::table::SyncState;
    use crate::transport::Transport;
    use serde_json::json;
    use std::time::Duration;

    fn client() -> Arc<dyn Client> {
        Arc::new(MuxClient::new(Multiplexer::new()))
    }

    fn scratch() -> Query {
        Query::parse(r#"{"scratch": [{"id": null}]}"#).unwrap()
    }

    #[tokio::test]
    async fn test_refcounting() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        let client = client();
        let options = vec![QueryOption::Ephemeral];

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(
                cache
                    .synctable(scratch(), options.clone(), client.clone())
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(cache.created(), 1);
        assert!(handles[0].same_table(&handles[2]));
        assert_eq!(cache.refs(handles[0].key()), 3);

        handles[0].set(json!({"id": 1}).as_object().cloned().unwrap()).unwrap();
        assert_eq!(handles[1].get().len(), 1);

        let mut state = handles[0].watch_state();
        for handle in &handles[..2] {
            handle.close().await;
            handle.close().await;
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(*state.borrow_and_update(), SyncState::Synced);

        handles[2].close().await;
        assert!(cache.is_empty());
        assert_eq!(*state.borrow(), SyncState::Closed);

        // A fresh request builds a new table
        let again = cache.synctable(scratch(), options, client).await.unwrap();
        assert_eq!(cache.created(), 2);
        assert!(again.get().is_empty());
    }

    #[tokio::test]
    async fn test_option_order_makes_a_different_key() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        let client = client();
        let a = cache
            .synctable(
                scratch(),
                vec![QueryOption::Ephemeral, QueryOption::Limit(5)],
                client.clone(),
            )
            .await
            .unwrap();
        let b = cache
            .synctable(
                scratch(),
                vec![QueryOption::Limit(5), QueryOption::Ephemeral],
                client,
            )
            .await
            .unwrap();
        assert!(!a.same_table(&b));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_creation_is_evicted() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        // Offline client: the one-shot query fails
        let result = cache
            .synctable(scratch(), vec![QueryOption::NoChangefeed], client())
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.created(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_gives_back_its_reference() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        // Online, but the peer never answers the one-shot query
        let mux = Multiplexer::new();
        let (ours, _silent_peer) = Transport::pair(8);
        mux.attach(ours);
        let client: Arc<dyn Client> = Arc::new(MuxClient::new(mux));

        let options = vec![QueryOption::NoChangefeed];
        let key = QueryKey::new(&scratch(), &options);
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            cache.synctable(scratch(), options, client),
        )
        .await;

        assert!(pending.is_err());
        assert_eq!(cache.refs(&key), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.created(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_table() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        let client = client();
        let options = vec![QueryOption::Ephemeral];

        let (a, b) = tokio::join!(
            cache.synctable(scratch(), options.clone(), client.clone()),
            cache.synctable(scratch(), options.clone(), client.clone()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(cache.created(), 1);
        assert!(a.same_table(&b));
        assert_eq!(cache.refs(a.key()), 2);
    }

    #[tokio::test]
    async fn test_drop_releases_reference() {
        let cache = TableCache::new(Schema::new(), TableOptions::default());
        let handle = cache
            .synctable(scratch(), vec![QueryOption::Ephemeral], client())
            .await
            .unwrap();
        drop(handle);
        assert!(cache.is_empty());
    }
}
