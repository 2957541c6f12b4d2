//! Purely local table

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::{ChangeOrigin, Rows, SyncState, Table, TableEvent, TableOptions, TableStore};
use crate::error::{SyncError, SyncResult};
use crate::query::{Query, QueryKey, QueryOption, Schema};
use crate::record::{Record, RowKey};

/// A table with no backend; writes are confirmed as soon as they are made
pub struct NoDatabaseTable {
    query: Query,
    key: QueryKey,
    primary_keys: Vec<String>,
    store: Mutex<TableStore>,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<TableEvent>,
}

impl NoDatabaseTable {
    pub fn new(
        query: Query,
        options: Vec<QueryOption>,
        schema: &Schema,
        client_id: &str,
        table_options: &TableOptions,
    ) -> Self {
        let key = QueryKey::new(&query, &options);
        let primary_keys = schema.primary_keys(&query, &options);
        let (state, _) = watch::channel(SyncState::Synced);
        let (events, _) = broadcast::channel(table_options.event_capacity.max(1));
        Self {
            store: Mutex::new(TableStore::new(primary_keys.clone(), client_id)),
            query,
            key,
            primary_keys,
            state,
            events,
        }
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if *self.state.borrow() == SyncState::Closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Apply the queued write immediately, as if a server had accepted it
    fn commit(&self, store: &mut TableStore) {
        let ids = store.outstanding_ids();
        store.mark_flushed();
        for id in &ids {
            store.acknowledge(id, None);
        }
    }
}

#[async_trait]
impl Table for NoDatabaseTable {
    fn query(&self) -> &Query {
        &self.query
    }

    fn query_key(&self) -> &QueryKey {
        &self.key
    }

    fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    fn get(&self) -> Rows {
        self.store.lock().visible().clone()
    }

    fn get_one(&self, key: &Record) -> Option<Record> {
        self.store.lock().get_one(key)
    }

    fn set(&self, partial: Record) -> SyncResult<RowKey> {
        self.ensure_open()?;
        let (key, changed) = {
            let mut store = self.store.lock();
            let result = store.set(partial)?;
            self.commit(&mut store);
            result
        };
        if changed {
            let _ = self.events.send(TableEvent::Changed {
                keys: vec![key.clone()],
                origin: ChangeOrigin::Local,
            });
        }
        Ok(key)
    }

    fn delete(&self, key: &Record) -> SyncResult<RowKey> {
        self.ensure_open()?;
        let (row, changed) = {
            let mut store = self.store.lock();
            let result = store.delete(key)?;
            self.commit(&mut store);
            result
        };
        if changed {
            let _ = self.events.send(TableEvent::Changed {
                keys: vec![row.clone()],
                origin: ChangeOrigin::Local,
            });
        }
        Ok(row)
    }

    async fn save_cancellable(&self, _cancel: &CancellationToken) -> SyncResult<()> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.state.send_replace(SyncState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn table() -> NoDatabaseTable {
        let query = Query::parse(r#"{"scratch": [{"id": null, "text": null}]}"#).unwrap();
        NoDatabaseTable::new(
            query,
            vec![QueryOption::Ephemeral],
            &Schema::new(),
            "local",
            &TableOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_local_writes_are_final() {
        let table = table();
        assert_eq!(table.state(), SyncState::Synced);

        table.set(record(json!({"id": "a", "text": "hi"}))).unwrap();
        table.set(record(json!({"id": "b", "text": "yo"}))).unwrap();
        table.delete(&record(json!({"id": "b"}))).unwrap();

        assert_eq!(table.get().len(), 1);
        assert_eq!(
            table.get_one(&record(json!({"id": "a"}))),
            Some(record(json!({"id": "a", "text": "hi"})))
        );
        table.save().await.unwrap();
        assert!(table.store.lock().outstanding_ids().is_empty());
    }

    #[tokio::test]
    async fn test_wait_sees_later_write() {
        let table = std::sync::Arc::new(table());
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .wait(
                        &|rows: &Rows| rows.len() == 2,
                        Duration::from_secs(5),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        table.set(record(json!({"id": 1}))).unwrap();
        table.set(record(json!({"id": 2}))).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_can_time_out_or_be_cancelled() {
        let table = table();
        let never = |_: &Rows| false;

        let result = table
            .wait(&never, Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(SyncError::Timeout(Duration::from_millis(20))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = table.wait(&never, Duration::from_secs(5), &cancel).await;
        assert_eq!(result, Err(SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_table_refuses_writes() {
        let table = table();
        table.close().await;
        table.close().await;
        assert_eq!(table.state(), SyncState::Closed);
        assert_eq!(
            table.set(record(json!({"id": 1}))),
            Err(SyncError::Closed)
        );
        assert_eq!(table.save().await, Err(SyncError::Closed));
    }
}
