//! Reconciliation state shared by every table variant
//!
//! Three layers per row:
//!
//! - **confirmed**: what the server last said, with the version it said it at
//! - **in-flight**: writes sent and not yet acknowledged, in send order
//! - **pending**: at most one coalesced write per row, not yet sent
//!
//! The visible view is confirmed overlaid with in-flight then pending, so an
//! update from the server never erases an unacknowledged local edit.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::record::{key_fields, merge_into, Record, RowKey, VersionedChange};

/// Visible rows of a table, keyed by row
pub type Rows = BTreeMap<RowKey, Record>;

/// Outcome of [`TableStore::apply_snapshot`]
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Keys whose visible row changed
    pub changed: Vec<RowKey>,
    /// Rows left out, one error each
    pub skipped: Vec<SyncError>,
}

/// How many rejected write ids are remembered for `save`
const REJECTION_MEMORY: usize = 256;

/// A local write, pending or in flight
#[derive(Debug, Clone, PartialEq)]
struct Write {
    id: String,
    /// Ids of older writes folded into this one
    absorbed: Vec<String>,
    key: RowKey,
    record: Record,
    deleted: bool,
}

impl Write {
    fn carries(&self, id: &str) -> bool {
        self.id == id || self.absorbed.iter().any(|a| a == id)
    }

    fn ids(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.id).chain(self.absorbed.iter())
    }

    /// Fold `newer` on top of this write; the result takes the newer id
    fn absorb(self, newer: Write) -> Write {
        let mut absorbed = self.absorbed;
        absorbed.push(self.id);
        absorbed.extend(newer.absorbed);

        let record = if newer.deleted || self.deleted {
            newer.record
        } else {
            let mut record = self.record;
            merge_into(&mut record, &newer.record);
            record
        };
        Write {
            id: newer.id,
            absorbed,
            key: newer.key,
            record,
            deleted: newer.deleted,
        }
    }

    fn apply_to(&self, row: Option<Record>) -> Option<Record> {
        if self.deleted {
            return None;
        }
        match row {
            Some(mut row) => {
                merge_into(&mut row, &self.record);
                Some(row)
            }
            None => Some(self.record.clone()),
        }
    }
}

/// Confirmed, in-flight and pending state of one table
#[derive(Debug)]
pub struct TableStore {
    primary_keys: Vec<String>,
    client_id: String,
    next_write: u64,
    confirmed: BTreeMap<RowKey, Record>,
    versions: HashMap<RowKey, u64>,
    inflight: Vec<Write>,
    pending: BTreeMap<RowKey, Write>,
    visible: Rows,
    rejections: VecDeque<(String, String)>,
}

impl TableStore {
    /// Empty store; write ids are `<client_id>:<n>`
    pub fn new(primary_keys: Vec<String>, client_id: impl Into<String>) -> Self {
        Self {
            primary_keys,
            client_id: client_id.into(),
            next_write: 1,
            confirmed: BTreeMap::new(),
            versions: HashMap::new(),
            inflight: Vec::new(),
            pending: BTreeMap::new(),
            visible: BTreeMap::new(),
            rejections: VecDeque::new(),
        }
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn key_of(&self, record: &Record) -> SyncResult<RowKey> {
        RowKey::from_record(record, &self.primary_keys)
    }

    pub fn visible(&self) -> &Rows {
        &self.visible
    }

    pub fn confirmed(&self) -> &BTreeMap<RowKey, Record> {
        &self.confirmed
    }

    pub fn get_one(&self, key: &Record) -> Option<Record> {
        let key = self.key_of(key).ok()?;
        self.visible.get(&key).cloned()
    }

    /// Version last applied for a row
    pub fn version(&self, key: &RowKey) -> Option<u64> {
        self.versions.get(key).copied()
    }

    /// Optimistically merge `partial` into its row; true if the visible row changed
    pub fn set(&mut self, partial: Record) -> SyncResult<(RowKey, bool)> {
        let key = self.key_of(&partial)?;
        let write = match self.pending.remove(&key) {
            Some(mut existing) => {
                if existing.deleted {
                    existing.record = partial;
                    existing.deleted = false;
                } else {
                    merge_into(&mut existing.record, &partial);
                }
                existing
            }
            None => Write {
                id: self.write_id(),
                absorbed: Vec::new(),
                key: key.clone(),
                record: partial,
                deleted: false,
            },
        };
        self.pending.insert(key.clone(), write);
        let changed = self.refresh(&key);
        Ok((key, changed))
    }

    /// Optimistically remove the row identified by `key`
    pub fn delete(&mut self, key: &Record) -> SyncResult<(RowKey, bool)> {
        let row = self.key_of(key)?;
        let record = key_fields(key, &self.primary_keys);
        let id = match self.pending.remove(&row) {
            Some(existing) => existing.id,
            None => self.write_id(),
        };
        self.pending.insert(
            row.clone(),
            Write {
                id,
                absorbed: Vec::new(),
                key: row.clone(),
                record,
                deleted: true,
            },
        );
        let changed = self.refresh(&row);
        Ok((row, changed))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_inflight(&self) -> bool {
        !self.inflight.is_empty()
    }

    /// Ids of every write not yet acknowledged or rejected
    pub fn outstanding_ids(&self) -> Vec<String> {
        self.inflight
            .iter()
            .chain(self.pending.values())
            .flat_map(|w| w.ids().cloned())
            .collect()
    }

    pub fn is_outstanding(&self, id: &str) -> bool {
        self.inflight
            .iter()
            .chain(self.pending.values())
            .any(|w| w.carries(id))
    }

    /// Why the server rejected `id`, if it recently did
    pub fn rejection(&self, id: &str) -> Option<&str> {
        self.rejections
            .iter()
            .find(|(rejected, _)| rejected == id)
            .map(|(_, message)| message.as_str())
    }

    /// Pending writes as they go on the wire, stamped with `now`
    pub fn pending_changes(&self, now: DateTime<Utc>) -> Vec<VersionedChange> {
        self.pending
            .values()
            .map(|w| VersionedChange {
                id: Some(w.id.clone()),
                record: w.record.clone(),
                version: 0,
                deleted: w.deleted,
                time: Some(now),
            })
            .collect()
    }

    /// Move every pending write to in-flight, after a successful send
    pub fn mark_flushed(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.inflight.extend(pending.into_values());
    }

    /// Return in-flight writes to the pending queue after a lost connection
    ///
    /// Pending fields are newer and win over in-flight fields of the same row.
    pub fn requeue_inflight(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        let mut requeued: BTreeMap<RowKey, Write> = BTreeMap::new();
        for write in std::mem::take(&mut self.inflight) {
            let merged = match requeued.remove(&write.key) {
                Some(older) => older.absorb(write),
                None => write,
            };
            requeued.insert(merged.key.clone(), merged);
        }
        for (key, newer) in std::mem::take(&mut self.pending) {
            let merged = match requeued.remove(&key) {
                Some(older) => older.absorb(newer),
                None => newer,
            };
            requeued.insert(key, merged);
        }
        debug!("Requeued {} writes", requeued.len());
        self.pending = requeued;
    }

    /// Replace confirmed state with a full result set
    ///
    /// Rows without a usable primary key are left out and reported in
    /// [`Snapshot::skipped`].
    pub fn apply_snapshot(&mut self, rows: Vec<VersionedChange>) -> Snapshot {
        self.confirmed.clear();
        self.versions.clear();
        let mut skipped = Vec::new();
        for change in rows {
            if change.deleted {
                continue;
            }
            match self.key_of(&change.record) {
                Ok(key) => {
                    self.versions.insert(key.clone(), change.version);
                    self.confirmed.insert(key, change.record);
                }
                Err(e) => skipped.push(e),
            }
        }
        Snapshot {
            changed: self.rebuild(),
            skipped,
        }
    }

    /// Apply one server change unless an equal or newer version was already
    /// applied; returns the key if the visible row changed
    ///
    /// Fails with `InvalidRecord` if the change has no usable primary key.
    pub fn apply_change(&mut self, change: &VersionedChange) -> SyncResult<Option<RowKey>> {
        let key = self.key_of(&change.record)?;
        if !self.apply_confirmed(&key, change) {
            return Ok(None);
        }
        Ok(self.refresh(&key).then_some(key))
    }

    /// Settle an in-flight write the server accepted
    ///
    /// `authoritative` is the row as the server stored it. Returns the row key
    /// and whether the visible row changed; `None` for unknown ids.
    pub fn acknowledge(
        &mut self,
        id: &str,
        authoritative: Option<&VersionedChange>,
    ) -> Option<(RowKey, bool)> {
        let pos = self.inflight.iter().position(|w| w.id == id)?;
        let write = self.inflight.remove(pos);

        match authoritative {
            Some(change) => {
                self.apply_confirmed(&write.key, change);
            }
            None => {
                let row = write.apply_to(self.confirmed.remove(&write.key));
                if let Some(row) = row {
                    self.confirmed.insert(write.key.clone(), row);
                }
            }
        }
        let changed = self.refresh(&write.key);
        Some((write.key, changed))
    }

    /// Drop a write the server refused and roll its row back
    pub fn reject(&mut self, id: &str, message: &str) -> Option<(RowKey, bool)> {
        let write = match self.inflight.iter().position(|w| w.carries(id)) {
            Some(pos) => self.inflight.remove(pos),
            None => {
                let key = self
                    .pending
                    .iter()
                    .find(|(_, w)| w.carries(id))
                    .map(|(k, _)| k.clone())?;
                self.pending.remove(&key)?
            }
        };
        for rejected in write.ids() {
            self.rejections
                .push_back((rejected.clone(), message.to_string()));
        }
        while self.rejections.len() > REJECTION_MEMORY {
            self.rejections.pop_front();
        }
        let changed = self.refresh(&write.key);
        Some((write.key, changed))
    }

    fn write_id(&mut self) -> String {
        let id = format!("{}:{}", self.client_id, self.next_write);
        self.next_write += 1;
        id
    }

    fn apply_confirmed(&mut self, key: &RowKey, change: &VersionedChange) -> bool {
        if let Some(applied) = self.versions.get(key) {
            if change.version <= *applied {
                return false;
            }
        }
        self.versions.insert(key.clone(), change.version);
        if change.deleted {
            self.confirmed.remove(key);
        } else {
            match self.confirmed.get_mut(key) {
                Some(row) => merge_into(row, &change.record),
                None => {
                    self.confirmed.insert(key.clone(), change.record.clone());
                }
            }
        }
        true
    }

    fn overlay(&self, key: &RowKey) -> Option<Record> {
        let mut row = self.confirmed.get(key).cloned();
        for write in self.inflight.iter().filter(|w| &w.key == key) {
            row = write.apply_to(row);
        }
        if let Some(write) = self.pending.get(key) {
            row = write.apply_to(row);
        }
        row
    }

    /// Recompute one visible row; true if it changed
    fn refresh(&mut self, key: &RowKey) -> bool {
        match self.overlay(key) {
            Some(row) => match self.visible.insert(key.clone(), row.clone()) {
                Some(old) => old != row,
                None => true,
            },
            None => self.visible.remove(key).is_some(),
        }
    }

    fn rebuild(&mut self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self.confirmed.keys().cloned().collect();
        keys.extend(self.inflight.iter().map(|w| w.key.clone()));
        keys.extend(self.pending.keys().cloned());
        keys.extend(self.visible.keys().cloned());
        keys.sort();
        keys.dedup();
        keys.into_iter().filter(|key| self.refresh(key)).collect()
    }
}
