//! Remote-table access and caching seams.
//!
//! The core never talks to the network itself. Callers inject a
//! [`RecordStore`] for the remote base and, optionally, wrap it in
//! [`CachedRecordStore`] to serve repeat reads from a [`RecordCache`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::periodic::lock_or_recover;

/// Field name to value, as the remote base returns them.
pub type FieldMap = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: String,
    pub fields: FieldMap,
}

/// Remote table client: list, create, and update by table name.
pub trait RecordStore: Send + Sync {
    /// Fetch every record in `table`. `bypass_cache` asks any caching
    /// layer in between to go to the origin.
    fn fetch_all(&self, table: &str, bypass_cache: bool) -> CoreResult<Vec<TableRecord>>;

    /// Create a record, returning its new id.
    fn create_record(&self, table: &str, fields: &FieldMap) -> CoreResult<String>;

    /// Patch the named fields on an existing record.
    fn update_record(&self, table: &str, id: &str, fields: &FieldMap) -> CoreResult<()>;
}

/// Per-table record cache.
pub trait RecordCache: Send + Sync {
    fn get(&self, table: &str, id: &str) -> Option<TableRecord>;
    fn set(&self, table: &str, record: &TableRecord);
    fn delete(&self, table: &str, id: &str);
    fn list_ids(&self, table: &str) -> Vec<String>;
    fn clear_table(&self, table: &str);
}

/// A [`RecordStore`] that serves whole-table reads from the cache once a
/// table has been fetched, and writes through on create and update.
pub struct CachedRecordStore {
    origin: Arc<dyn RecordStore>,
    cache: Arc<dyn RecordCache>,
    /// Tables whose full contents have been fetched at least once.
    /// Write-through alone never primes a table, so a partial cache is
    /// never mistaken for the whole table.
    primed: Mutex<HashSet<String>>,
}

impl CachedRecordStore {
    pub fn new(origin: Arc<dyn RecordStore>, cache: Arc<dyn RecordCache>) -> Self {
        Self {
            origin,
            cache,
            primed: Mutex::new(HashSet::new()),
        }
    }
}

impl RecordStore for CachedRecordStore {
    fn fetch_all(&self, table: &str, bypass_cache: bool) -> CoreResult<Vec<TableRecord>> {
        if !bypass_cache && lock_or_recover(&self.primed).contains(table) {
            let ids = self.cache.list_ids(table);
            let cached: Vec<TableRecord> = ids
                .iter()
                .filter_map(|id| self.cache.get(table, id))
                .collect();
            debug!(table = %table, records = cached.len(), "served table from cache");
            return Ok(cached);
        }

        let records = self.origin.fetch_all(table, bypass_cache)?;
        self.cache.clear_table(table);
        for record in &records {
            self.cache.set(table, record);
        }
        lock_or_recover(&self.primed).insert(table.to_string());
        Ok(records)
    }

    fn create_record(&self, table: &str, fields: &FieldMap) -> CoreResult<String> {
        let id = self.origin.create_record(table, fields)?;
        self.cache.set(
            table,
            &TableRecord {
                id: id.clone(),
                fields: fields.clone(),
            },
        );
        Ok(id)
    }

    fn update_record(&self, table: &str, id: &str, fields: &FieldMap) -> CoreResult<()> {
        self.origin.update_record(table, id, fields)?;
        let mut record = self.cache.get(table, id).unwrap_or_else(|| TableRecord {
            id: id.to_string(),
            fields: FieldMap::new(),
        });
        for (key, value) in fields {
            record.fields.insert(key.clone(), value.clone());
        }
        self.cache.set(table, &record);
        Ok(())
    }
}

/// In-memory origin, for tests and offline development. `set_offline`
/// makes every call fail the way an unreachable base would.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<TableRecord>>>,
    counter: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing the offline switch.
    pub fn insert(&self, table: &str, fields: FieldMap) -> String {
        let id = self.next_id();
        lock_or_recover(&self.tables)
            .entry(table.to_string())
            .or_default()
            .push(TableRecord {
                id: id.clone(),
                fields,
            });
        id
    }

    fn next_id(&self) -> String {
        format!("rec{:06}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn ensure_online(&self, table: &str, action: &'static str) -> CoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoreError::Upstream {
                table: table.to_string(),
                action,
                message: "store is offline".into(),
            });
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn fetch_all(&self, table: &str, _bypass_cache: bool) -> CoreResult<Vec<TableRecord>> {
        self.ensure_online(table, "fetch")?;
        Ok(lock_or_recover(&self.tables)
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    fn create_record(&self, table: &str, fields: &FieldMap) -> CoreResult<String> {
        self.ensure_online(table, "create")?;
        Ok(self.insert(table, fields.clone()))
    }

    fn update_record(&self, table: &str, id: &str, fields: &FieldMap) -> CoreResult<()> {
        self.ensure_online(table, "update")?;
        let mut tables = lock_or_recover(&self.tables);
        let records = tables.get_mut(table).ok_or_else(|| CoreError::Upstream {
            table: table.to_string(),
            action: "update",
            message: format!("no such table for record {id}"),
        })?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::Upstream {
                table: table.to_string(),
                action: "update",
                message: format!("record {id} not found"),
            })?;
        for (key, value) in fields {
            record.fields.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// In-memory [`RecordCache`].
#[derive(Default)]
pub struct MemoryCache {
    tables: Mutex<HashMap<String, HashMap<String, TableRecord>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordCache for MemoryCache {
    fn get(&self, table: &str, id: &str) -> Option<TableRecord> {
        lock_or_recover(&self.tables)
            .get(table)
            .and_then(|records| records.get(id))
            .cloned()
    }

    fn set(&self, table: &str, record: &TableRecord) {
        lock_or_recover(&self.tables)
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
    }

    fn delete(&self, table: &str, id: &str) {
        if let Some(records) = lock_or_recover(&self.tables).get_mut(table) {
            records.remove(id);
        }
    }

    fn list_ids(&self, table: &str) -> Vec<String> {
        lock_or_recover(&self.tables)
            .get(table)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn clear_table(&self, table: &str) {
        lock_or_recover(&self.tables).remove(table);
    }
}
