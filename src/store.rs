//! Durable, indexed, per-user persistence for the cached collections and the
//! pending sync queue.
//!
//! Records are stored as JSON bodies in one table per collection, keyed by
//! the tagged [`EntityId`] text encoding and indexed by `user_id`. The
//! connection is a single process-wide handle behind a mutex, opened once
//! and reused.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::DataError;
use crate::models::{
    CacheRecord, ConsumptionEntry, EntityId, EntityKind, Goal, NewSyncOperation, OperationKind,
    Product, SyncOperation,
};

const NEXT_LOCAL_ID_KEY: &str = "next_local_id";

/// The record collections the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Products,
    Consumption,
    Goals,
}

impl Collection {
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Consumption => "consumption",
            Collection::Goals => "goals",
        }
    }

    #[must_use]
    pub fn for_entity(entity: EntityKind) -> Self {
        match entity {
            EntityKind::Product => Collection::Products,
            EntityKind::Consumption => Collection::Consumption,
            EntityKind::Goal => Collection::Goals,
        }
    }

    #[must_use]
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Collection::Products => EntityKind::Product,
            Collection::Consumption => EntityKind::Consumption,
            Collection::Goals => EntityKind::Goal,
        }
    }
}

/// A record type the store knows how to persist.
pub trait Stored: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;
    fn id(&self) -> EntityId;
    fn user_id(&self) -> i64;
}

impl Stored for Product {
    const COLLECTION: Collection = Collection::Products;
    fn id(&self) -> EntityId {
        self.id
    }
    fn user_id(&self) -> i64 {
        self.user_id
    }
}

impl Stored for ConsumptionEntry {
    const COLLECTION: Collection = Collection::Consumption;
    fn id(&self) -> EntityId {
        self.id
    }
    fn user_id(&self) -> i64 {
        self.user_id
    }
}

impl Stored for Goal {
    const COLLECTION: Collection = Collection::Goals;
    fn id(&self) -> EntityId {
        self.id
    }
    fn user_id(&self) -> i64 {
        self.user_id
    }
}

/// Change notification emitted by mutation methods, so consumers subscribe
/// instead of polling pending counts on a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    QueueChanged { user_id: i64, pending: i64 },
}

pub struct LocalStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self, DataError> {
        let conn = Connection::open(path).map_err(|e| {
            DataError::StorageUnavailable(format!(
                "failed to open store at {}: {e}",
                path.display()
            ))
        })?;
        Self::from_conn(conn)
    }

    pub fn open_in_memory() -> Result<Self, DataError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DataError::StorageUnavailable(format!("failed to open store: {e}")))?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> Result<Self, DataError> {
        Self::migrate(&conn)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    /// Idempotent schema setup. The stored version only ever increases, and
    /// each stage only adds tables and indexes, so opening an older store
    /// upgrades it without touching existing data.
    fn migrate(conn: &Connection) -> Result<(), DataError> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS products (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    synced INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS consumption (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    synced INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS goals (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    synced INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_products_user ON products(user_id);
                CREATE INDEX IF NOT EXISTS idx_consumption_user ON consumption(user_id);
                CREATE INDEX IF NOT EXISTS idx_goals_user ON goals(user_id);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_operations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    entity TEXT NOT NULL,
                    entity_id TEXT,
                    payload TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sync_operations_user ON sync_operations(user_id);

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DataError> {
        self.conn
            .lock()
            .map_err(|_| DataError::StorageUnavailable("store lock poisoned".to_string()))
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // --- Row mapping helpers ---

    fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<(bool, String, String)> {
        let synced = row.get::<_, i64>(0)? != 0;
        Ok((synced, row.get(1)?, row.get(2)?))
    }

    fn decode<T: Stored>(
        (synced, updated_at, body): (bool, String, String),
    ) -> Result<CacheRecord<T>, DataError> {
        Ok(CacheRecord {
            record: serde_json::from_str(&body)?,
            synced,
            updated_at,
        })
    }

    fn op_from_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, i64, String, String, Option<String>, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn decode_op(
        (id, user_id, kind, entity, entity_id, payload, timestamp): (
            i64,
            i64,
            String,
            String,
            Option<String>,
            String,
            String,
        ),
    ) -> Result<SyncOperation, DataError> {
        Ok(SyncOperation {
            id,
            user_id,
            kind: kind.parse::<OperationKind>()?,
            entity: entity.parse::<EntityKind>()?,
            entity_id: entity_id.as_deref().map(str::parse).transpose()?,
            payload: serde_json::from_str(&payload)?,
            timestamp,
        })
    }

    // --- Collections ---

    pub fn get_all<T: Stored>(&self, user_id: i64) -> Result<Vec<CacheRecord<T>>, DataError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT synced, updated_at, body FROM {} WHERE user_id = ?1",
            T::COLLECTION.table()
        ))?;
        let rows = stmt
            .query_map(params![user_id], Self::record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode).collect()
    }

    pub fn get<T: Stored>(&self, id: EntityId) -> Result<Option<CacheRecord<T>>, DataError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT synced, updated_at, body FROM {} WHERE id = ?1",
                    T::COLLECTION.table()
                ),
                params![id.key()],
                Self::record_from_row,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// Client-side filter over the per-user set (used for date-range
    /// queries).
    pub fn get_filtered<T: Stored>(
        &self,
        user_id: i64,
        filter: impl Fn(&T) -> bool,
    ) -> Result<Vec<CacheRecord<T>>, DataError> {
        let mut records = self.get_all::<T>(user_id)?;
        records.retain(|r| filter(&r.record));
        Ok(records)
    }

    /// Insert-or-replace keyed by the record id. Works for both
    /// server-assigned and locally generated placeholder ids.
    pub fn put<T: Stored>(&self, record: &T, synced: bool) -> Result<CacheRecord<T>, DataError> {
        let now = Local::now().to_rfc3339();
        let body = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, user_id, synced, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                T::COLLECTION.table()
            ),
            params![record.id().key(), record.user_id(), i64::from(synced), now, body],
        )?;
        Ok(CacheRecord {
            record: record.clone(),
            synced,
            updated_at: now,
        })
    }

    /// Removes a single record; absence is not an error.
    pub fn delete<T: Stored>(&self, id: EntityId) -> Result<bool, DataError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", T::COLLECTION.table()),
            params![id.key()],
        )?;
        Ok(rows > 0)
    }

    /// Upsert a batch fetched from the server.
    ///
    /// Records absent from the batch are left in place: the server response
    /// may be a filtered view, so cache entries are only ever invalidated by
    /// an explicit delete, never by absence from a sync batch. A record stays
    /// `synced = false` while a queued operation still references it, even
    /// when the batch contains it: the server copy predates the pending
    /// replay.
    pub fn bulk_sync<T: Stored>(&self, user_id: i64, records: &[T]) -> Result<(), DataError> {
        let now = Local::now().to_rfc3339();
        let conn = self.lock()?;
        let pending = Self::pending_keys(&conn, user_id, T::COLLECTION.entity_kind())?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {} (id, user_id, synced, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                T::COLLECTION.table()
            ))?;
            for record in records {
                debug_assert_eq!(record.user_id(), user_id);
                let key = record.id().key();
                let synced = !pending.contains(&key);
                let body = serde_json::to_string(record)?;
                stmt.execute(params![key, record.user_id(), i64::from(synced), now, body])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn pending_keys(
        conn: &Connection,
        user_id: i64,
        entity: EntityKind,
    ) -> Result<HashSet<String>, DataError> {
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM sync_operations
             WHERE user_id = ?1 AND entity = ?2 AND entity_id IS NOT NULL",
        )?;
        let keys = stmt
            .query_map(params![user_id, entity.as_str()], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(keys)
    }

    // --- Sync queue ---

    pub fn enqueue(&self, op: &NewSyncOperation) -> Result<SyncOperation, DataError> {
        let now = Local::now().to_rfc3339();
        let payload = serde_json::to_string(&op.payload)?;
        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO sync_operations (user_id, kind, entity, entity_id, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    op.user_id,
                    op.kind.as_str(),
                    op.entity.as_str(),
                    op.entity_id.map(EntityId::key),
                    payload,
                    now
                ],
            )?;
            conn.last_insert_rowid()
        };
        debug!(user_id = op.user_id, entity = op.entity.as_str(), kind = op.kind.as_str(), "queued sync operation");
        self.notify_queue_changed(op.user_id)?;
        Ok(SyncOperation {
            id,
            user_id: op.user_id,
            kind: op.kind,
            entity: op.entity,
            entity_id: op.entity_id,
            payload: op.payload.clone(),
            timestamp: now,
        })
    }

    /// Pending operations for a user in insertion (FIFO) order.
    pub fn list_pending(&self, user_id: i64) -> Result<Vec<SyncOperation>, DataError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, entity, entity_id, payload, timestamp
             FROM sync_operations WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], Self::op_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode_op).collect()
    }

    pub fn dequeue(&self, operation_id: i64) -> Result<bool, DataError> {
        let (removed, user_id) = {
            let conn = self.lock()?;
            let user_id: Option<i64> = conn
                .query_row(
                    "SELECT user_id FROM sync_operations WHERE id = ?1",
                    params![operation_id],
                    |row| row.get(0),
                )
                .optional()?;
            let rows = conn.execute(
                "DELETE FROM sync_operations WHERE id = ?1",
                params![operation_id],
            )?;
            (rows > 0, user_id)
        };
        if let Some(user_id) = user_id {
            self.notify_queue_changed(user_id)?;
        }
        Ok(removed)
    }

    pub fn clear_pending(&self, user_id: i64) -> Result<(), DataError> {
        {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM sync_operations WHERE user_id = ?1",
                params![user_id],
            )?;
        }
        self.notify_queue_changed(user_id)?;
        Ok(())
    }

    pub fn pending_count(&self, user_id: i64) -> Result<i64, DataError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Whether any queued operation still references the given entity.
    pub fn has_pending_for(
        &self,
        user_id: i64,
        entity: EntityKind,
        id: EntityId,
    ) -> Result<bool, DataError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations
             WHERE user_id = ?1 AND entity = ?2 AND entity_id = ?3",
            params![user_id, entity.as_str(), id.key()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Flip the sync flag of a stored record without touching its body.
    /// No-op when the record does not exist.
    pub fn set_synced(
        &self,
        entity: EntityKind,
        id: EntityId,
        synced: bool,
    ) -> Result<bool, DataError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            &format!(
                "UPDATE {} SET synced = ?1 WHERE id = ?2",
                Collection::for_entity(entity).table()
            ),
            params![i64::from(synced), id.key()],
        )?;
        Ok(rows > 0)
    }

    fn notify_queue_changed(&self, user_id: i64) -> Result<(), DataError> {
        let pending = self.pending_count(user_id)?;
        // No receivers is fine.
        let _ = self.events.send(StoreEvent::QueueChanged { user_id, pending });
        Ok(())
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DataError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), DataError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool, DataError> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    /// Next placeholder id for a record created while offline. Monotonic and
    /// persistent, so placeholder ids stay locally unique across restarts.
    pub fn allocate_local_id(&self) -> Result<i64, DataError> {
        let conn = self.lock()?;
        let next: i64 = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![NEXT_LOCAL_ID_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map_or(Ok(1), |v| {
                v.parse::<i64>().map_err(|_| {
                    DataError::StorageUnavailable(format!("corrupt local id counter '{v}'"))
                })
            })?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![NEXT_LOCAL_ID_KEY, (next + 1).to_string()],
        )?;
        Ok(next)
    }

    // --- Id reconciliation ---

    /// Rewrite every reference to `from` with `to` after a queued create has
    /// been assigned its server id: the record's own key and body, the
    /// `product_id` of dependent consumption entries (when remapping a
    /// product), and any still-queued operations targeting the old id.
    pub fn remap_id(
        &self,
        user_id: i64,
        entity: EntityKind,
        from: EntityId,
        to: EntityId,
    ) -> Result<(), DataError> {
        let table = Collection::for_entity(entity).table();
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        // The record itself, if it still exists under the old key.
        let body: Option<String> = tx
            .query_row(
                &format!("SELECT body FROM {table} WHERE id = ?1"),
                params![from.key()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(body) = body {
            let mut value: serde_json::Value = serde_json::from_str(&body)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("id".to_string(), serde_json::json!(to.key()));
            }
            tx.execute(
                &format!("UPDATE {table} SET id = ?1, body = ?2 WHERE id = ?3"),
                params![to.key(), serde_json::to_string(&value)?, from.key()],
            )?;
        }

        // Dependent consumption entries re-point to the product's server id.
        if entity == EntityKind::Product {
            let rows: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, body FROM consumption WHERE user_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for (row_id, body) in rows {
                let mut value: serde_json::Value = serde_json::from_str(&body)?;
                let Some(obj) = value.as_object_mut() else {
                    continue;
                };
                if obj.get("product_id").and_then(serde_json::Value::as_str)
                    == Some(from.key().as_str())
                {
                    obj.insert("product_id".to_string(), serde_json::json!(to.key()));
                    tx.execute(
                        "UPDATE consumption SET body = ?1 WHERE id = ?2",
                        params![serde_json::to_string(&value)?, row_id],
                    )?;
                }
            }
        }

        // Queued operations behind the create: entity id column and any id
        // references inside create payloads.
        tx.execute(
            "UPDATE sync_operations SET entity_id = ?1
             WHERE user_id = ?2 AND entity = ?3 AND entity_id = ?4",
            params![to.key(), user_id, entity.as_str(), from.key()],
        )?;
        let ops: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, payload FROM sync_operations WHERE user_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (op_id, payload) in ops {
            let mut value: serde_json::Value = serde_json::from_str(&payload)?;
            let Some(obj) = value.as_object_mut() else {
                continue;
            };
            let mut changed = false;
            for field in ["id", "product_id"] {
                if obj.get(field).and_then(serde_json::Value::as_str)
                    == Some(from.key().as_str())
                {
                    obj.insert(field.to_string(), serde_json::json!(to.key()));
                    changed = true;
                }
            }
            if changed {
                tx.execute(
                    "UPDATE sync_operations SET payload = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&value)?, op_id],
                )?;
            }
        }

        tx.commit()?;
        debug!(user_id, entity = entity.as_str(), %from, %to, "remapped entity id");
        Ok(())
    }
}
