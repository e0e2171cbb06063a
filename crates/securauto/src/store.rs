//! Document store
//!
//! Collection/document storage over SQLite: documents are JSON objects keyed
//! by collection name and id. Supports compound-predicate queries with
//! ordering and limits, atomic multi-document writes, and a change feed that
//! the realtime listeners subscribe to.

use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::db;

/// Capacity of the change-notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Erreur de base de données: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Document illisible: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Erreur d'entrée/sortie: {0}")]
    Io(#[from] std::io::Error),

    #[error("Le document {collection}/{id} n'est pas un objet JSON")]
    NotAnObject { collection: String, id: String },

    #[error("Verrou de la base de données empoisonné")]
    Poisoned,
}

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    /// Deserialize the document body into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    fn matches(&self, data: &Value) -> bool {
        let actual = data.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => compare_values(actual, &self.value) == Some(Ordering::Equal),
            FilterOp::Ne => compare_values(actual, &self.value) != Some(Ordering::Equal),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A query against one collection: every filter must hold
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(data))
    }

    /// Filter, sort and truncate a collection's documents
    fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut result: Vec<Document> = docs.into_iter().filter(|d| self.matches(&d.data)).collect();

        if let Some((field, direction)) = &self.order_by {
            result.sort_by(|a, b| {
                let left = a.data.get(field).unwrap_or(&Value::Null);
                let right = b.data.get(field).unwrap_or(&Value::Null);
                let ord = compare_values(left, right).unwrap_or(Ordering::Equal);
                match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            result.truncate(limit);
        }

        result
    }
}

/// Compare two JSON values.
///
/// Strings that both parse as RFC 3339 timestamps compare chronologically.
/// Null sorts before everything else. Mismatched types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::<FixedOffset>::parse_from_rfc3339(x),
                DateTime::<FixedOffset>::parse_from_rfc3339(y),
            ) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// One operation of an atomic multi-document write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        data: Value,
    },
    Merge {
        collection: String,
        id: String,
        fields: Map<String, Value>,
    },
}

impl WriteOp {
    fn collection(&self) -> &str {
        match self {
            WriteOp::Set { collection, .. } | WriteOp::Merge { collection, .. } => collection,
        }
    }
}

/// Writes queued for a single atomic commit
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new document with a generated id, returning the id
    pub fn add<T: Serialize>(&mut self, collection: &str, value: &T) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.set(collection, &id, value)?;
        Ok(id)
    }

    pub fn set<T: Serialize>(
        &mut self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.ops.push(WriteOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data: serde_json::to_value(value)?,
        });
        Ok(())
    }

    pub fn merge(&mut self, collection: &str, id: &str, fields: Map<String, Value>) {
        self.ops.push(WriteOp::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Notification that a collection changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
}

/// Collection/document store backed by a single SQLite connection
pub struct DocumentStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl DocumentStore {
    /// Open (and migrate) the store at the given path
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::init_db(path)?))
    }

    /// Open an empty in-memory store
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::init_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            changes,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Receive a notification for every committed write
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn notify<'a>(&self, collections: impl IntoIterator<Item = &'a str>) {
        let mut seen: Vec<&str> = Vec::new();
        for collection in collections {
            if seen.contains(&collection) {
                continue;
            }
            seen.push(collection);
            // No receivers is fine
            let _ = self.changes.send(ChangeEvent {
                collection: collection.to_string(),
            });
        }
    }

    /// Fetch one document by id
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(Document {
                id: id.to_string(),
                data: serde_json::from_str(&raw)?,
            })),
            None => Ok(None),
        }
    }

    /// Run a query and return the matching documents
    pub fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let docs = {
            let conn = self.conn()?;
            load_collection(&conn, &query.collection)?
        };
        Ok(query.apply(docs))
    }

    /// Run a query and decode every match
    pub fn query_as<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<(String, T)>, StoreError> {
        self.query(query)?
            .into_iter()
            .map(|doc| {
                let value = doc.decode()?;
                Ok((doc.id, value))
            })
            .collect()
    }

    /// Count matching documents, ignoring any limit
    pub fn count(&self, query: &Query) -> Result<usize, StoreError> {
        let mut unbounded = query.clone();
        unbounded.limit = None;
        unbounded.order_by = None;
        Ok(self.query(&unbounded)?.len())
    }

    pub fn exists(&self, query: &Query) -> Result<bool, StoreError> {
        Ok(!self.query(&query.clone().limit(1))?.is_empty())
    }

    /// Insert a document under a generated id
    pub fn add<T: Serialize>(&self, collection: &str, value: &T) -> Result<String, StoreError> {
        let mut batch = WriteBatch::new();
        let id = batch.add(collection, value)?;
        self.commit(batch)?;
        Ok(id)
    }

    /// Create or replace a document
    #[cfg(test)]
    pub fn set<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(collection, id, value)?;
        self.commit(batch)?;
        Ok(())
    }

    /// Merge top-level fields into an existing document.
    /// Returns false if the document does not exist.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        if self.get(collection, id)?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.merge(collection, id, fields);
        self.commit(batch)?;
        Ok(true)
    }

    /// Apply every queued write in one transaction.
    /// Either all writes land or none do.
    pub fn commit(&self, batch: WriteBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for op in &batch.ops {
                apply_op(&tx, op)?;
            }
            tx.commit()?;
        }

        debug!(writes = batch.len(), "Committed batch");
        self.notify(batch.ops.iter().map(WriteOp::collection));
        Ok(batch.len())
    }
}

fn load_collection(conn: &Connection, collection: &str) -> Result<Vec<Document>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, data FROM documents WHERE collection = ?1 ORDER BY created_at, id")?;

    let rows = stmt
        .query_map([collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, raw)| {
            Ok(Document {
                id,
                data: serde_json::from_str(&raw)?,
            })
        })
        .collect()
}

fn apply_op(conn: &Connection, op: &WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Set {
            collection,
            id,
            data,
        } => {
            conn.execute(
                "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = datetime('now')",
                params![collection, id, data.to_string()],
            )?;
        }
        WriteOp::Merge {
            collection,
            id,
            fields,
        } => {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get(0),
                )
                .optional()?;

            let mut data: Value = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Object(Map::new()),
            };
            let object = data.as_object_mut().ok_or_else(|| StoreError::NotAnObject {
                collection: collection.clone(),
                id: id.clone(),
            })?;
            for (key, value) in fields {
                object.insert(key.clone(), value.clone());
            }

            conn.execute(
                "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = datetime('now')",
                params![collection, id, data.to_string()],
            )?;
        }
    }
    Ok(())
}
