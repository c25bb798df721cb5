//! SQLite-backed JSON document store.
//!
//! Collections are rows in a registry table; documents are JSON object
//! bodies keyed by `(collection, id)`. Equality filters compile to
//! `json_extract` predicates, so the store stays schemaless while the
//! database still enforces per-collection unique indexes (users.email,
//! sessions.user_id) declared at startup.
//!
//! The handle is opened once and injected wherever it is needed; there is
//! no global connection and no ad-hoc teardown.

use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::types::ToSql;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::error::ApiError;

/// Raw byte length of a document id (24 hex chars once encoded).
const ID_BYTES: usize = 12;

/// Hard ceiling on a single page of results.
pub const MAX_PAGE_LIMIT: u32 = 50;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// SQLite extended result code for a foreign-key constraint failure.
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Collection '{0}' does not exist")]
    CollectionNotFound(String),
    #[error("A document with the same unique field already exists in '{collection}'")]
    Conflict { collection: String },
    #[error("Malformed id '{0}'")]
    MalformedId(String),
    #[error("Document body must be a JSON object")]
    NotAnObject,
    #[error("'{0}' is not a plain field name")]
    InvalidFieldName(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Document encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::CollectionNotFound(_) => ApiError::NotFound(message),
            StoreError::Conflict { .. } => ApiError::Conflict(message),
            StoreError::MalformedId(_) => ApiError::Validation(message),
            StoreError::NotAnObject
            | StoreError::InvalidFieldName(_)
            | StoreError::Database(_)
            | StoreError::Encoding(_) => ApiError::Internal(message),
        }
    }
}

/// 24-character lowercase hex document id (12 random bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocId(String);

impl DocId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        DocId(hex::encode(bytes))
    }

    /// Parse a client-supplied id. Well-formed means exactly 24 hex
    /// characters; anything else is a validation failure, not a lookup miss.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(DocId(raw.to_ascii_lowercase()))
        } else {
            Err(StoreError::MalformedId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Equality filter over document fields. The reserved field `id` matches
/// the id column; any other name matches a top-level JSON field.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(doc_id: &DocId) -> Self {
        Filter::new().eq("id", doc_id.as_str())
    }

    #[must_use]
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    /// Compile to an SQL fragment (`" AND …"`) plus its bind values.
    /// Placeholders are numbered from `first`; `?1` is reserved for the
    /// collection name at every call site.
    fn to_sql(&self, first: usize) -> Result<(String, Vec<Box<dyn ToSql>>), StoreError> {
        let mut sql = String::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        let mut idx = first;
        for (field, value) in &self.clauses {
            if field == "id" {
                sql.push_str(&format!(" AND id = ?{idx}"));
            } else {
                check_name(field)?;
                sql.push_str(&format!(" AND json_extract(body, '$.{field}') = ?{idx}"));
            }
            params.push(bind_value(value));
            idx += 1;
        }
        Ok((sql, params))
    }
}

/// Validated pagination window. Handlers reject out-of-range input before
/// building one of these; `clamped` re-applies the floor and ceiling on
/// every query regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub page: u32,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            limit: DEFAULT_PAGE_LIMIT,
            page: 1,
        }
    }
}

impl Page {
    pub fn clamped(self) -> Page {
        Page {
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
            page: self.page.max(1),
        }
    }

    fn offset(self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

/// A stored document: server-assigned id plus its JSON object body.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocId,
    pub body: Map<String, Value>,
}

impl Document {
    /// The body with the id injected, as returned to API clients.
    pub fn into_json(self) -> Value {
        let mut body = self.body;
        body.insert("id".to_string(), Value::String(self.id.0));
        Value::Object(body)
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }
}

/// Result of an `update_one` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// An existing document matched and was rewritten.
    Updated(DocId),
    /// Nothing matched; a new document was inserted (upsert only).
    Inserted(DocId),
    /// Nothing matched and upsert was not requested.
    NoMatch,
}

pub struct DocumentStore {
    conn: Mutex<rusqlite::Connection>,
}

impl DocumentStore {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_created
                ON documents(collection, created_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register a collection (idempotent).
    pub fn ensure_collection(&self, name: &str) -> Result<(), StoreError> {
        check_name(name)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            rusqlite::params![name, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Declare a unique index over one top-level field of a collection
    /// (idempotent). Collection and field names become part of the SQL
    /// text, so both must be plain identifiers.
    pub fn ensure_unique_field(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        check_name(collection)?;
        check_name(field)?;
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_{collection}_{field}
             ON documents (json_extract(body, '$.{field}'))
             WHERE collection = '{collection}'"
        ))?;
        Ok(())
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collections WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert a document under a fresh server-assigned id.
    pub fn insert_one(
        &self,
        collection: &str,
        body: Map<String, Value>,
    ) -> Result<DocId, StoreError> {
        let id = DocId::generate();
        let raw = serde_json::to_string(&Value::Object(body))?;
        let now = Utc::now().timestamp_millis();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO documents (collection, id, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![collection, id.as_str(), raw, now, now],
        )
        .map_err(|e| map_constraint(collection, e))?;

        Ok(id)
    }

    /// First document matching the filter, if any.
    pub fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let sql = format!(
            "SELECT id, body FROM documents WHERE collection = ?1{where_sql} LIMIT 1"
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(param_refs.as_slice())?;
        match rows.next()? {
            Some(row) => {
                let id: String = row.get(0)?;
                let raw: String = row.get(1)?;
                Ok(Some(parse_document(id, &raw)?))
            }
            None => Ok(None),
        }
    }

    /// One page of matching documents, oldest first.
    pub fn find_many(
        &self,
        collection: &str,
        filter: &Filter,
        page: Page,
    ) -> Result<Vec<Document>, StoreError> {
        let page = page.clamped();
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let limit_idx = 2 + filter_params.len();
        let offset_idx = limit_idx + 1;
        let sql = format!(
            "SELECT id, body FROM documents WHERE collection = ?1{where_sql}
             ORDER BY created_at, id LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);
        params.push(Box::new(i64::from(page.limit)));
        params.push(Box::new(page.offset() as i64));
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, raw)| parse_document(id, &raw))
            .collect()
    }

    /// Number of documents matching the filter.
    pub fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE collection = ?1{where_sql}");
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let count: i64 = stmt.query_row(param_refs.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Shallow-merge `patch` into the first document matching `filter`.
    /// With `upsert`, a fresh document is inserted when nothing matches.
    /// Runs inside a transaction so the read-merge-write is atomic per
    /// document.
    pub fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Map<String, Value>,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let select_sql = format!(
            "SELECT id, body FROM documents WHERE collection = ?1{where_sql} LIMIT 1"
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();

        let existing = {
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let mut stmt = tx.prepare(&select_sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            match rows.next()? {
                Some(row) => Some((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                None => None,
            }
        };

        let outcome = match existing {
            Some((id, raw)) => {
                let mut doc = parse_document(id.clone(), &raw)?;
                for (field, value) in patch {
                    doc.body.insert(field.clone(), value.clone());
                }
                let merged = serde_json::to_string(&Value::Object(doc.body))?;
                tx.execute(
                    "UPDATE documents SET body = ?1, updated_at = ?2
                     WHERE collection = ?3 AND id = ?4",
                    rusqlite::params![merged, now, collection, id],
                )
                .map_err(|e| map_constraint(collection, e))?;
                UpdateOutcome::Updated(DocId(id))
            }
            None if upsert => {
                let id = DocId::generate();
                let raw = serde_json::to_string(&Value::Object(patch.clone()))?;
                tx.execute(
                    "INSERT INTO documents (collection, id, body, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![collection, id.as_str(), raw, now, now],
                )
                .map_err(|e| map_constraint(collection, e))?;
                UpdateOutcome::Inserted(id)
            }
            None => UpdateOutcome::NoMatch,
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Delete the first document matching the filter. Returns rows removed
    /// (0 or 1).
    pub fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let sql = format!(
            "DELETE FROM documents WHERE rowid IN (
                SELECT rowid FROM documents WHERE collection = ?1{where_sql} LIMIT 1
            )"
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock();
        let deleted = conn.execute(&sql, param_refs.as_slice())?;
        Ok(deleted as u64)
    }

    /// Delete every document matching the filter. Returns rows removed.
    pub fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let (where_sql, filter_params) = filter.to_sql(2)?;
        let sql = format!("DELETE FROM documents WHERE collection = ?1{where_sql}");
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(collection.to_string())];
        params.extend(filter_params);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock();
        let deleted = conn.execute(&sql, param_refs.as_slice())?;
        Ok(deleted as u64)
    }
}

/// Collection and field names end up inside SQL text and JSON paths, so
/// only plain identifiers are allowed.
fn check_name(name: &str) -> Result<(), StoreError> {
    let plain = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidFieldName(name.to_string()))
    }
}

fn bind_value(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::String(s) => Box::new(s.clone()),
        Value::Bool(b) => Box::new(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        // Arrays, objects, and null compare by their JSON text; the catalog
        // never filters on these.
        other => Box::new(other.to_string()),
    }
}

fn parse_document(id: String, raw: &str) -> Result<Document, StoreError> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(body) => Ok(Document {
            id: DocId(id),
            body,
        }),
        _ => Err(StoreError::NotAnObject),
    }
}

fn map_constraint(collection: &str, err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // A foreign-key failure means the collection row is missing;
            // every other constraint here is a unique-index hit.
            if e.extended_code == SQLITE_CONSTRAINT_FOREIGNKEY {
                StoreError::CollectionNotFound(collection.to_string())
            } else {
                StoreError::Conflict {
                    collection: collection.to_string(),
                }
            }
        }
        _ => StoreError::Database(err),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
