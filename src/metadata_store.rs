//! # Metadata Store
//!
//! Durable `content hash → (text, metadata)` mapping kept in SQLite through Diesel.
//!
//! Each row's auto-increment id mirrors a vector offset in the
//! [`FlatIndex`](crate::vector_index::FlatIndex): `offset = id - 1`. The store never
//! deletes single rows, so ids stay dense. [`MetadataStore::clear`] also resets
//! SQLite's `AUTOINCREMENT` counter so the first row after a clear is id 1 again.
//!
//! ## Table
//! ```sql
//! CREATE TABLE embeddings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     text_hash TEXT UNIQUE NOT NULL,
//!     text TEXT NOT NULL,
//!     metadata TEXT,
//!     created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
//! )
//! ```

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::CacheError;
use crate::models::{EmbeddingRow, NewEmbeddingRow};
use crate::schema::embeddings::dsl;

const CREATE_EMBEDDINGS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS embeddings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text_hash TEXT UNIQUE NOT NULL,
        text TEXT NOT NULL,
        metadata TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )";

/// Outcome of [`MetadataStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new row was created with this id.
    Inserted(i32),
    /// The hash already existed; only its metadata was replaced.
    Updated(i32),
}

impl Upsert {
    pub fn row_id(self) -> i32 {
        match self {
            Upsert::Inserted(id) | Upsert::Updated(id) => id,
        }
    }
}

/// A cached text as seen by callers: metadata parsed, offset derived.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub content_hash: String,
    pub text: String,
    pub metadata: Option<JsonValue>,
    pub vector_offset: usize,
    pub created_at: NaiveDateTime,
}

impl TryFrom<EmbeddingRow> for CacheEntry {
    type Error = CacheError;

    fn try_from(row: EmbeddingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            vector_offset: row.vector_offset(),
            metadata: parse_metadata(row.metadata)?,
            content_hash: row.text_hash,
            text: row.text,
            created_at: row.created_at,
        })
    }
}

/// SQLite-backed metadata for cached embeddings.
pub struct MetadataStore {
    connection: SqliteConnection,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) the database file at `path` and ensure the schema.
    ///
    /// # Errors
    /// [`CacheError::Connection`] if SQLite cannot open the file,
    /// [`CacheError::Database`] if the table cannot be created.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let url = path.to_string_lossy();
        let connection = SqliteConnection::establish(&url)?;
        let mut store = Self {
            connection,
            path: path.to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the `embeddings` table if it does not exist. Safe to call repeatedly.
    pub fn init(&mut self) -> Result<(), CacheError> {
        diesel::sql_query(CREATE_EMBEDDINGS_TABLE).execute(&mut self.connection)?;
        Ok(())
    }

    /// Insert a row for `content_hash`, or replace the metadata of the existing one.
    ///
    /// On update the text, id and creation time are left untouched. A new row takes
    /// the next id, which the caller must already have matched with an appended
    /// vector.
    pub fn upsert(
        &mut self,
        content_hash: &str,
        text: &str,
        metadata: Option<&JsonValue>,
    ) -> Result<Upsert, CacheError> {
        let metadata = serialize_metadata(metadata)?;

        self.connection.transaction::<_, CacheError, _>(|conn| {
            let existing = dsl::embeddings
                .filter(dsl::text_hash.eq(content_hash))
                .select(dsl::id)
                .first::<i32>(conn)
                .optional()?;

            match existing {
                Some(id) => {
                    diesel::update(dsl::embeddings.find(id))
                        .set(dsl::metadata.eq(metadata))
                        .execute(conn)?;
                    debug!("Updated metadata for row {}", id);
                    Ok(Upsert::Updated(id))
                }
                None => {
                    let row = NewEmbeddingRow {
                        text_hash: content_hash,
                        text,
                        metadata,
                        created_at: Utc::now().naive_utc(),
                    };
                    let id = diesel::insert_into(dsl::embeddings)
                        .values(&row)
                        .returning(dsl::id)
                        .get_result::<i32>(conn)?;
                    debug!("Inserted row {}", id);
                    Ok(Upsert::Inserted(id))
                }
            }
        })
    }

    /// Row id for `content_hash`, if cached.
    pub fn lookup_by_hash(&mut self, content_hash: &str) -> Result<Option<i32>, CacheError> {
        let id = dsl::embeddings
            .filter(dsl::text_hash.eq(content_hash))
            .select(dsl::id)
            .first::<i32>(&mut self.connection)
            .optional()?;
        Ok(id)
    }

    /// Text and parsed metadata stored under `row_id`.
    pub fn lookup_by_row_id(
        &mut self,
        row_id: i32,
    ) -> Result<Option<(String, Option<JsonValue>)>, CacheError> {
        let row = dsl::embeddings
            .find(row_id)
            .select((dsl::text, dsl::metadata))
            .first::<(String, Option<String>)>(&mut self.connection)
            .optional()?;

        match row {
            Some((text, metadata)) => Ok(Some((text, parse_metadata(metadata)?))),
            None => Ok(None),
        }
    }

    /// The full entry stored under `row_id`.
    pub fn entry(&mut self, row_id: i32) -> Result<Option<CacheEntry>, CacheError> {
        let row = dsl::embeddings
            .find(row_id)
            .select(EmbeddingRow::as_select())
            .first(&mut self.connection)
            .optional()?;
        row.map(CacheEntry::try_from).transpose()
    }

    /// Number of rows.
    pub fn count(&mut self) -> Result<usize, CacheError> {
        let count = dsl::embeddings
            .count()
            .get_result::<i64>(&mut self.connection)?;
        Ok(count as usize)
    }

    /// Highest row id, or `None` when the table is empty.
    pub fn max_row_id(&mut self) -> Result<Option<i32>, CacheError> {
        let max = dsl::embeddings
            .select(diesel::dsl::max(dsl::id))
            .first::<Option<i32>>(&mut self.connection)?;
        Ok(max)
    }

    /// Delete every row and restart id assignment at 1.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.connection.transaction::<_, CacheError, _>(|conn| {
            diesel::delete(dsl::embeddings).execute(conn)?;
            diesel::sql_query("DELETE FROM sqlite_sequence WHERE name = 'embeddings'")
                .execute(conn)?;
            Ok(())
        })
    }
}

fn serialize_metadata(metadata: Option<&JsonValue>) -> Result<Option<String>, CacheError> {
    match metadata {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::to_string(value)?)),
    }
}

fn parse_metadata(raw: Option<String>) -> Result<Option<JsonValue>, CacheError> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(CacheError::from)
}
