//! # Database models
//!
//! Data structures that map to the cache's SQLite schema via **Diesel**.
//!
//! - [`EmbeddingRow`]: one cached text, as read back from the `embeddings` table.
//! - [`NewEmbeddingRow`]: the insertable form used the first time a text is cached.
//!
//! The row id doubles as the vector's position in the
//! [`FlatIndex`](crate::vector_index::FlatIndex): `offset = id - 1`. See
//! [`EmbeddingRow::vector_offset`].
use chrono::NaiveDateTime;
use diesel::prelude::*;

/// A cached text and its metadata.
///
/// ### Table
/// - `embeddings`
///
/// ### Notes
/// - `metadata` is stored as a JSON string; the store parses it into a
///   [`serde_json::Value`] on the way out.
/// - `created_at` is UTC.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::embeddings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EmbeddingRow {
    /// Auto-increment primary key, starting at 1.
    pub id: i32,
    /// SHA-256 hex digest of `text`; unique.
    pub text_hash: String,
    /// The original text.
    pub text: String,
    /// Caller supplied JSON, if any.
    pub metadata: Option<String>,
    /// When the text was first cached.
    pub created_at: NaiveDateTime,
}

impl EmbeddingRow {
    /// Position of this row's vector in the index.
    #[inline]
    pub fn vector_offset(&self) -> usize {
        row_id_to_offset(self.id)
    }
}

/// Insertable form of [`EmbeddingRow`]; `id` is assigned by SQLite.
#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::embeddings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEmbeddingRow<'a> {
    pub text_hash: &'a str,
    pub text: &'a str,
    pub metadata: Option<String>,
    pub created_at: NaiveDateTime,
}

/// `row_id - 1`. Row ids start at 1, offsets at 0.
#[inline]
pub fn row_id_to_offset(row_id: i32) -> usize {
    (row_id - 1) as usize
}

/// `offset + 1`.
#[inline]
pub fn offset_to_row_id(offset: usize) -> i32 {
    offset as i32 + 1
}
