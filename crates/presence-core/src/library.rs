//! Persistent face library (SQLite).
//!
//! Each row is one enrolled sample; a person may have several. Embeddings are
//! stored as little-endian f32 blobs.

use crate::types::{Embedding, LibraryEntry};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Similarity at which a new sample is considered a re-enrollment of an existing one.
pub const DUPLICATE_SIMILARITY: f32 = 0.98;

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("name must not be empty")]
    EmptyName,
    #[error("embedding must not be empty")]
    EmptyEmbedding,
    #[error("sample duplicates an existing entry for {name} ({similarity:.3})")]
    Duplicate { name: String, similarity: f32 },
}

/// Library row metadata without the embedding.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub id: String,
    pub name: String,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS faces (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        embedding     BLOB NOT NULL,
        model_version TEXT,
        created_at    TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS faces_name ON faces(name);
";

pub struct FaceLibrary {
    conn: Connection,
}

impl FaceLibrary {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // Best effort; the open below reports the real failure
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "face library opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, LibraryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Enroll one sample under `name`, returning its id.
    pub fn add(&self, name: &str, embedding: &Embedding) -> Result<String, LibraryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LibraryError::EmptyName);
        }
        if embedding.values.is_empty() {
            return Err(LibraryError::EmptyEmbedding);
        }

        if let Some(similarity) = self
            .entries()?
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.embedding.similarity(embedding))
            .find(|&s| s >= DUPLICATE_SIMILARITY)
        {
            return Err(LibraryError::Duplicate {
                name: name.to_string(),
                similarity,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO faces (id, name, embedding, model_version, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                name,
                encode_embedding(&embedding.values),
                embedding.model_version,
                Utc::now().to_rfc3339()
            ],
        )?;
        tracing::info!(id = %id, name, "face enrolled");
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<EntrySummary>, LibraryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, model_version, created_at FROM faces ORDER BY name, created_at")?;
        let rows = stmt
            .query_map([], |row| {
                let created: String = row.get(3)?;
                Ok(EntrySummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    model_version: row.get(2)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete one sample. `false` if the id was unknown.
    pub fn remove(&self, id: &str) -> Result<bool, LibraryError> {
        let n = self.conn.execute("DELETE FROM faces WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Delete every sample for `name`, returning how many were removed.
    pub fn remove_name(&self, name: &str) -> Result<usize, LibraryError> {
        let n = self.conn.execute("DELETE FROM faces WHERE name = ?1", params![name])?;
        tracing::info!(name, removed = n, "faces removed");
        Ok(n)
    }

    pub fn entries(&self) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, embedding, model_version FROM faces ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A damaged row costs one sample, not the whole library
        let entries = rows
            .into_iter()
            .filter_map(|(id, name, blob, model_version)| match decode_embedding(&blob) {
                Some(values) => Some(LibraryEntry {
                    id,
                    name,
                    embedding: Embedding { values, model_version },
                }),
                None => {
                    tracing::warn!(id = %id, name = %name, bytes = blob.len(), "skipping corrupt embedding");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    /// Distinct enrolled names, sorted.
    pub fn names(&self) -> Result<Vec<String>, LibraryError> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT name FROM faces ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Shared, swappable view of the library for the frame loop.
///
/// Readers take an `Arc` of the current entries and keep using it for the
/// whole frame; a reload swaps in a new slice without disturbing them.
#[derive(Debug, Clone)]
pub struct LibrarySnapshot {
    current: Arc<RwLock<Arc<[LibraryEntry]>>>,
}

impl Default for LibrarySnapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LibrarySnapshot {
    pub fn new(entries: Vec<LibraryEntry>) -> Self {
        Self {
            current: Arc::new(RwLock::new(entries.into())),
        }
    }

    pub fn load(&self) -> Arc<[LibraryEntry]> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, entries: Vec<LibraryEntry>) -> usize {
        let n = entries.len();
        let next: Arc<[LibraryEntry]> = entries.into();
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn test_add_and_entries_roundtrip() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        let id = lib.add("Alex", &emb(vec![0.6, 0.8, 0.0])).unwrap();
        let entries = lib.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].name, "Alex");
        assert_eq!(entries[0].embedding.values, vec![0.6, 0.8, 0.0]);
        assert_eq!(entries[0].embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_duplicate_sample_rejected() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        lib.add("Alex", &emb(vec![1.0, 0.0])).unwrap();
        let err = lib.add("Alex", &emb(vec![0.999, 0.01])).unwrap_err();
        assert!(matches!(err, LibraryError::Duplicate { .. }));
        // same vector under another name is allowed
        lib.add("Sam", &emb(vec![1.0, 0.0])).unwrap();
        // a genuinely different sample of the same person is allowed
        lib.add("Alex", &emb(vec![0.8, 0.6])).unwrap();
        assert_eq!(lib.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_rejects_empty_input() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        assert!(matches!(lib.add("  ", &emb(vec![1.0])), Err(LibraryError::EmptyName)));
        assert!(matches!(lib.add("Alex", &emb(vec![])), Err(LibraryError::EmptyEmbedding)));
    }

    #[test]
    fn test_remove_and_remove_name() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        let a = lib.add("Alex", &emb(vec![1.0, 0.0])).unwrap();
        lib.add("Alex", &emb(vec![0.0, 1.0])).unwrap();
        lib.add("Sam", &emb(vec![0.7, 0.7])).unwrap();

        assert!(lib.remove(&a).unwrap());
        assert!(!lib.remove(&a).unwrap());
        assert_eq!(lib.remove_name("Alex").unwrap(), 1);
        assert_eq!(lib.names().unwrap(), vec!["Sam".to_string()]);
    }

    #[test]
    fn test_list_sorted_by_name() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        lib.add("Sam", &emb(vec![1.0, 0.0])).unwrap();
        lib.add("Alex", &emb(vec![0.0, 1.0])).unwrap();
        let list = lib.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Alex");
        assert!(list[0].created_at <= Utc::now());
    }

    #[test]
    fn test_open_persists_to_file() {
        let path = std::env::temp_dir().join(format!("presence-lib-{}.db", uuid::Uuid::new_v4()));
        {
            let lib = FaceLibrary::open(&path).unwrap();
            lib.add("Alex", &emb(vec![1.0, 2.0])).unwrap();
        }
        let lib = FaceLibrary::open(&path).unwrap();
        assert_eq!(lib.names().unwrap(), vec!["Alex".to_string()]);
        drop(lib);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_row_skipped() {
        let lib = FaceLibrary::open_in_memory().unwrap();
        lib.add("Alex", &emb(vec![1.0, 0.0])).unwrap();
        lib.conn
            .execute(
                "INSERT INTO faces (id, name, embedding, model_version, created_at) VALUES ('bad', 'Sam', ?1, NULL, ?2)",
                params![vec![1u8, 2, 3], Utc::now().to_rfc3339()],
            )
            .unwrap();

        let entries = lib.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Alex");
        // still listed, so it can be removed
        assert_eq!(lib.list().unwrap().len(), 2);
        assert!(lib.remove("bad").unwrap());
    }

    #[test]
    fn test_decode_rejects_truncated_blob() {
        assert!(decode_embedding(&[0, 0, 128]).is_none());
        assert!(decode_embedding(&[]).is_none());
        assert_eq!(decode_embedding(&encode_embedding(&[1.5, -2.0])), Some(vec![1.5, -2.0]));
    }

    #[test]
    fn test_snapshot_swap_keeps_old_readers() {
        let snap = LibrarySnapshot::new(vec![LibraryEntry {
            id: "1".into(),
            name: "Alex".into(),
            embedding: emb(vec![1.0]),
        }]);
        let before = snap.load();
        assert_eq!(snap.replace(Vec::new()), 0);
        assert_eq!(before.len(), 1);
        assert!(snap.load().is_empty());
        assert!(snap.clone().load().is_empty());
    }
}
