//! Memory storage implementation using SQLite

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use crate::llm::SimilaritySearch;
use crate::memory::{MemoryKind, MemoryRecord, StyleProfile};
use crate::{Error, Result};

const STYLE_PROFILE_KEY: &str = "style-profile";

/// SQLite-backed store for cross-session facts
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Create a new MemoryStore with the given database path
    pub fn new(db_path: &str) -> Result<Self> {
        debug!("Opening memory database at: {}", db_path);
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        info!("MemoryStore initialized successfully");
        Ok(store)
    }

    /// Create an in-memory MemoryStore (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Initialize database tables
    fn init_tables(&self) -> Result<()> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner, kind, key)
            );
            CREATE TABLE IF NOT EXISTS memory_tags (
                record_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (record_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_owner ON memory_records(owner);
            CREATE INDEX IF NOT EXISTS idx_memory_tag ON memory_tags(tag);",
        )?;
        Ok(())
    }

    /// Insert or update the record identified by (owner, kind, key)
    ///
    /// The record keeps its id and creation time across updates; its tags are
    /// replaced by `tags` plus the kind's default tag.
    pub fn upsert(
        &self,
        owner: &str,
        kind: MemoryKind,
        key: &str,
        value: &JsonValue,
        tags: &[&str],
    ) -> Result<MemoryRecord> {
        if owner.trim().is_empty() || key.trim().is_empty() {
            return Err(Error::InvalidInput("memory owner and key must not be empty".into()));
        }
        let tags = normalize_tags(tags, kind);
        let now = Utc::now().to_rfc3339();
        let value_json = serde_json::to_string(value)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memory_records (id, owner, kind, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(owner, kind, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                owner,
                kind.as_str(),
                key,
                value_json,
                now
            ],
        )?;
        let id: String = tx.query_row(
            "SELECT id FROM memory_records WHERE owner = ?1 AND kind = ?2 AND key = ?3",
            params![owner, kind.as_str(), key],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM memory_tags WHERE record_id = ?1", params![id])?;
        for tag in &tags {
            tx.execute(
                "INSERT OR IGNORE INTO memory_tags (record_id, tag) VALUES (?1, ?2)",
                params![id, tag],
            )?;
        }
        tx.commit()?;
        drop(conn);

        debug!(owner, kind = kind.as_str(), key, "Memory record stored");
        self.get_by_id(&id)?
            .ok_or_else(|| Error::Other(format!("memory record {} vanished after upsert", id)))
    }

    /// Analyze samples and store them as the owner's style profile
    pub fn store_style_profile<S: AsRef<str>>(
        &self,
        owner: &str,
        samples: &[S],
        tags: &[&str],
    ) -> Result<MemoryRecord> {
        if samples.iter().all(|s| s.as_ref().trim().is_empty()) {
            return Err(Error::InvalidInput("style profile needs at least one non-empty sample".into()));
        }
        let profile = StyleProfile::analyze(samples);
        let value = serde_json::to_value(&profile)?;
        self.upsert(owner, MemoryKind::StyleProfile, STYLE_PROFILE_KEY, &value, tags)
    }

    /// The owner's style profile, if one was stored
    pub fn style_profile(&self, owner: &str) -> Result<Option<StyleProfile>> {
        match self.get(owner, MemoryKind::StyleProfile, STYLE_PROFILE_KEY)? {
            Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
            None => Ok(None),
        }
    }

    pub fn store_glossary_term(
        &self,
        owner: &str,
        term: &str,
        definition: &str,
        tags: &[&str],
    ) -> Result<MemoryRecord> {
        let term = term.trim();
        let value = json!({ "term": term, "definition": definition.trim() });
        self.upsert(owner, MemoryKind::GlossaryTerm, term, &value, tags)
    }

    pub fn store_generic(
        &self,
        owner: &str,
        key: &str,
        value: &JsonValue,
        tags: &[&str],
    ) -> Result<MemoryRecord> {
        self.upsert(owner, MemoryKind::Generic, key, value, tags)
    }

    pub fn get(&self, owner: &str, kind: MemoryKind, key: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT id, owner, kind, key, value, created_at, updated_at FROM memory_records
                 WHERE owner = ?1 AND kind = ?2 AND key = ?3",
                params![owner, kind.as_str(), key],
                row_to_record,
            )
            .optional()?;
        match record {
            Some(mut record) => {
                record.tags = load_tags(&conn, &record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.lock();
        let result = conn.query_row(
            "SELECT id, owner, kind, key, value, created_at, updated_at FROM memory_records WHERE id = ?1",
            params![id],
            row_to_record,
        );
        match result {
            Ok(mut record) => {
                record.tags = load_tags(&conn, &record.id)?;
                Ok(Some(record))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Records of `owner` carrying any of `tags`; all of the owner's records when `tags` is empty
    ///
    /// Most recently updated first. An empty result is not an error.
    pub fn load(&self, owner: &str, tags: &[&str]) -> Result<Vec<MemoryRecord>> {
        let wanted: Vec<String> = tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let conn = self.lock();
        let mut records = if wanted.is_empty() {
            let mut stmt = conn.prepare(
                "SELECT id, owner, kind, key, value, created_at, updated_at FROM memory_records
                 WHERE owner = ?1 ORDER BY updated_at DESC",
            )?;
            stmt.query_map(params![owner], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let placeholders: Vec<String> = (0..wanted.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = format!(
                "SELECT DISTINCT r.id, r.owner, r.kind, r.key, r.value, r.created_at, r.updated_at
                 FROM memory_records r JOIN memory_tags t ON t.record_id = r.id
                 WHERE r.owner = ?1 AND t.tag IN ({})
                 ORDER BY r.updated_at DESC",
                placeholders.join(", ")
            );
            let mut args = Vec::with_capacity(wanted.len() + 1);
            args.push(owner.to_string());
            args.extend(wanted);
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(params_from_iter(args.iter()), row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for record in &mut records {
            record.tags = load_tags(&conn, &record.id)?;
        }
        debug!(owner, count = records.len(), "Loaded memory records");
        Ok(records)
    }

    /// Records of `owner` ranked by an external similarity engine
    ///
    /// Ids the engine returns that are unknown or belong to another owner are skipped.
    pub async fn load_similar(
        &self,
        owner: &str,
        query: &str,
        k: usize,
        search: &dyn SimilaritySearch,
    ) -> Result<Vec<MemoryRecord>> {
        let ids = search.nearest(query, k).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_by_id(&id)? {
                if record.owner == owner {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Delete a record by id; returns whether it existed
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        conn.execute("DELETE FROM memory_tags WHERE record_id = ?1", params![id])?;
        let rows = conn.execute("DELETE FROM memory_records WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!("Deleted memory record with id: {}", id);
        }
        Ok(rows > 0)
    }

    /// Count records of an owner
    pub fn count(&self, owner: &str) -> Result<usize> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM memory_records WHERE owner = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn normalize_tags(tags: &[&str], kind: MemoryKind) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.push(kind.default_tag().to_string());
    out.sort();
    out.dedup();
    out
}

fn load_tags(conn: &Connection, record_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM memory_tags WHERE record_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![record_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tags)
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let kind_str: String = row.get(2)?;
    let value_str: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        kind: MemoryKind::parse(&kind_str).unwrap_or(MemoryKind::Generic),
        key: row.get(3)?,
        value: serde_json::from_str(&value_str).unwrap_or(JsonValue::Null),
        tags: Vec::new(),
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}
