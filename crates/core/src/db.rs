use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::backup::Progress as BackupProgress;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};

use crate::atomic::replace_with;
use crate::error::{Error, Result};
use crate::models::{CatalogEntry, MediaKind};

const UPLOAD_DATE_FORMAT: &str = "%Y-%m-%d";

const ENTRY_COLUMNS: &str = "id, filename, content_hash, path, size_bytes, linked, media_kind, \
     upload_date, download_date_secs, last_verified_secs";

/// Record-level primitives the sync engine needs from the catalog.
/// Mutators return `false` when no record had the given id.
pub trait CatalogStore {
    fn all_entries(&self) -> Result<Vec<CatalogEntry>>;
    fn get_entry(&self, id: &str) -> Result<Option<CatalogEntry>>;
    fn insert_entry(&self, entry: &CatalogEntry) -> Result<()>;
    fn update_entry_path(&self, id: &str, path: &str, filename: &str) -> Result<bool>;
    fn mark_linked(&self, id: &str, verified_at: DateTime<Utc>) -> Result<bool>;
    fn mark_unlinked(&self, id: &str) -> Result<bool>;
    fn update_fingerprint(&self, id: &str, content_hash: &str, size_bytes: u64) -> Result<bool>;
    fn delete_entry(&self, id: &str) -> Result<bool>;
    fn count_entries(&self) -> Result<u64>;
}

pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    /// Opens (creating if needed) a catalog file for direct, single-machine use.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Copies the catalog at `path` into a private in-memory database.
    /// Nothing is written to `path`.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::CatalogUnreadable {
                path: path.to_path_buf(),
                reason: "file does not exist".to_string(),
            });
        }

        let unreadable = |err: rusqlite::Error| Error::CatalogUnreadable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        let mut conn = Connection::open_in_memory()?;
        conn.restore(DatabaseName::Main, path, None::<fn(BackupProgress)>)
            .map_err(unreadable)?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get::<_, i64>(0))
            .map_err(unreadable)?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Writes the whole database to a temp file beside `path`, then renames it
    /// into place.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        replace_with(path, |tmp| {
            self.conn
                .backup(DatabaseName::Main, tmp, None)
                .map_err(Error::from)
        })
    }

    /// Whether any row was inserted, updated or deleted through this connection.
    pub fn has_changes(&self) -> Result<bool> {
        let changes: i64 = self
            .conn
            .query_row("SELECT total_changes()", [], |r| r.get(0))?;
        Ok(changes > 0)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
              id TEXT PRIMARY KEY NOT NULL,
              filename TEXT NOT NULL,
              content_hash TEXT,
              path TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              linked INTEGER NOT NULL DEFAULT 1,
              media_kind TEXT NOT NULL DEFAULT 'other',
              upload_date TEXT,
              download_date_secs INTEGER,
              last_verified_secs INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_entries_content_hash ON entries(content_hash);
            CREATE INDEX IF NOT EXISTS idx_entries_path ON entries(path);
            "#,
        )?;
        Ok(())
    }
}

impl CatalogStore for SqliteCatalog {
    fn all_entries(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTRY_COLUMNS} FROM entries ORDER BY path, id"))?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn get_entry(&self, id: &str) -> Result<Option<CatalogEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                [id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn insert_entry(&self, entry: &CatalogEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO entries (
              id, filename, content_hash, path, size_bytes, linked, media_kind,
              upload_date, download_date_secs, last_verified_secs
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                entry.id,
                entry.filename,
                entry.content_hash,
                entry.path,
                entry.size_bytes as i64,
                entry.linked,
                entry.media_kind.as_str(),
                entry
                    .upload_date
                    .map(|d| d.format(UPLOAD_DATE_FORMAT).to_string()),
                entry.download_date.map(|d| d.timestamp()),
                entry.last_verified_at.map(|d| d.timestamp()),
            ],
        )?;
        Ok(())
    }

    fn update_entry_path(&self, id: &str, path: &str, filename: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE entries SET path = ?2, filename = ?3 WHERE id = ?1",
            params![id, path, filename],
        )?;
        Ok(changed > 0)
    }

    fn mark_linked(&self, id: &str, verified_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE entries SET linked = 1, last_verified_secs = ?2 WHERE id = ?1",
            params![id, verified_at.timestamp()],
        )?;
        Ok(changed > 0)
    }

    fn mark_unlinked(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("UPDATE entries SET linked = 0 WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn update_fingerprint(&self, id: &str, content_hash: &str, size_bytes: u64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE entries SET content_hash = ?2, size_bytes = ?3 WHERE id = ?1",
            params![id, content_hash, size_bytes as i64],
        )?;
        Ok(changed > 0)
    }

    fn delete_entry(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM entries WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn count_entries(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn row_to_entry(r: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let size_bytes: i64 = r.get(4)?;
    let media_kind: String = r.get(6)?;
    let upload_date: Option<String> = r.get(7)?;
    let download_secs: Option<i64> = r.get(8)?;
    let verified_secs: Option<i64> = r.get(9)?;
    Ok(CatalogEntry {
        id: r.get(0)?,
        filename: r.get(1)?,
        content_hash: r.get(2)?,
        path: r.get(3)?,
        size_bytes: size_bytes.max(0) as u64,
        linked: r.get(5)?,
        media_kind: MediaKind::parse(&media_kind),
        upload_date: upload_date
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, UPLOAD_DATE_FORMAT).ok()),
        download_date: download_secs.and_then(secs_to_datetime),
        last_verified_at: verified_secs.and_then(secs_to_datetime),
    })
}

fn secs_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
