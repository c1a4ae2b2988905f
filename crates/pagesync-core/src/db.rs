use crate::blocks::{content_hash, ParentRef, SyncedBlock};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache is not initialized")]
    NotInitialized,
}

pub struct CacheDb {
    conn: Connection,
}

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init",
        up: "CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                icon TEXT,
                parent_type TEXT NOT NULL DEFAULT 'workspace',
                parent_id TEXT,
                open_count INTEGER NOT NULL DEFAULT 0,
                last_opened_at INTEGER,
                created_at INTEGER DEFAULT (strftime('%s','now')),
                updated_at INTEGER DEFAULT (strftime('%s','now'))
            );

            CREATE TABLE IF NOT EXISTS page_content (
                page_id TEXT PRIMARY KEY,
                blocks_json TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                block_count INTEGER NOT NULL,
                fetched_at INTEGER NOT NULL,
                FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS block_hashes (
                block_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                block_type TEXT NOT NULL,
                PRIMARY KEY (page_id, block_id),
                FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                page_id TEXT PRIMARY KEY,
                last_pushed_hash TEXT,
                last_pushed_at INTEGER,
                FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS block_hashes_page
              ON block_hashes(page_id);
            CREATE INDEX IF NOT EXISTS pages_last_opened
              ON pages(last_opened_at);",
    },
    Migration {
        version: 2,
        name: "soft_delete",
        up: "ALTER TABLE pages ADD COLUMN deleted_at INTEGER;",
    },
];

/// Cached page metadata. `open_count` and `last_opened_at` are only written by
/// [`CacheDb::record_open`].
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub id: String,
    pub title: String,
    pub icon: Option<String>,
    pub parent: ParentRef,
    pub open_count: i64,
    pub last_opened_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl PageRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            icon: None,
            parent: ParentRef::Workspace,
            open_count: 0,
            last_opened_at: None,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedContent {
    pub blocks: Vec<SyncedBlock>,
    pub content_hash: String,
    pub block_count: usize,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentWrite {
    Written { hash: String },
    /// The stored hash already matched; only `fetched_at` moved.
    Unchanged { hash: String },
}

impl ContentWrite {
    pub fn hash(&self) -> &str {
        match self {
            ContentWrite::Written { hash } | ContentWrite::Unchanged { hash } => hash,
        }
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl CacheDb {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self::with_connection(conn)?;
        db.run_migrations()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self, CacheError> {
        let db = Self::with_connection(Connection::open_in_memory()?)?;
        db.run_migrations()?;
        Ok(db)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<(), CacheError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
            );",
        )?;

        let current_version: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        for migration in MIGRATIONS {
            if migration.version > current_version {
                let tx = self.conn.unchecked_transaction()?;
                tx.execute_batch(migration.up)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                    params![migration.version, migration.name],
                )?;
                tx.commit()?;
                debug!(version = migration.version, name = migration.name, "applied migration");
            }
        }

        Ok(())
    }

    /// Upserts page metadata in place. Content, block hashes and sync state hang
    /// off this row through cascading keys, so it is never deleted and re-inserted.
    /// Saving a soft-deleted page revives it.
    pub fn save_page(&self, page: &PageRecord) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO pages (id, title, icon, parent_type, parent_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s','now'))
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                icon = excluded.icon,
                parent_type = excluded.parent_type,
                parent_id = excluded.parent_id,
                updated_at = excluded.updated_at,
                deleted_at = NULL",
            params![
                page.id,
                page.title,
                page.icon,
                page.parent.type_name(),
                page.parent.id()
            ],
        )?;
        Ok(())
    }

    /// Bumps the open counter. Returns false when the page is not cached.
    pub fn record_open(&self, page_id: &str) -> Result<bool, CacheError> {
        let changed = self.conn.execute(
            "UPDATE pages SET open_count = open_count + 1, last_opened_at = ?2 WHERE id = ?1",
            params![page_id, now_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_page(&self, page_id: &str) -> Result<Option<PageRecord>, CacheError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, title, icon, parent_type, parent_id, open_count, last_opened_at,
                        deleted_at
                 FROM pages WHERE id = ?1",
                [page_id],
                |row| {
                    let parent_type: String = row.get(3)?;
                    Ok(PageRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        icon: row.get(2)?,
                        parent: ParentRef::from_parts(&parent_type, row.get(4)?),
                        open_count: row.get(5)?,
                        last_opened_at: row.get(6)?,
                        deleted_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn has_page(&self, page_id: &str) -> Result<bool, CacheError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM pages WHERE id = ?1 AND deleted_at IS NULL",
                [page_id],
                |_row| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn has_content(&self, page_id: &str) -> Result<bool, CacheError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM page_content pc
                 JOIN pages p ON p.id = pc.page_id
                 WHERE pc.page_id = ?1 AND p.deleted_at IS NULL",
                [page_id],
                |_row| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Stores the canonical post-sync block sequence. When the hash matches what is
    /// stored the content write is skipped.
    pub fn save_content(
        &self,
        page_id: &str,
        blocks: &[SyncedBlock],
    ) -> Result<ContentWrite, CacheError> {
        let hash = content_hash(blocks);
        let now = now_millis();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO pages (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
            [page_id],
        )?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM page_content WHERE page_id = ?1",
                [page_id],
                |row| row.get(0),
            )
            .optional()?;
        if stored.as_deref() == Some(hash.as_str()) {
            tx.execute(
                "UPDATE page_content SET fetched_at = ?2 WHERE page_id = ?1",
                params![page_id, now],
            )?;
            tx.commit()?;
            debug!(page_id, "content unchanged, write skipped");
            return Ok(ContentWrite::Unchanged { hash });
        }

        let blocks_json = serde_json::to_string(blocks)?;
        tx.execute(
            "INSERT INTO page_content (page_id, blocks_json, content_hash, block_count, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(page_id) DO UPDATE SET
                blocks_json = excluded.blocks_json,
                content_hash = excluded.content_hash,
                block_count = excluded.block_count,
                fetched_at = excluded.fetched_at",
            params![page_id, blocks_json, hash, blocks.len() as i64, now],
        )?;

        {
            let mut upsert = tx.prepare(
                "INSERT INTO block_hashes (block_id, page_id, content_hash, block_type)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(page_id, block_id) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    block_type = excluded.block_type",
            )?;
            for block in blocks {
                upsert.execute(params![
                    block.id,
                    page_id,
                    block.content_hash(),
                    block.kind.type_name()
                ])?;
            }

            let live: HashSet<&str> = blocks.iter().map(|block| block.id.as_str()).collect();
            let mut existing = tx.prepare("SELECT block_id FROM block_hashes WHERE page_id = ?1")?;
            let stored_ids = existing
                .query_map([page_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            let mut remove =
                tx.prepare("DELETE FROM block_hashes WHERE page_id = ?1 AND block_id = ?2")?;
            for stale in stored_ids.iter().filter(|id| !live.contains(id.as_str())) {
                remove.execute(params![page_id, stale])?;
            }
        }

        tx.commit()?;
        debug!(page_id, blocks = blocks.len(), "content written");
        Ok(ContentWrite::Written { hash })
    }

    pub fn get_content(&self, page_id: &str) -> Result<Option<CachedContent>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT pc.blocks_json, pc.content_hash, pc.block_count, pc.fetched_at
                 FROM page_content pc
                 JOIN pages p ON p.id = pc.page_id
                 WHERE pc.page_id = ?1 AND p.deleted_at IS NULL",
                [page_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((blocks_json, content_hash, block_count, fetched_at)) = row else {
            return Ok(None);
        };
        Ok(Some(CachedContent {
            blocks: serde_json::from_str(&blocks_json)?,
            content_hash,
            block_count: usize::try_from(block_count).unwrap_or_default(),
            fetched_at,
        }))
    }

    /// Time since the content row was written, or `None` without content.
    pub fn get_cache_age(&self, page_id: &str) -> Result<Option<Duration>, CacheError> {
        self.get_cache_age_at(page_id, now_millis())
    }

    pub fn get_cache_age_at(
        &self,
        page_id: &str,
        now_millis: i64,
    ) -> Result<Option<Duration>, CacheError> {
        let fetched_at: Option<i64> = self
            .conn
            .query_row(
                "SELECT pc.fetched_at FROM page_content pc
                 JOIN pages p ON p.id = pc.page_id
                 WHERE pc.page_id = ?1 AND p.deleted_at IS NULL",
                [page_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fetched_at.map(|fetched_at| {
            Duration::from_millis(u64::try_from(now_millis - fetched_at).unwrap_or(0))
        }))
    }

    /// Block id to content hash as of the last content write.
    pub fn block_hashes(&self, page_id: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_id, content_hash FROM block_hashes WHERE page_id = ?1")?;
        let rows = stmt.query_map([page_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<String, String>>>()?)
    }

    pub fn mark_pushed(&self, page_id: &str, hash: &str) -> Result<(), CacheError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO pages (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
            [page_id],
        )?;
        tx.execute(
            "INSERT INTO sync_state (page_id, last_pushed_hash, last_pushed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(page_id) DO UPDATE SET
                last_pushed_hash = excluded.last_pushed_hash,
                last_pushed_at = excluded.last_pushed_at",
            params![page_id, hash, now_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn last_pushed_hash(&self, page_id: &str) -> Result<Option<String>, CacheError> {
        let hash = self
            .conn
            .query_row(
                "SELECT last_pushed_hash FROM sync_state WHERE page_id = ?1",
                [page_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(hash.flatten())
    }

    /// Soft delete: the row and its content stay until [`CacheDb::purge_page`].
    pub fn remove_page(&self, page_id: &str) -> Result<bool, CacheError> {
        let changed = self.conn.execute(
            "UPDATE pages SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![page_id, now_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn purge_page(&self, page_id: &str) -> Result<bool, CacheError> {
        let changed = self
            .conn
            .execute("DELETE FROM pages WHERE id = ?1", [page_id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockKind, TextRun};
    use tempfile::tempdir;

    fn setup_db() -> CacheDb {
        CacheDb::new_in_memory().expect("db init")
    }

    fn table_exists(db: &CacheDb, name: &str) -> bool {
        db.conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_row| Ok(1),
            )
            .is_ok()
    }

    fn count(db: &CacheDb, table: &str, page_id: &str) -> i64 {
        let allowed = match table {
            "page_content" | "block_hashes" | "sync_state" => table,
            _ => panic!("unsupported table name"),
        };
        db.conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {allowed} WHERE page_id = ?1"),
                [page_id],
                |row| row.get(0),
            )
            .expect("count")
    }

    fn blocks() -> Vec<SyncedBlock> {
        vec![
            SyncedBlock::new("b1", BlockKind::heading(1), vec![TextRun::plain("Title")]),
            SyncedBlock::new("b2", BlockKind::Paragraph, vec![TextRun::plain("Body")]),
        ]
    }

    #[test]
    fn migrations_create_schema() {
        let db = setup_db();
        for table in ["pages", "page_content", "block_hashes", "sync_state"] {
            assert!(table_exists(&db, table), "missing table {table}");
        }
    }

    #[test]
    fn migrations_run_once() {
        let db = setup_db();
        db.run_migrations().expect("second run");
        let applied: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn refreshing_page_metadata_keeps_content_rows() {
        let db = setup_db();
        db.save_page(&PageRecord::new("p1", "Draft")).expect("save page");
        db.save_content("p1", &blocks()).expect("save content");
        assert_eq!(count(&db, "page_content", "p1"), 1);
        assert_eq!(count(&db, "block_hashes", "p1"), 2);

        let mut renamed = PageRecord::new("p1", "Final");
        renamed.icon = Some("📄".to_string());
        db.save_page(&renamed).expect("upsert page");

        assert_eq!(count(&db, "page_content", "p1"), 1);
        assert_eq!(count(&db, "block_hashes", "p1"), 2);
        let page = db.get_page("p1").expect("get").expect("page row");
        assert_eq!(page.title, "Final");
        assert_eq!(page.icon.as_deref(), Some("📄"));
    }

    #[test]
    fn save_page_preserves_open_count() {
        let db = setup_db();
        db.save_page(&PageRecord::new("p1", "Draft")).expect("save page");
        assert!(db.record_open("p1").expect("open"));
        assert!(db.record_open("p1").expect("open"));
        db.save_page(&PageRecord::new("p1", "Draft")).expect("save page");

        let page = db.get_page("p1").expect("get").expect("page row");
        assert_eq!(page.open_count, 2);
        assert!(page.last_opened_at.is_some());
        assert!(!db.record_open("missing").expect("open missing"));
    }

    #[test]
    fn parent_reference_round_trips() {
        let db = setup_db();
        let mut page = PageRecord::new("p1", "Child");
        page.parent = ParentRef::Page {
            id: "root".to_string(),
        };
        db.save_page(&page).expect("save page");
        assert_eq!(db.get_page("p1").expect("get"), Some(page));
    }

    #[test]
    fn save_content_skips_unchanged_hash() {
        let db = setup_db();
        let first = db.save_content("p1", &blocks()).expect("first write");
        let second = db.save_content("p1", &blocks()).expect("second write");

        assert!(matches!(first, ContentWrite::Written { .. }));
        assert_eq!(
            second,
            ContentWrite::Unchanged {
                hash: first.hash().to_string()
            }
        );
        assert!(db.has_page("p1").expect("has page"));
    }

    #[test]
    fn get_content_returns_blocks_and_hash() {
        let db = setup_db();
        let written = db.save_content("p1", &blocks()).expect("save content");

        let cached = db.get_content("p1").expect("get").expect("content");
        assert_eq!(cached.blocks, blocks());
        assert_eq!(cached.content_hash, written.hash());
        assert_eq!(cached.block_count, 2);
        assert!(db.get_content("missing").expect("get missing").is_none());
    }

    #[test]
    fn stale_block_hashes_are_dropped() {
        let db = setup_db();
        db.save_content("p1", &blocks()).expect("save content");
        let remaining = vec![blocks()[1].clone()];
        db.save_content("p1", &remaining).expect("save content");

        let hashes = db.block_hashes("p1").expect("hashes");
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes.get("b2"), Some(&remaining[0].content_hash()));
    }

    #[test]
    fn cache_age_counts_from_write() {
        let db = setup_db();
        assert_eq!(db.get_cache_age("p1").expect("age"), None);

        db.save_content("p1", &blocks()).expect("save content");
        let fetched_at = db.get_content("p1").expect("get").expect("content").fetched_at;
        let age = db
            .get_cache_age_at("p1", fetched_at + 1_500)
            .expect("age")
            .expect("some age");
        assert_eq!(age, Duration::from_millis(1_500));
    }

    #[test]
    fn soft_delete_hides_page_until_saved_again() {
        let db = setup_db();
        db.save_page(&PageRecord::new("p1", "Draft")).expect("save page");
        db.save_content("p1", &blocks()).expect("save content");

        assert!(db.remove_page("p1").expect("remove"));
        assert!(!db.has_page("p1").expect("has page"));
        assert!(!db.has_content("p1").expect("has content"));
        assert_eq!(count(&db, "page_content", "p1"), 1);

        db.save_page(&PageRecord::new("p1", "Draft")).expect("revive");
        assert!(db.has_content("p1").expect("has content"));
    }

    #[test]
    fn removed_page_has_no_cache_age() {
        let db = setup_db();
        db.save_content("p1", &blocks()).expect("save content");
        assert!(db.get_cache_age("p1").expect("age").is_some());

        db.remove_page("p1").expect("remove");
        assert_eq!(db.get_cache_age("p1").expect("age"), None);

        db.save_page(&PageRecord::new("p1", "Draft")).expect("revive");
        assert!(db.get_cache_age("p1").expect("age").is_some());
    }

    #[test]
    fn purge_cascades_to_owned_rows() {
        let db = setup_db();
        db.save_content("p1", &blocks()).expect("save content");
        db.mark_pushed("p1", "abc").expect("mark pushed");

        assert!(db.purge_page("p1").expect("purge"));
        assert_eq!(count(&db, "page_content", "p1"), 0);
        assert_eq!(count(&db, "block_hashes", "p1"), 0);
        assert_eq!(count(&db, "sync_state", "p1"), 0);
    }

    #[test]
    fn mark_pushed_overwrites_previous_hash() {
        let db = setup_db();
        assert_eq!(db.last_pushed_hash("p1").expect("hash"), None);
        db.mark_pushed("p1", "one").expect("mark");
        db.mark_pushed("p1", "two").expect("mark");
        assert_eq!(db.last_pushed_hash("p1").expect("hash").as_deref(), Some("two"));
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("cache.db");
        {
            let db = CacheDb::open(&path).expect("open");
            db.save_content("p1", &blocks()).expect("save content");
        }
        let reopened = CacheDb::open(&path).expect("reopen");
        assert!(reopened.has_content("p1").expect("has content"));
    }
}
