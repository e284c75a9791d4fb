//! Persistent offline store
//!
//! Two independent record collections live in one SQLite database:
//! - `audio`: one row per (reciter, verse) recitation payload, with secondary
//!   indexes by reciter, by chapter and by (reciter, chapter).
//! - `text_pages`: one row per (page, language) rendered page payload, indexed
//!   by page number.
//!
//! The store is a cache, never the source of truth. It does not retry; callers
//! decide what a failure means for them.

use crate::error::{MaktabError, Result};
use crate::quran::{ChapterId, PageNumber, QuranPage, ReciterId, VerseKey};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Schema migrations, applied in order and tracked through `PRAGMA user_version`.
///
/// Additive only: a migration may create tables, indexes or columns but must
/// never drop or rewrite existing records.
const MIGRATIONS: &[&str] = &[
    // v1: audio payloads and text pages
    r#"
    CREATE TABLE IF NOT EXISTS audio (
        reciter_id INTEGER NOT NULL,
        verse_key TEXT NOT NULL,
        chapter_id INTEGER NOT NULL,
        verse_number INTEGER NOT NULL,
        payload BLOB NOT NULL,
        downloaded_at TEXT NOT NULL,
        PRIMARY KEY (reciter_id, verse_key)
    );

    CREATE INDEX IF NOT EXISTS idx_audio_reciter ON audio(reciter_id);
    CREATE INDEX IF NOT EXISTS idx_audio_chapter ON audio(chapter_id);
    CREATE INDEX IF NOT EXISTS idx_audio_reciter_chapter ON audio(reciter_id, chapter_id);

    CREATE TABLE IF NOT EXISTS text_pages (
        page_number INTEGER NOT NULL,
        lang TEXT NOT NULL,
        payload TEXT NOT NULL,
        cached_at TEXT NOT NULL,
        PRIMARY KEY (page_number, lang)
    );

    CREATE INDEX IF NOT EXISTS idx_text_pages_page ON text_pages(page_number);
    "#,
    // v2: payload digests; rows written before this version keep a NULL digest
    r#"
    ALTER TABLE audio ADD COLUMN payload_sha256 TEXT;
    "#,
];

pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

/// `PRAGMA auto_vacuum` value for INCREMENTAL.
const AUTO_VACUUM_INCREMENTAL: i64 = 2;

/// A downloaded recitation of one verse by one reciter.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRecord {
    pub reciter_id: ReciterId,
    pub verse_key: VerseKey,
    pub payload: Vec<u8>,
    pub downloaded_at: DateTime<Utc>,
}

impl AudioRecord {
    pub fn new(reciter_id: ReciterId, verse_key: VerseKey, payload: Vec<u8>) -> Self {
        Self {
            reciter_id,
            verse_key,
            payload,
            downloaded_at: Utc::now(),
        }
    }

    pub fn chapter_id(&self) -> ChapterId {
        self.verse_key.chapter
    }
}

/// A cached page in one translation language.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPageRecord {
    pub page_number: PageNumber,
    pub lang: String,
    pub page: QuranPage,
    pub cached_at: DateTime<Utc>,
}

impl TextPageRecord {
    pub fn new(lang: impl Into<String>, page: QuranPage) -> Self {
        Self {
            page_number: page.page_number,
            lang: lang.into(),
            page,
            cached_at: Utc::now(),
        }
    }
}

/// Raw size figures for the storage accountant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSize {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
}

/// Record counts, for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub audio_records: u64,
    pub text_pages: u64,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Handle to the offline database.
///
/// Construct once and share behind an `Arc`. The connection is opened lazily
/// on first use; concurrent first calls all await the same initialization.
pub struct Store {
    location: Location,
    quota_bytes: Option<u64>,
    conn: OnceCell<Arc<Mutex<Connection>>>,
}

impl Store {
    /// Store backed by a database file, created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_location(Location::File(path.into()))
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self::with_location(Location::Memory)
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            quota_bytes: None,
            conn: OnceCell::new(),
        }
    }

    /// Cap the database size. Writes that would grow past it fail with
    /// [`MaktabError::QuotaExceeded`].
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Open the database and bring the schema up to date.
    ///
    /// Idempotent. A failed open leaves the handle unopened so a later call
    /// can try again.
    pub async fn open(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                let location = self.location.clone();
                let quota_bytes = self.quota_bytes;
                async move {
                    let conn = tokio::task::spawn_blocking(move || open_connection(&location, quota_bytes))
                        .await
                        .map_err(|e| MaktabError::Open(format!("Task join error: {}", e)))??;
                    Ok::<_, MaktabError>(Arc::new(Mutex::new(conn)))
                }
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// Run a closure against the connection on the blocking thread pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MaktabError::Transaction("Store lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| MaktabError::Transaction(format!("Task join error: {}", e)))?
    }

    // ============ Audio ============

    pub async fn put_audio(&self, record: AudioRecord) -> Result<()> {
        self.run(move |conn| {
            let digest = hex::encode(Sha256::digest(&record.payload));
            conn.execute(
                "INSERT OR REPLACE INTO audio
                    (reciter_id, verse_key, chapter_id, verse_number, payload, downloaded_at, payload_sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.reciter_id,
                    record.verse_key.to_string(),
                    record.chapter_id(),
                    record.verse_key.verse,
                    record.payload,
                    record.downloaded_at.to_rfc3339(),
                    digest,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Stored payload for a verse. A payload whose digest no longer matches is
    /// reported as absent.
    pub async fn get_audio(&self, reciter_id: ReciterId, verse_key: VerseKey) -> Result<Option<Vec<u8>>> {
        self.run(move |conn| {
            let row: Option<(Vec<u8>, Option<String>)> = conn
                .query_row(
                    "SELECT payload, payload_sha256 FROM audio WHERE reciter_id = ?1 AND verse_key = ?2",
                    params![reciter_id, verse_key.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            Ok(row.and_then(|(payload, digest)| match digest {
                Some(expected) if hex::encode(Sha256::digest(&payload)) != expected => {
                    warn!(reciter_id, %verse_key, "stored audio failed digest check, ignoring");
                    None
                }
                _ => Some(payload),
            }))
        })
        .await
    }

    pub async fn has_audio(&self, reciter_id: ReciterId, verse_key: VerseKey) -> Result<bool> {
        self.run(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM audio WHERE reciter_id = ?1 AND verse_key = ?2)",
                params![reciter_id, verse_key.to_string()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    pub async fn list_downloaded_verses(
        &self,
        reciter_id: ReciterId,
        chapter_id: ChapterId,
    ) -> Result<BTreeSet<VerseKey>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chapter_id, verse_number FROM audio WHERE reciter_id = ?1 AND chapter_id = ?2",
            )?;
            let keys = stmt
                .query_map(params![reciter_id, chapter_id], |row| {
                    Ok(VerseKey::new(row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(keys)
        })
        .await
    }

    /// Chapters with at least one stored verse for this reciter.
    pub async fn list_downloaded_chapters(&self, reciter_id: ReciterId) -> Result<BTreeSet<ChapterId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT chapter_id FROM audio WHERE reciter_id = ?1")?;
            let chapters = stmt
                .query_map(params![reciter_id], |row| row.get(0))?
                .collect::<rusqlite::Result<BTreeSet<ChapterId>>>()?;
            Ok(chapters)
        })
        .await
    }

    /// Remove every stored verse of one chapter for one reciter. Returns the
    /// number of records removed; zero is not an error.
    pub async fn delete_chapter_audio(&self, reciter_id: ReciterId, chapter_id: ChapterId) -> Result<usize> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM audio WHERE reciter_id = ?1 AND chapter_id = ?2",
                params![reciter_id, chapter_id],
            )?;
            if removed > 0 {
                reclaim_free_pages(conn)?;
            }
            Ok(removed)
        })
        .await
    }

    // ============ Text pages ============

    pub async fn put_text_page(&self, record: TextPageRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.page)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO text_pages (page_number, lang, payload, cached_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.page_number, record.lang, payload, record.cached_at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_text_page(&self, page_number: PageNumber, lang: &str) -> Result<Option<QuranPage>> {
        let lang = lang.to_string();
        let payload: Option<String> = self
            .run(move |conn| {
                let payload = conn
                    .query_row(
                        "SELECT payload FROM text_pages WHERE page_number = ?1 AND lang = ?2",
                        params![page_number, lang],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(payload)
            })
            .await?;

        payload
            .map(|json| serde_json::from_str(&json).map_err(MaktabError::from))
            .transpose()
    }

    // ============ Maintenance ============

    /// Drop every audio and text record in one transaction.
    pub async fn clear_all(&self) -> Result<()> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM audio", [])?;
            tx.execute("DELETE FROM text_pages", [])?;
            tx.commit()?;
            reclaim_free_pages(conn)?;
            Ok(())
        })
        .await?;
        info!("cleared offline store");
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.run(|conn| {
            let audio_records: i64 = conn.query_row("SELECT COUNT(*) FROM audio", [], |row| row.get(0))?;
            let text_pages: i64 = conn.query_row("SELECT COUNT(*) FROM text_pages", [], |row| row.get(0))?;
            Ok(StoreStats {
                audio_records: audio_records as u64,
                text_pages: text_pages as u64,
            })
        })
        .await
    }

    /// Bytes held by live records (free pages excluded), and the enforced cap
    /// if one is set.
    pub async fn size(&self) -> Result<StoreSize> {
        let has_quota = self.quota_bytes.is_some();
        self.run(move |conn| {
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let free_pages: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            let page_size = page_size as u64;
            let page_count = page_count.saturating_sub(free_pages).max(0) as u64;
            let quota_bytes = if has_quota {
                let max_pages: i64 = conn.query_row("PRAGMA max_page_count", [], |row| row.get(0))?;
                Some(max_pages as u64 * page_size)
            } else {
                None
            };
            Ok(StoreSize {
                used_bytes: page_count * page_size,
                quota_bytes,
            })
        })
        .await
    }
}

fn open_connection(location: &Location, quota_bytes: Option<u64>) -> Result<Connection> {
    let open_err = |e: rusqlite::Error| MaktabError::Open(e.to_string());

    let mut conn = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| MaktabError::Open(format!("Failed to create {:?}: {}", parent, e)))?;
            }
            Connection::open(path).map_err(open_err)?
        }
        Location::Memory => Connection::open_in_memory().map_err(open_err)?,
    };

    conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
    enable_incremental_vacuum(&conn).map_err(open_err)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )
    .map_err(open_err)?;

    migrate(&mut conn).map_err(open_err)?;

    if let Some(quota) = quota_bytes {
        apply_quota(&conn, quota).map_err(open_err)?;
    }

    debug!(?location, "offline store opened");
    Ok(conn)
}

/// Switch the database to incremental auto-vacuum so deleted payloads can be
/// handed back to the filesystem.
///
/// The pragma only takes effect before the first table exists; databases
/// created without it are rebuilt once with `VACUUM`.
fn enable_incremental_vacuum(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL")?;
    let mode: i64 = conn.query_row("PRAGMA auto_vacuum", [], |row| row.get(0))?;
    if mode != AUTO_VACUUM_INCREMENTAL {
        conn.execute_batch("VACUUM")?;
        info!("rebuilt offline store for incremental vacuum");
    }
    Ok(())
}

/// Return free pages to the filesystem after a bulk delete.
fn reclaim_free_pages(conn: &Connection) -> rusqlite::Result<()> {
    // Each step releases pages; stepping once is not enough
    let mut stmt = conn.prepare("PRAGMA incremental_vacuum")?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

/// Apply pending migrations, each in its own transaction.
fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        tx.commit()?;
        info!(version, "applied offline store migration");
    }

    Ok(())
}

fn apply_quota(conn: &Connection, quota_bytes: u64) -> rusqlite::Result<()> {
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    let max_pages = (quota_bytes / (page_size.max(1) as u64)).max(1);
    // SQLite never lowers the limit below the current page count
    let applied: i64 = conn.query_row(&format!("PRAGMA max_page_count = {}", max_pages), [], |row| row.get(0))?;
    debug!(quota_bytes, max_pages = applied, "applied store quota");
    Ok(())
}
