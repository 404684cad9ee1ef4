//! Steward persistence: the idempotency ledger mapping uid to the last
//! resourceVersion whose processing completed. SQLite file per resource type.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use steward_core::ResourceType;
use tracing::debug;

pub const DEFAULT_LOCATION: &str = "/tmp/persistence";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub uid: String,
    pub resource_version: String,
    /// Seconds since epoch of the last write.
    pub ts: i64,
}

/// Single-writer key/value ledger. A `put` is visible to the next `get` on the same handle.
pub trait VersionCache: Send + Sync {
    fn get(&self, uid: &str) -> Result<Option<String>>;
    fn put(&self, uid: &str, resource_version: &str) -> Result<()>;
    fn remove(&self, uid: &str) -> Result<()>;
    fn entries(&self) -> Result<Vec<CacheEntry>>;
    /// Drop every entry; returns how many were removed.
    fn clear(&self) -> Result<usize>;
}

/// SQLite-backed cache. Simple, synchronous; one connection guarded by a mutex.
pub struct SqliteVersionCache {
    db: Mutex<rusqlite::Connection>,
    path: PathBuf,
}

impl SqliteVersionCache {
    /// Open (creating directory and file if absent) the cache file for `ty` under `dir`.
    pub fn open_for(dir: impl AsRef<Path>, ty: &ResourceType) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("creating persistence dir {}", dir.display()))?;
        Self::open(dir.join(format!("{}.db", ty.cache_stem())))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let started = std::time::Instant::now();
        let path = path.into();
        let db = rusqlite::Connection::open(&path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resource_versions (
                uid  TEXT PRIMARY KEY,
                rv   TEXT NOT NULL,
                ts   INTEGER NOT NULL
            )",
            [],
        )
        .context("creating resource_versions table")?;
        debug!(path = %path.display(), "version cache opened");
        histogram!("steward_sqlite_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db), path })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("version cache lock poisoned"))
    }
}

impl VersionCache for SqliteVersionCache {
    fn get(&self, uid: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached("SELECT rv FROM resource_versions WHERE uid = ?1")?;
        let mut rows = stmt.query([uid])?;
        let rv = match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        };
        Ok(rv)
    }

    fn put(&self, uid: &str, resource_version: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO resource_versions(uid, rv, ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET rv = excluded.rv, ts = excluded.ts",
            (uid, resource_version, now_ts()),
        )?;
        tx.commit()?;
        histogram!("steward_sqlite_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("steward_sqlite_puts_total", 1u64);
        Ok(())
    }

    fn remove(&self, uid: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM resource_versions WHERE uid = ?1", [uid])?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT uid, rv, ts FROM resource_versions ORDER BY uid")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CacheEntry { uid: row.get(0)?, resource_version: row.get(1)?, ts: row.get(2)? });
        }
        Ok(out)
    }

    fn clear(&self) -> Result<usize> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM resource_versions", [])?)
    }
}

/// Process-local cache; forgets everything on restart.
#[derive(Default)]
pub struct MemoryVersionCache {
    map: Mutex<FxHashMap<String, (String, i64)>>,
}

impl MemoryVersionCache {
    pub fn new() -> Self { Self::default() }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, FxHashMap<String, (String, i64)>>> {
        self.map.lock().map_err(|_| anyhow!("version cache lock poisoned"))
    }
}

impl VersionCache for MemoryVersionCache {
    fn get(&self, uid: &str) -> Result<Option<String>> {
        Ok(self.map()?.get(uid).map(|(rv, _)| rv.clone()))
    }

    fn put(&self, uid: &str, resource_version: &str) -> Result<()> {
        self.map()?.insert(uid.to_string(), (resource_version.to_string(), now_ts()));
        Ok(())
    }

    fn remove(&self, uid: &str) -> Result<()> {
        self.map()?.remove(uid);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut out: Vec<CacheEntry> = self
            .map()?
            .iter()
            .map(|(uid, (rv, ts))| CacheEntry { uid: uid.clone(), resource_version: rv.clone(), ts: *ts })
            .collect();
        out.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(out)
    }

    fn clear(&self) -> Result<usize> {
        let mut map = self.map()?;
        let n = map.len();
        map.clear();
        Ok(n)
    }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
