//! Stitch persistence: SQLite implementation of the key-value and set contracts.
//! One connection behind a mutex; every call is a short statement or transaction.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use stitch_store::{Kv, SetOptions, SetStore, StorageError};
use tracing::{debug, info};

pub struct SqliteStorage {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStorage {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("STITCH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, took_ms = %started.elapsed().as_millis(), "persist: sqlite opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        ).context("creating kv table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS set_members (
                key    BLOB NOT NULL,
                member BLOB NOT NULL,
                PRIMARY KEY (key, member)
            )",
            [],
        ).context("creating set_members table")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn backend(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn check_key(key: &[u8]) -> Result<(), StorageError> {
    if key.is_empty() { Err(StorageError::EmptyKey) } else { Ok(()) }
}

fn ms(started: Instant) -> f64 { started.elapsed().as_secs_f64() * 1000.0 }

impl Kv for SqliteStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        let started = Instant::now();
        let db = self.conn();
        let value = db
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(backend)?;
        histogram!("persist_kv_get_ms", ms(started));
        Ok(value)
    }

    fn set(&self, key: &[u8], value: &[u8], opts: SetOptions) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        let started = Instant::now();
        let mut db = self.conn();
        let tx = db.transaction().map_err(backend)?;
        let previous = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(backend)?;
        if !(opts.skip_if_exists && previous.is_some()) {
            tx.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            ).map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        histogram!("persist_kv_set_ms", ms(started));
        counter!("persist_kv_set_total", 1u64);
        Ok(if opts.return_previous { previous } else { None })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        let started = Instant::now();
        self.conn().execute("DELETE FROM kv WHERE key = ?1", [key]).map_err(backend)?;
        histogram!("persist_kv_delete_ms", ms(started));
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.conn()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()
            .map_err(backend)?;
        debug!("persist: wal checkpoint done");
        Ok(())
    }
}

impl SetStore for SqliteStorage {
    fn add(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        let started = Instant::now();
        self.conn()
            .execute("INSERT OR IGNORE INTO set_members(key, member) VALUES (?1, ?2)", params![key, value])
            .map_err(backend)?;
        histogram!("persist_set_add_ms", ms(started));
        Ok(())
    }

    fn all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        check_key(key)?;
        let started = Instant::now();
        let db = self.conn();
        let mut stmt = db
            .prepare_cached("SELECT member FROM set_members WHERE key = ?1 ORDER BY rowid")
            .map_err(backend)?;
        let mut rows = stmt.query([key]).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            out.push(row.get::<_, Vec<u8>>(0).map_err(backend)?);
        }
        histogram!("persist_set_all_ms", ms(started));
        Ok(out)
    }

    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.conn()
            .execute("DELETE FROM set_members WHERE key = ?1 AND member = ?2", params![key, value])
            .map_err(backend)?;
        Ok(())
    }

    fn drop_all(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        let started = Instant::now();
        self.conn().execute("DELETE FROM set_members WHERE key = ?1", [key]).map_err(backend)?;
        histogram!("persist_set_drop_ms", ms(started));
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Kv::flush(self)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".stitch");
        let _ = std::fs::create_dir_all(&p);
        p.push("stitch.db");
        return p.to_string_lossy().to_string();
    }
    "stitch.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("stitch-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn kv_claim_and_overwrite() {
        let s = SqliteStorage::open(&temp_db()).unwrap();
        let claim = SetOptions::default().skip_if_exists().return_previous();
        assert_eq!(s.set(b"ids.session_stamp.x", b"a", claim).unwrap(), None);
        assert_eq!(s.set(b"ids.session_stamp.x", b"b", claim).unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(Kv::get(&s, b"ids.session_stamp.x").unwrap().as_deref(), Some(&b"a"[..]));

        s.set(b"ids.session_stamp.x", b"c", SetOptions::default()).unwrap();
        assert_eq!(Kv::get(&s, b"ids.session_stamp.x").unwrap().as_deref(), Some(&b"c"[..]));
        Kv::delete(&s, b"ids.session_stamp.x").unwrap();
        assert_eq!(Kv::get(&s, b"ids.session_stamp.x").unwrap(), None);
        assert_eq!(Kv::get(&s, b""), Err(StorageError::EmptyKey));
    }

    #[test]
    fn sets_keep_insertion_order_and_ignore_duplicates() {
        let s = SqliteStorage::open_in_memory().unwrap();
        s.add(b"sessions.buckets.7", b"b").unwrap();
        s.add(b"sessions.buckets.7", b"a").unwrap();
        s.add(b"sessions.buckets.7", b"b").unwrap();
        assert_eq!(s.all(b"sessions.buckets.7").unwrap(), vec![b"b".to_vec(), b"a".to_vec()]);

        SetStore::delete(&s, b"sessions.buckets.7", b"b").unwrap();
        assert_eq!(s.all(b"sessions.buckets.7").unwrap(), vec![b"a".to_vec()]);
        s.drop_all(b"sessions.buckets.7").unwrap();
        assert!(s.all(b"sessions.buckets.7").unwrap().is_empty());
    }

    #[test]
    fn reopen_sees_previous_writes() {
        let path = temp_db();
        {
            let s = SqliteStorage::open(&path).unwrap();
            s.set(b"timingwheel.next", b"42", SetOptions::default()).unwrap();
            s.add(b"sessions.hits.a", b"hit").unwrap();
            Kv::flush(&s).unwrap();
        }
        let s = SqliteStorage::open(&path).unwrap();
        assert_eq!(Kv::get(&s, b"timingwheel.next").unwrap().as_deref(), Some(&b"42"[..]));
        assert_eq!(s.all(b"sessions.hits.a").unwrap(), vec![b"hit".to_vec()]);
    }
}
